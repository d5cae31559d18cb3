use eyre::Context as _;
use fs2::FileExt as _;
use std::{
    fs::{self, File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn is_symlink(p: &Path) -> eyre::Result<bool> {
    let md = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    Ok(md.file_type().is_symlink())
}

pub fn ensure_private_dir(dir: &Path) -> eyre::Result<()> {
    if dir.exists() {
        if is_symlink(dir)? {
            eyre::bail!("refusing to use symlinked directory: {}", dir.display());
        }
        if !fs::metadata(dir)
            .with_context(|| format!("stat {}", dir.display()))?
            .is_dir()
        {
            eyre::bail!("expected directory at {}", dir.display());
        }
    } else {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }

    // Clamp group/other bits on Unix; other platforms keep their defaults.
    #[cfg(unix)]
    {
        let mode = fs::metadata(dir)
            .with_context(|| format!("stat {}", dir.display()))?
            .permissions()
            .mode();
        if (mode & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
                .with_context(|| format!("chmod {MODE_DIR_PRIVATE:o} {}", dir.display()))?;
        }
    }

    Ok(())
}

fn open_private(opts: &mut OpenOptions, path: &Path) -> eyre::Result<File> {
    #[cfg(unix)]
    {
        opts.mode(MODE_FILE_PRIVATE);
    }
    opts.open(path)
        .with_context(|| format!("open {}", path.display()))
}

fn tmp_path_for(path: &Path) -> eyre::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let mut suffix = [0_u8; 8];
    crate::keystore::crypto::fill_random(&mut suffix);
    Ok(parent.join(format!(".{base}.tmp.{}", hex::encode(suffix))))
}

/// Replace `path` with `bytes` via a fresh private temp file and a rename.
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    if path.exists() && is_symlink(path)? {
        eyre::bail!("refusing to write to symlink: {}", path.display());
    }

    let tmp = tmp_path_for(path)?;
    let mut f = open_private(OpenOptions::new().create_new(true).write(true), &tmp)?;
    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    // `rename` over an existing file fails on Windows.
    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
        }
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Read a file that may not exist yet. Symlinks are refused.
pub fn read_if_exists(path: &Path) -> eyre::Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    if is_symlink(path)? {
        eyre::bail!("refusing to read symlink: {}", path.display());
    }
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(s))
}

pub fn append_line_private(path: &Path, line: &str) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let mut f = open_private(OpenOptions::new().create(true).append(true), path)?;
    writeln!(f, "{line}").with_context(|| format!("append {}", path.display()))?;
    Ok(())
}

/// Advisory exclusive lock, released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(fs2::FileExt::unlock(&self.file));
    }
}

/// Take the lock without blocking. `Ok(None)` means another holder has it.
pub fn try_lock_exclusive(path: &Path) -> eyre::Result<Option<LockGuard>> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let file = open_private(
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false),
        path,
    )?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockGuard { file })),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(eyre::Report::new(e).wrap_err(format!("lock {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;

    #[test]
    fn atomic_write_replaces_content() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("nested").join("doc.json");
        write_atomic_private(&p, b"one")?;
        write_atomic_private(&p, b"two")?;
        let s = read_if_exists(&p)?.context("file must exist")?;
        assert_eq!(s, "two");

        // No temp files left behind.
        let leftovers = fs::read_dir(dir.path().join("nested"))?
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn missing_file_reads_as_none() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(read_if_exists(&dir.path().join("absent"))?.is_none());
        Ok(())
    }

    #[test]
    fn second_lock_holder_is_refused() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("vault.lock");
        let first = try_lock_exclusive(&p)?.context("first lock")?;
        assert!(try_lock_exclusive(&p)?.is_none());
        drop(first);
        assert!(try_lock_exclusive(&p)?.is_some());
        Ok(())
    }
}

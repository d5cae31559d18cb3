use crate::{errors::VaultError, fsutil::LockGuard};
use eyre::Context as _;
use serde_json::Value;
use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Persistence for the single JSON document that holds a vault.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    fn read(&self) -> eyre::Result<Option<Value>>;
    fn write(&self, doc: &Value) -> eyre::Result<()>;

    /// Read, transform and write back the document while holding exclusive access, so
    /// no other writer can land between the read and the write.
    fn update(
        &self,
        f: &mut dyn FnMut(Option<Value>) -> eyre::Result<Value>,
    ) -> eyre::Result<()>;
}

/// How long a writer waits for another process to release the document lock.
const LOCK_WAIT: Duration = Duration::from_secs(2);
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Vault document on disk, written atomically under an advisory lock shared by every
/// process that opens the same data dir.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStorage {
    pub const fn new(path: PathBuf, lock_path: PathBuf) -> Self {
        Self { path, lock_path }
    }

    /// `VaultBusy` once `LOCK_WAIT` passes without the lock coming free.
    fn lock(&self) -> eyre::Result<LockGuard> {
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            if let Some(guard) = crate::fsutil::try_lock_exclusive(&self.lock_path)? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(VaultError::VaultBusy.into());
            }
            std::thread::sleep(LOCK_POLL);
        }
    }

    fn write_locked(&self, doc: &Value) -> eyre::Result<()> {
        let s = serde_json::to_string_pretty(doc).context("serialize vault document")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes())
            .context("write vault document")
    }
}

impl StorageBackend for FileStorage {
    fn read(&self) -> eyre::Result<Option<Value>> {
        let Some(s) = crate::fsutil::read_if_exists(&self.path)? else {
            return Ok(None);
        };
        if s.trim().is_empty() {
            return Ok(None);
        }
        let v = serde_json::from_str(&s)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(v))
    }

    fn write(&self, doc: &Value) -> eyre::Result<()> {
        let _lock = self.lock()?;
        self.write_locked(doc)
    }

    fn update(
        &self,
        f: &mut dyn FnMut(Option<Value>) -> eyre::Result<Value>,
    ) -> eyre::Result<()> {
        let _lock = self.lock()?;
        let next = f(self.read()?)?;
        self.write_locked(&next)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    doc: Mutex<Option<Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Option<Value> {
        self.doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self) -> eyre::Result<Option<Value>> {
        Ok(self
            .doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn write(&self, doc: &Value) -> eyre::Result<()> {
        *self.doc.lock().unwrap_or_else(PoisonError::into_inner) = Some(doc.clone());
        Ok(())
    }

    fn update(
        &self,
        f: &mut dyn FnMut(Option<Value>) -> eyre::Result<Value>,
    ) -> eyre::Result<()> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        *doc = Some(f(doc.clone())?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;
    use serde_json::json;

    #[test]
    fn file_storage_roundtrip() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let st = FileStorage::new(dir.path().join("keys.json"), dir.path().join("keys.lock"));
        assert!(st.read()?.is_none());

        st.write(&json!({ "k1": { "public": { "name": "a" } } }))?;
        let v = st.read()?.context("document must exist")?;
        assert_eq!(
            v.pointer("/k1/public/name").and_then(Value::as_str),
            Some("a")
        );
        Ok(())
    }

    #[test]
    fn file_storage_reports_busy_while_locked() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = dir.path().join("keys.lock");
        let st = FileStorage::new(dir.path().join("keys.json"), lock.clone());

        let _held = crate::fsutil::try_lock_exclusive(&lock)?.context("hold lock")?;
        let err = st.write(&json!({})).err().context("write must fail")?;
        assert_eq!(
            err.downcast_ref::<VaultError>(),
            Some(&VaultError::VaultBusy)
        );
        Ok(())
    }

    #[test]
    fn failed_update_leaves_file_untouched() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let st = FileStorage::new(dir.path().join("keys.json"), dir.path().join("keys.lock"));
        st.write(&json!({ "a": 1 }))?;

        let res = st.update(&mut |_doc| Err(eyre::eyre!("abort")));
        assert!(res.is_err());
        assert_eq!(st.read()?, Some(json!({ "a": 1 })));

        st.update(&mut |doc| {
            let n = doc
                .as_ref()
                .and_then(|d| d.get("a"))
                .and_then(Value::as_i64)
                .unwrap_or_default();
            Ok(json!({ "a": n + 1 }))
        })?;
        assert_eq!(st.read()?, Some(json!({ "a": 2 })));
        Ok(())
    }

    #[test]
    fn memory_storage_starts_empty() -> eyre::Result<()> {
        let st = MemoryStorage::new();
        assert!(st.read()?.is_none());
        st.write(&json!({ "a": 1 }))?;
        assert_eq!(st.snapshot(), Some(json!({ "a": 1 })));
        Ok(())
    }
}

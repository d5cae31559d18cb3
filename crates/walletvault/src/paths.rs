use directories::ProjectDirs;
use eyre::ContextCompat as _;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct VaultPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    pub keys_file: PathBuf,
    pub audit_log: PathBuf,
    pub socket: PathBuf,
}

impl VaultPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("WALLETVAULT_DATA_DIR"),
            std::env::var("WALLETVAULT_CONFIG_DIR"),
        ) {
            return Ok(Self::from_dirs(
                PathBuf::from(config_dir),
                PathBuf::from(data_dir),
            ));
        }

        // macOS: ~/Library/Application Support/walletvault
        // Linux: ~/.config/walletvault, ~/.local/share/walletvault
        // Windows: %APPDATA%\walletvault
        let proj =
            ProjectDirs::from("", "", "walletvault").context("failed to resolve project dirs")?;
        Ok(Self::from_dirs(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn from_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            log_file: data_dir.join("walletvault.log.jsonl"),
            keys_file: data_dir.join("keys.json"),
            audit_log: data_dir.join("audit.jsonl"),
            socket: data_dir.join("walletvault.sock"),
            config_dir,
            data_dir,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Held for the duration of each vault document write.
    pub fn keys_lock(&self) -> PathBuf {
        self.data_dir.join("keys.lock")
    }

    /// Held for the lifetime of the daemon.
    pub fn daemon_lock(&self) -> PathBuf {
        self.data_dir.join("walletvault-daemon.lock")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }
}

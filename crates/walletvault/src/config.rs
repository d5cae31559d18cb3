use crate::{keystore::crypto::KdfParams, paths::VaultPaths};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Exit after this many seconds without clients. Unset runs until terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_exit_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Argon2id cost for newly sealed records. Existing records keep the parameters
    /// stored in their metadata.
    pub kdf: KdfParams,
    pub daemon: DaemonConfig,
    pub audit: AuditConfig,
}

impl VaultConfig {
    /// Clamped to what Argon2 accepts.
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf.memory_kib.max(8),
            iterations: self.kdf.iterations.max(1),
        }
    }
}

fn is_truthy_env(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(var = name, error = %e, "ignoring unparsable env override");
            None
        }
    }
}

fn apply_env_overrides(cfg: &mut VaultConfig) {
    if let Some(v) = env_u32("WALLETVAULT_KDF_ITERATIONS") {
        cfg.kdf.iterations = v;
    }
    if let Some(v) = env_u32("WALLETVAULT_KDF_MEMORY_KIB") {
        cfg.kdf.memory_kib = v;
    }
    if let Ok(v) = std::env::var("WALLETVAULT_AUDIT") {
        cfg.audit.enabled = is_truthy_env(&v);
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &VaultPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    /// Env overrides apply to the returned value only; they are never written back.
    pub fn load_or_init_default(&self) -> eyre::Result<VaultConfig> {
        let mut cfg = match crate::fsutil::read_if_exists(&self.path)? {
            Some(s) => toml::from_str(&s).context("parse config.toml")?,
            None => {
                let cfg = VaultConfig::default();
                self.save(&cfg)?;
                cfg
            }
        };
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &VaultConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes())
            .context("write config.toml")?;
        Ok(())
    }
}

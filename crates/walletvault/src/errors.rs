use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain failures of vault operations.
///
/// These travel inside `eyre::Report` and are recovered at the bus boundary with
/// `downcast_ref`, so every variant must stay `Clone`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("no key with ID {key_id}")]
    NotFound { key_id: String },

    #[error("key {key_id} has version {version}; use UpdateKeyTxAuth instead")]
    Version { key_id: String, version: u32 },

    #[error("{0}")]
    CapabilityUnavailable(String),

    #[error("App password has been set already.")]
    AppPasswordAlreadySet,

    #[error("App password has not been set yet.")]
    AppPasswordNotSet,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("re-encryption failed for {} key(s); no changes were written", failed.len())]
    BatchReencryption {
        failed: Vec<String>,
        reencrypted: Vec<String>,
    },

    #[error("vault busy; retry the operation")]
    VaultBusy,
}

impl VaultError {
    pub fn wrong_password() -> Self {
        Self::Unauthorized("Wrong password.".to_owned())
    }

    pub fn password_required() -> Self {
        Self::Unauthorized("Password required.".to_owned())
    }

    pub fn not_found(key_id: &str) -> Self {
        Self::NotFound {
            key_id: key_id.to_owned(),
        }
    }

    /// Stable wire name of the error kind.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UnauthorizedError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Version { .. } => "VersionError",
            Self::CapabilityUnavailable(_) => "CapabilityUnavailableError",
            Self::AppPasswordAlreadySet => "AppPasswordAlreadySetError",
            Self::AppPasswordNotSet => "AppPasswordNotSetError",
            Self::InvalidArguments(_) => "InvalidArgumentsError",
            Self::BatchReencryption { .. } => "BatchReencryptionError",
            Self::VaultBusy => "VaultBusyError",
        }
    }

    /// Wrong passwords and busy vaults may be retried; everything else is terminal for
    /// the operation unless the input changes.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::VaultBusy)
    }
}

/// Wiring and transport faults of the command bus. Not user-facing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no handler exposed for message type {0}")]
    MissingHandler(String),

    #[error("connection closed before the response to call {0} arrived")]
    ConnectionClosed(u64),

    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

/// Extra fields an error may carry across the serialization boundary.
///
/// Closed on purpose: only these typed fields are forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorExtra {
    #[serde(rename = "keyID", skip_serializing_if = "Option::is_none", default)]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u32>,
    #[serde(
        rename = "failedKeyIDs",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub failed_key_ids: Option<Vec<String>>,
    #[serde(
        rename = "reencryptedKeyIDs",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub reencrypted_key_ids: Option<Vec<String>>,
}

/// Wire form of an error: `{name, message, stack?, ...extra}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub extra: ErrorExtra,
}

/// An error envelope that does not name a known vault error kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl From<&VaultError> for SerializedError {
    fn from(e: &VaultError) -> Self {
        let extra = match e {
            VaultError::NotFound { key_id } => ErrorExtra {
                key_id: Some(key_id.clone()),
                ..ErrorExtra::default()
            },
            VaultError::Version { key_id, version } => ErrorExtra {
                key_id: Some(key_id.clone()),
                version: Some(*version),
                ..ErrorExtra::default()
            },
            VaultError::BatchReencryption {
                failed,
                reencrypted,
            } => ErrorExtra {
                failed_key_ids: Some(failed.clone()),
                reencrypted_key_ids: Some(reencrypted.clone()),
                ..ErrorExtra::default()
            },
            VaultError::Unauthorized(_)
            | VaultError::CapabilityUnavailable(_)
            | VaultError::AppPasswordAlreadySet
            | VaultError::AppPasswordNotSet
            | VaultError::InvalidArguments(_)
            | VaultError::VaultBusy => ErrorExtra::default(),
        };
        Self {
            name: e.name().to_owned(),
            message: e.to_string(),
            stack: None,
            extra,
        }
    }
}

impl SerializedError {
    /// Serialize a handler failure. Domain errors keep their kind and typed extras;
    /// anything else becomes a generic `Error` with the report chain as its stack.
    pub fn from_report(report: &eyre::Report) -> Self {
        if let Some(ve) = report.downcast_ref::<VaultError>() {
            let mut out = Self::from(ve);
            out.stack = Some(format!("{report:?}"));
            return out;
        }
        Self {
            name: "Error".to_owned(),
            message: format!("{report:#}"),
            stack: Some(format!("{report:?}")),
            extra: ErrorExtra::default(),
        }
    }

    /// Rebuild a typed error on the calling side.
    pub fn into_report(self) -> eyre::Report {
        let Self {
            name,
            message,
            stack,
            extra,
        } = self;
        let known = match name.as_str() {
            "UnauthorizedError" => Some(VaultError::Unauthorized(message.clone())),
            "NotFoundError" => extra
                .key_id
                .clone()
                .map(|key_id| VaultError::NotFound { key_id }),
            "VersionError" => extra
                .key_id
                .clone()
                .zip(extra.version)
                .map(|(key_id, version)| VaultError::Version { key_id, version }),
            "CapabilityUnavailableError" => {
                Some(VaultError::CapabilityUnavailable(message.clone()))
            }
            "AppPasswordAlreadySetError" => Some(VaultError::AppPasswordAlreadySet),
            "AppPasswordNotSetError" => Some(VaultError::AppPasswordNotSet),
            "InvalidArgumentsError" => Some(VaultError::InvalidArguments(
                message
                    .strip_prefix("invalid arguments: ")
                    .unwrap_or(&message)
                    .to_owned(),
            )),
            "BatchReencryptionError" => Some(VaultError::BatchReencryption {
                failed: extra.failed_key_ids.clone().unwrap_or_default(),
                reencrypted: extra.reencrypted_key_ids.clone().unwrap_or_default(),
            }),
            "VaultBusyError" => Some(VaultError::VaultBusy),
            _ => None,
        };
        match known {
            Some(ve) => eyre::Report::new(ve),
            None => eyre::Report::new(RemoteError {
                name,
                message,
                stack,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;

    #[test]
    fn not_found_carries_key_id_across_the_boundary() -> eyre::Result<()> {
        let wire = serde_json::to_value(SerializedError::from(&VaultError::not_found("k1")))?;
        assert_eq!(
            wire.get("name").and_then(|v| v.as_str()),
            Some("NotFoundError")
        );
        assert_eq!(wire.get("keyID").and_then(|v| v.as_str()), Some("k1"));
        assert!(wire.get("version").is_none());

        let back: SerializedError = serde_json::from_value(wire)?;
        let report = back.into_report();
        let ve = report
            .downcast_ref::<VaultError>()
            .context("must rebuild a vault error")?;
        assert_eq!(ve, &VaultError::not_found("k1"));
        Ok(())
    }

    #[test]
    fn unknown_reports_serialize_as_generic_error() -> eyre::Result<()> {
        let report = eyre::eyre!("disk on fire");
        let s = SerializedError::from_report(&report);
        assert_eq!(s.name, "Error");
        assert!(s.message.contains("disk on fire"));
        assert_eq!(s.extra, ErrorExtra::default());

        let back = s.into_report();
        let remote = back
            .downcast_ref::<RemoteError>()
            .context("generic errors stay remote")?;
        assert_eq!(remote.name, "Error");
        Ok(())
    }

    #[test]
    fn wrong_password_is_retryable_but_version_is_not() {
        assert!(VaultError::wrong_password().is_retryable());
        assert!(!VaultError::Version {
            key_id: "k".to_owned(),
            version: 1
        }
        .is_retryable());
        assert_eq!(VaultError::wrong_password().to_string(), "Wrong password.");
    }
}

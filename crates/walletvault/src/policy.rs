use crate::{errors::VaultError, rpc::BoxFuture};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};

/// How an operation proves it is authorized.
///
/// Used both as the app-level policy and as the per-key transaction policy. Values
/// outside this set fail to deserialize; an unknown policy is never read as
/// "unprotected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthPolicy {
    AlwaysPassword,
    BiometricAuth,
    Unprotected,
}

pub type TxAuthPolicy = AuthPolicy;

#[cfg(test)]
pub const ALL_POLICIES: [AuthPolicy; 3] = [
    AuthPolicy::AlwaysPassword,
    AuthPolicy::BiometricAuth,
    AuthPolicy::Unprotected,
];

/// A key is encrypted at rest iff either side insists on a password.
pub fn can_encrypt_key(app_policy: AuthPolicy, key_policy: Option<TxAuthPolicy>) -> bool {
    app_policy == AuthPolicy::AlwaysPassword || key_policy == Some(AuthPolicy::AlwaysPassword)
}

/// Checks an operation must pass when the app and the key each carry a policy.
///
/// Either side asking for a password or a biometric prompt is enough to require it.
/// Password checks come first so a wrong password fails before anyone is prompted.
pub fn required_checks(app_policy: AuthPolicy, key_policy: Option<TxAuthPolicy>) -> Vec<AuthPolicy> {
    let mut checks = Vec::with_capacity(2);
    for p in [Some(app_policy), key_policy].into_iter().flatten() {
        if p != AuthPolicy::Unprotected && !checks.contains(&p) {
            checks.push(p);
        }
    }
    checks.sort_by_key(|p| *p != AuthPolicy::AlwaysPassword);
    checks
}

/// Drop a supplied password when neither policy needs encryption, so a spurious prompt
/// never becomes a real encryption key.
pub fn effective_password(
    password: Option<&SecretString>,
    app_policy: AuthPolicy,
    key_policy: Option<TxAuthPolicy>,
) -> Option<SecretString> {
    if can_encrypt_key(app_policy, key_policy) {
        password.cloned()
    } else {
        None
    }
}

/// Treat an empty string the same as no password at all.
pub fn non_empty(password: Option<SecretString>) -> Option<SecretString> {
    password.filter(|p| !p.expose_secret().is_empty())
}

/// Host biometric ceremony. Rejections propagate to the caller unchanged.
pub trait BiometricPrompt: Send + Sync + std::fmt::Debug {
    fn is_available(&self) -> BoxFuture<'_, bool>;
    fn authenticate<'a>(&'a self, reason: &'a str) -> BoxFuture<'a, eyre::Result<()>>;
}

/// Hosts without a biometric sensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBiometrics;

impl BiometricPrompt for NoBiometrics {
    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { false })
    }

    fn authenticate<'a>(&'a self, _reason: &'a str) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async {
            Err(VaultError::CapabilityUnavailable(
                "Biometric authentication is not available on this device.".to_owned(),
            )
            .into())
        })
    }
}

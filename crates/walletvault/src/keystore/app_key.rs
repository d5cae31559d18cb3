use super::{crypto::CryptoAdapter, KeyStore, KeysData, APP_KEY_ID};
use crate::{
    errors::VaultError,
    policy::{AuthPolicy, BiometricPrompt},
};
use base64::Engine as _;
use eyre::Context as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq as _;
use zeroize::Zeroizing;

pub const APP_KEY_VERSION: u32 = 1;
const HASH_NONCE_LEN: usize = 16;

/// Public data of the app key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppKeyData {
    pub auth_policy: AuthPolicy,
    /// Base64 of `hash(nonce || password)`.
    pub password_hash: String,
    /// Base64 hash nonce.
    pub nonce: String,
    pub version: u32,
    #[serde(default)]
    pub password: bool,
}

impl AppKeyData {
    /// Fresh nonce and hash for `password`.
    pub fn new(
        crypto: &dyn CryptoAdapter,
        password: &SecretString,
        auth_policy: AuthPolicy,
    ) -> eyre::Result<Self> {
        let nonce = crypto.random_bytes(HASH_NONCE_LEN)?;
        let hash = crypto.create_password_hash(password.expose_secret().as_bytes(), &nonce);
        Ok(Self {
            auth_policy,
            password_hash: base64::engine::general_purpose::STANDARD.encode(hash),
            nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
            version: APP_KEY_VERSION,
            password: true,
        })
    }

    pub fn verify_password(
        &self,
        crypto: &dyn CryptoAdapter,
        supplied: Option<&SecretString>,
    ) -> eyre::Result<()> {
        let Some(pw) = supplied else {
            return Err(VaultError::wrong_password().into());
        };
        let nonce = base64::engine::general_purpose::STANDARD
            .decode(&self.nonce)
            .context("decode app key nonce")?;
        let stored = base64::engine::general_purpose::STANDARD
            .decode(&self.password_hash)
            .context("decode app password hash")?;
        let computed = crypto.create_password_hash(pw.expose_secret().as_bytes(), &nonce);
        if bool::from(computed.as_slice().ct_eq(stored.as_slice())) {
            Ok(())
        } else {
            Err(VaultError::wrong_password().into())
        }
    }
}

/// Check `supplied` against one policy.
///
/// `BiometricAuth` never falls back to anything weaker: a host without a sensor fails
/// with `CapabilityUnavailable`.
pub async fn authorize(
    policy: AuthPolicy,
    app: &AppKeyData,
    supplied: Option<&SecretString>,
    crypto: &dyn CryptoAdapter,
    biometrics: &dyn BiometricPrompt,
) -> eyre::Result<()> {
    match policy {
        AuthPolicy::AlwaysPassword => app.verify_password(crypto, supplied),
        AuthPolicy::Unprotected => Ok(()),
        AuthPolicy::BiometricAuth => {
            if !biometrics.is_available().await {
                return Err(VaultError::CapabilityUnavailable(
                    "Biometric authentication is not available on this device.".to_owned(),
                )
                .into());
            }
            biometrics.authenticate("Authorize wallet operation").await
        }
    }
}

/// The single app-level key record, stored next to user keys under a reserved ID.
#[derive(Debug, Clone)]
pub struct AppKey {
    store: KeyStore,
}

impl AppKey {
    pub const fn new(store: KeyStore) -> Self {
        Self { store }
    }

    pub fn has_been_set(&self) -> eyre::Result<bool> {
        Ok(self.store.load()?.contains_key(APP_KEY_ID))
    }

    pub fn get_data(&self) -> eyre::Result<AppKeyData> {
        if !self.has_been_set()? {
            return Err(VaultError::AppPasswordNotSet.into());
        }
        self.store.get_public_data(APP_KEY_ID)
    }

    /// First-time setup only.
    pub fn save(
        &self,
        private_key: &str,
        data: &AppKeyData,
        password: Option<SecretString>,
    ) -> eyre::Result<AppKeyData> {
        if self.has_been_set()? {
            return Err(VaultError::AppPasswordAlreadySet.into());
        }
        let blueprint = serde_json::to_value(data).context("serialize app key data")?;
        let public = self
            .store
            .save_key(APP_KEY_ID, password, private_key, blueprint)?;
        serde_json::from_value(public).context("parse app key data")
    }

    pub fn reencrypt_key(
        &self,
        new_password: Option<&SecretString>,
        prev_password: Option<&SecretString>,
        data: &AppKeyData,
    ) -> eyre::Result<()> {
        self.store
            .transaction(|doc| self.reencrypt_in(doc, new_password, prev_password, data))
    }

    /// Re-encrypt the app key and replace its public data inside an open document.
    pub fn reencrypt_in(
        &self,
        doc: &mut KeysData,
        new_password: Option<&SecretString>,
        prev_password: Option<&SecretString>,
        data: &AppKeyData,
    ) -> eyre::Result<()> {
        if !doc.contains_key(APP_KEY_ID) {
            return Err(VaultError::AppPasswordNotSet.into());
        }
        self.store
            .reencrypt_in(doc, APP_KEY_ID, new_password, prev_password)?;
        let rec = doc
            .get_mut(APP_KEY_ID)
            .ok_or(VaultError::AppPasswordNotSet)?;
        let protected = rec
            .public
            .get("password")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut public = data.clone();
        public.password = protected;
        rec.public = serde_json::to_value(&public).context("serialize app key data")?;
        Ok(())
    }

    pub fn decrypt_private_key(
        &self,
        password: Option<&SecretString>,
    ) -> eyre::Result<Zeroizing<String>> {
        self.store.decrypt_key(APP_KEY_ID, password)
    }

    pub fn update_data(&self, data: &AppKeyData) -> eyre::Result<AppKeyData> {
        if !self.has_been_set()? {
            return Err(VaultError::AppPasswordNotSet.into());
        }
        let updated = serde_json::to_value(data).context("serialize app key data")?;
        let public = self.store.update_public_data(APP_KEY_ID, updated)?;
        serde_json::from_value(public).context("parse app key data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{crypto::HostCrypto, test_store};
    use crate::policy::NoBiometrics;
    use eyre::ContextCompat as _;

    fn pw(s: &str) -> SecretString {
        SecretString::new(s.to_owned().into())
    }

    fn setup(policy: AuthPolicy) -> eyre::Result<(AppKey, KeyStore, AppKeyData)> {
        let (ks, _) = test_store();
        let app = AppKey::new(ks.clone());
        let data = AppKeyData::new(&HostCrypto, &pw("hunter2"), policy)?;
        let saved = app.save("APP-SECRET", &data, Some(pw("hunter2")))?;
        Ok((app, ks, saved))
    }

    #[test]
    fn unset_app_key_has_no_data() -> eyre::Result<()> {
        let (ks, _) = test_store();
        let app = AppKey::new(ks);
        assert!(!app.has_been_set()?);
        let err = app.get_data().err().context("must fail")?;
        assert_eq!(
            err.downcast_ref::<VaultError>(),
            Some(&VaultError::AppPasswordNotSet)
        );
        Ok(())
    }

    #[test]
    fn second_save_is_rejected() -> eyre::Result<()> {
        let (app, ks, data) = setup(AuthPolicy::AlwaysPassword)?;
        assert!(app.has_been_set()?);
        assert!(data.password);
        let err = app
            .save("OTHER", &data, None)
            .err()
            .context("second save must fail")?;
        assert_eq!(
            err.downcast_ref::<VaultError>(),
            Some(&VaultError::AppPasswordAlreadySet)
        );
        // The app key never shows up as a user key.
        assert!(ks.all_key_ids()?.is_empty());
        Ok(())
    }

    #[test]
    fn password_verification_uses_salted_hash() -> eyre::Result<()> {
        let (_, _, data) = setup(AuthPolicy::AlwaysPassword)?;
        data.verify_password(&HostCrypto, Some(&pw("hunter2")))?;
        assert!(data.verify_password(&HostCrypto, Some(&pw("hunter3"))).is_err());
        assert!(data.verify_password(&HostCrypto, None).is_err());
        Ok(())
    }

    #[test]
    fn reencrypt_rotates_password_and_public_data() -> eyre::Result<()> {
        let (app, _, _) = setup(AuthPolicy::AlwaysPassword)?;
        let next = AppKeyData::new(&HostCrypto, &pw("new-pw"), AuthPolicy::Unprotected)?;
        app.reencrypt_key(Some(&pw("new-pw")), Some(&pw("hunter2")), &next)?;

        assert_eq!(
            app.decrypt_private_key(Some(&pw("new-pw")))?.as_str(),
            "APP-SECRET"
        );
        assert!(app.decrypt_private_key(Some(&pw("hunter2"))).is_err());
        let data = app.get_data()?;
        assert_eq!(data.auth_policy, AuthPolicy::Unprotected);
        data.verify_password(&HostCrypto, Some(&pw("new-pw")))?;
        Ok(())
    }

    #[test]
    fn update_data_keeps_encryption() -> eyre::Result<()> {
        let (app, _, data) = setup(AuthPolicy::AlwaysPassword)?;
        let mut changed = data.clone();
        changed.auth_policy = AuthPolicy::BiometricAuth;
        changed.password = false;
        let out = app.update_data(&changed)?;
        assert_eq!(out.auth_policy, AuthPolicy::BiometricAuth);
        assert!(out.password);
        assert_eq!(
            app.decrypt_private_key(Some(&pw("hunter2")))?.as_str(),
            "APP-SECRET"
        );
        Ok(())
    }

    #[tokio::test]
    async fn authorize_follows_policy() -> eyre::Result<()> {
        let (_, _, data) = setup(AuthPolicy::AlwaysPassword)?;
        let right = pw("hunter2");
        let wrong = pw("nope");

        authorize(
            AuthPolicy::AlwaysPassword,
            &data,
            Some(&right),
            &HostCrypto,
            &NoBiometrics,
        )
        .await?;
        let err = authorize(
            AuthPolicy::AlwaysPassword,
            &data,
            Some(&wrong),
            &HostCrypto,
            &NoBiometrics,
        )
        .await
        .err()
        .context("wrong password must fail")?;
        assert_eq!(
            err.downcast_ref::<VaultError>(),
            Some(&VaultError::wrong_password())
        );

        authorize(AuthPolicy::Unprotected, &data, None, &HostCrypto, &NoBiometrics).await?;

        let err = authorize(
            AuthPolicy::BiometricAuth,
            &data,
            Some(&right),
            &HostCrypto,
            &NoBiometrics,
        )
        .await
        .err()
        .context("biometrics unavailable must fail")?;
        assert!(matches!(
            err.downcast_ref::<VaultError>(),
            Some(VaultError::CapabilityUnavailable(_))
        ));
        Ok(())
    }
}

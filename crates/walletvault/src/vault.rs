//! Vault orchestrator: the only place where the key store, the app key, the policy
//! engine and the signer meet. Every command of the bus surface is one method here.

use crate::{
    audit::AuditLog,
    config::VaultConfig,
    errors::{ProtocolError, VaultError},
    keystore::{
        app_key::{authorize, AppKey, AppKeyData},
        crypto::{CryptoAdapter, HostCrypto, KdfParams},
        storage::StorageBackend,
        KeyStore, APP_KEY_ID,
    },
    paths::VaultPaths,
    policy::{
        can_encrypt_key, effective_password, non_empty, required_checks, BiometricPrompt,
        NoBiometrics, TxAuthPolicy,
    },
    rpc::{
        bus::CommandBus,
        commands::{
            Command, CreateKey, GetAppKeyMetadata, GetKeyIDs, GetPrivateKey, GetPublicKeyData,
            HasSetAppPassword, RemoveKey, RenameKey, SetUpAppPassword, SignTransaction,
            UpdateAppPassword, UpdateKeyPassword, UpdateKeyTxAuth,
        },
        envelope::MessageType,
    },
    signer::{Ed25519EnvelopeSigner, Network, TransactionSigner},
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{future::Future, sync::Arc};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Schema version stamped on keys created or migrated by this vault. Keys below it
/// predate per-key transaction policies.
pub const KEY_SCHEMA_VERSION: u32 = 1;

/// Public metadata of a user key. Unknown fields are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyPublicData {
    pub name: String,
    pub password: bool,
    pub testnet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_auth: Option<TxAuthPolicy>,
    pub version: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `options` argument of `CreateKey`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyCreationOptions {
    pub name: String,
    pub testnet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_auth: Option<TxAuthPolicy>,
}

/// Collaborators a vault is assembled from.
#[derive(Debug)]
pub struct VaultParts {
    pub storage: Arc<dyn StorageBackend>,
    pub crypto: Arc<dyn CryptoAdapter>,
    pub biometrics: Arc<dyn BiometricPrompt>,
    pub signer: Arc<dyn TransactionSigner>,
    pub kdf: KdfParams,
    pub audit: Option<AuditLog>,
}

#[derive(Debug)]
pub struct Vault {
    store: KeyStore,
    app_key: AppKey,
    crypto: Arc<dyn CryptoAdapter>,
    biometrics: Arc<dyn BiometricPrompt>,
    signer: Arc<dyn TransactionSigner>,
    audit: Option<AuditLog>,
    /// Serializes every read-modify-write of the vault document.
    write_gate: tokio::sync::Mutex<()>,
}

fn unauthorized(e: &eyre::Report) -> eyre::Report {
    debug!(error = %e, "key lookup failed; reporting as wrong password");
    VaultError::wrong_password().into()
}

fn user_key_id(key_id: &str) -> eyre::Result<()> {
    if key_id.is_empty() {
        return Err(VaultError::InvalidArguments("keyID must not be empty".to_owned()).into());
    }
    if key_id == APP_KEY_ID {
        return Err(VaultError::InvalidArguments(format!("keyID {APP_KEY_ID} is reserved")).into());
    }
    Ok(())
}

impl Vault {
    pub fn new(parts: VaultParts) -> Self {
        let store = KeyStore::new(parts.storage, Arc::clone(&parts.crypto), parts.kdf);
        Self {
            app_key: AppKey::new(store.clone()),
            store,
            crypto: parts.crypto,
            biometrics: parts.biometrics,
            signer: parts.signer,
            audit: parts.audit,
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Vault over `storage` with this host's collaborators: OS randomness, no biometric
    /// sensor, and the built-in envelope signer.
    pub fn for_host(storage: Arc<dyn StorageBackend>, paths: &VaultPaths, cfg: &VaultConfig) -> Self {
        Self::new(VaultParts {
            storage,
            crypto: Arc::new(HostCrypto),
            biometrics: Arc::new(NoBiometrics),
            signer: Arc::new(Ed25519EnvelopeSigner),
            kdf: cfg.kdf_params(),
            audit: cfg
                .audit
                .enabled
                .then(|| AuditLog::new(paths.audit_log.clone())),
        })
    }

    /// Expose every command on a fresh bus. Fails if any message type is left unwired.
    pub fn into_bus(self) -> Result<CommandBus, ProtocolError> {
        let vault = Arc::new(self);
        let mut bus = CommandBus::new();
        route(&mut bus, &vault, |v, c: CreateKey| async move { v.create_key(c).await });
        route(&mut bus, &vault, |v, _: GetAppKeyMetadata| async move {
            v.get_app_key_metadata()
        });
        route(&mut bus, &vault, |v, _: GetKeyIDs| async move { v.store.all_key_ids() });
        route(&mut bus, &vault, |v, c: GetPublicKeyData| async move {
            v.get_public_key_data(&c.key_id)
        });
        route(&mut bus, &vault, |v, c: GetPrivateKey| async move {
            v.get_private_key(c).await
        });
        route(&mut bus, &vault, |v, _: HasSetAppPassword| async move {
            v.app_key.has_been_set()
        });
        route(&mut bus, &vault, |v, c: RemoveKey| async move { v.remove_key(c).await });
        route(&mut bus, &vault, |v, c: RenameKey| async move { v.rename_key(c).await });
        route(&mut bus, &vault, |v, c: SetUpAppPassword| async move {
            v.set_up_app_password(c).await
        });
        route(&mut bus, &vault, |v, c: SignTransaction| async move {
            v.sign_transaction(c).await
        });
        route(&mut bus, &vault, |v, c: UpdateAppPassword| async move {
            v.update_app_password(c).await
        });
        route(&mut bus, &vault, |v, c: UpdateKeyPassword| async move {
            v.update_key_password(c).await
        });
        route(&mut bus, &vault, |v, c: UpdateKeyTxAuth| async move {
            v.update_key_tx_auth(c).await
        });
        bus.ensure_complete()?;
        Ok(bus)
    }

    fn audit_outcome<T>(&self, command: MessageType, key_id: Option<&str>, out: &eyre::Result<T>) {
        let Some(log) = &self.audit else {
            return;
        };
        let error_name = out.as_ref().err().map(|e| {
            e.downcast_ref::<VaultError>()
                .map_or("Error", VaultError::name)
        });
        log.record(command.as_str(), key_id, error_name);
    }

    async fn audited<T>(
        &self,
        command: MessageType,
        key_id: Option<&str>,
        op: impl Future<Output = eyre::Result<T>> + Send,
    ) -> eyre::Result<T> {
        let out = op.await;
        self.audit_outcome(command, key_id, &out);
        out
    }

    /// Run a mutating command under the write gate.
    async fn gated<T>(
        &self,
        command: MessageType,
        key_id: Option<&str>,
        op: impl Future<Output = eyre::Result<T>> + Send,
    ) -> eyre::Result<T> {
        let _gate = self.write_gate.lock().await;
        self.audited(command, key_id, op).await
    }

    /// Authorization for a key that is not encrypted at rest, where decrypting proves
    /// nothing. Both the app policy and the key policy are enforced. Without an app key
    /// there is no policy to enforce.
    async fn authorize_unencrypted(
        &self,
        key_policy: Option<TxAuthPolicy>,
        password: Option<&SecretString>,
    ) -> eyre::Result<()> {
        if !self.app_key.has_been_set()? {
            return Ok(());
        }
        let app = self.app_key.get_data()?;
        for policy in required_checks(app.auth_policy, key_policy) {
            authorize(
                policy,
                &app,
                password,
                self.crypto.as_ref(),
                self.biometrics.as_ref(),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn create_key(&self, c: CreateKey) -> eyre::Result<KeyPublicData> {
        let key_id = c.key_id.clone();
        self.gated(MessageType::CreateKey, Some(&key_id), async move {
            user_key_id(&c.key_id)?;
            let app = self.app_key.get_data()?;
            let tx_auth = c.options.tx_auth;
            let encrypt = can_encrypt_key(app.auth_policy, tx_auth);
            let password = non_empty(effective_password(
                c.password.as_ref(),
                app.auth_policy,
                tx_auth,
            ));
            if encrypt {
                // Keys are sealed with the app password so a later password change can
                // re-encrypt them.
                let Some(pw) = password.as_ref() else {
                    return Err(VaultError::password_required().into());
                };
                app.verify_password(self.crypto.as_ref(), Some(pw))?;
            }

            let blueprint = KeyPublicData {
                name: c.options.name,
                password: encrypt,
                testnet: c.options.testnet,
                tx_auth,
                version: KEY_SCHEMA_VERSION,
                extra: Map::new(),
            };
            let public = self.store.save_key(
                &c.key_id,
                password,
                c.private_key.expose_secret(),
                serde_json::to_value(&blueprint)?,
            )?;
            info!(key_id = %c.key_id, encrypted = encrypt, "key created");
            Ok(serde_json::from_value(public)?)
        })
        .await
    }

    pub fn get_app_key_metadata(&self) -> eyre::Result<Option<AppKeyData>> {
        if !self.app_key.has_been_set()? {
            return Ok(None);
        }
        Ok(Some(self.app_key.get_data()?))
    }

    pub fn get_public_key_data(&self, key_id: &str) -> eyre::Result<KeyPublicData> {
        if key_id == APP_KEY_ID {
            return Err(VaultError::not_found(key_id).into());
        }
        self.store.get_public_data(key_id)
    }

    pub async fn get_private_key(&self, c: GetPrivateKey) -> eyre::Result<String> {
        self.audited(MessageType::GetPrivateKey, Some(&c.key_id), async {
            let public = self
                .get_public_key_data(&c.key_id)
                .map_err(|e| unauthorized(&e))?;
            if !public.password {
                // Exporting follows the app policy, not the signing policy.
                self.authorize_unencrypted(None, c.password.as_ref()).await?;
            }
            let key = self.store.decrypt_key(&c.key_id, c.password.as_ref())?;
            Ok(key.as_str().to_owned())
        })
        .await
    }

    pub async fn remove_key(&self, c: RemoveKey) -> eyre::Result<()> {
        self.gated(MessageType::RemoveKey, Some(&c.key_id), async {
            self.app_key.get_data()?;
            if c.key_id == APP_KEY_ID {
                return Err(
                    VaultError::InvalidArguments("the app key cannot be removed".to_owned()).into(),
                );
            }
            self.store.remove_key(&c.key_id)?;
            info!(key_id = %c.key_id, "key removed");
            Ok(())
        })
        .await
    }

    pub async fn rename_key(&self, c: RenameKey) -> eyre::Result<()> {
        self.gated(MessageType::RenameKey, Some(&c.key_id), async {
            self.app_key.get_data()?;
            if c.key_id == APP_KEY_ID {
                return Err(VaultError::not_found(&c.key_id).into());
            }
            self.store
                .update_public_data(&c.key_id, json!({ "name": c.new_name }))?;
            Ok(())
        })
        .await
    }

    pub async fn set_up_app_password(&self, c: SetUpAppPassword) -> eyre::Result<AppKeyData> {
        self.gated(MessageType::SetUpAppPassword, None, async move {
            if self.app_key.has_been_set()? {
                return Err(VaultError::AppPasswordAlreadySet.into());
            }
            let password =
                non_empty(Some(c.password)).ok_or_else(VaultError::password_required)?;
            let private_key = if c.private_key.expose_secret().is_empty() {
                Zeroizing::new(hex::encode(self.crypto.random_bytes(32)?))
            } else {
                Zeroizing::new(c.private_key.expose_secret().to_owned())
            };
            let data = AppKeyData::new(self.crypto.as_ref(), &password, c.auth_policy)?;
            let saved = self.app_key.save(&private_key, &data, Some(password))?;
            info!(auth_policy = ?c.auth_policy, "app password set up");
            Ok(saved)
        })
        .await
    }

    /// Decrypt failures and unknown keys are both reported as a wrong password.
    pub async fn sign_transaction(&self, c: SignTransaction) -> eyre::Result<String> {
        self.audited(MessageType::SignTransaction, Some(&c.key_id), async {
            self.app_key.get_data()?;
            let public = self
                .get_public_key_data(&c.key_id)
                .map_err(|e| unauthorized(&e))?;
            if !public.password {
                self.authorize_unencrypted(public.tx_auth, c.password.as_ref())
                    .await?;
            }
            let private_key = self.store.decrypt_key(&c.key_id, c.password.as_ref())?;
            let network = Network::from_testnet_flag(public.testnet);
            let signed = self
                .signer
                .sign(&c.transaction_envelope, &private_key, network)?;
            info!(key_id = %c.key_id, ?network, "transaction signed");
            Ok(signed)
        })
        .await
    }

    /// Rotate the app password and re-encrypt every migrated, password-protected key.
    ///
    /// All re-encryptions land in one document write together with the new app key.
    /// If any key fails, nothing is written and the error lists which keys failed and
    /// which would have been re-encrypted.
    pub async fn update_app_password(&self, c: UpdateAppPassword) -> eyre::Result<()> {
        self.gated(MessageType::UpdateAppPassword, None, async move {
            let app = self.app_key.get_data()?;
            authorize(
                app.auth_policy,
                &app,
                c.prev_password.as_ref(),
                self.crypto.as_ref(),
                self.biometrics.as_ref(),
            )
            .await?;
            // The app key itself is always sealed with the app password.
            app.verify_password(self.crypto.as_ref(), c.prev_password.as_ref())?;
            let prev = c.prev_password;
            let new_password =
                non_empty(Some(c.new_password)).ok_or_else(VaultError::password_required)?;
            let new_data = AppKeyData::new(self.crypto.as_ref(), &new_password, c.auth_policy)?;

            let reencrypted = self.store.transaction(|doc| {
                self.app_key
                    .reencrypt_in(doc, Some(&new_password), prev.as_ref(), &new_data)?;

                let targets: Vec<(String, Value)> = doc
                    .iter()
                    .filter(|(id, _)| id.as_str() != APP_KEY_ID)
                    .map(|(id, rec)| (id.clone(), rec.public.clone()))
                    .collect();
                let mut done = Vec::new();
                let mut failed = Vec::new();
                for (key_id, public) in targets {
                    let outcome = match serde_json::from_value::<KeyPublicData>(public) {
                        Ok(p) if p.version < KEY_SCHEMA_VERSION || !p.password => continue,
                        Ok(p) => {
                            let next =
                                effective_password(Some(&new_password), c.auth_policy, p.tx_auth);
                            self.store
                                .reencrypt_in(doc, &key_id, next.as_ref(), prev.as_ref())
                        }
                        Err(e) => Err(e.into()),
                    };
                    match outcome {
                        Ok(()) => done.push(key_id),
                        Err(e) => {
                            warn!(key_id = %key_id, error = %e, "key re-encryption failed");
                            failed.push(key_id);
                        }
                    }
                }
                if !failed.is_empty() {
                    return Err(VaultError::BatchReencryption {
                        failed,
                        reencrypted: done,
                    }
                    .into());
                }
                Ok(done.len())
            })?;
            info!(reencrypted, auth_policy = ?c.auth_policy, "app password updated");
            Ok(())
        })
        .await
    }

    pub async fn update_key_tx_auth(&self, c: UpdateKeyTxAuth) -> eyre::Result<KeyPublicData> {
        let key_id = c.key_id.clone();
        self.gated(MessageType::UpdateKeyTxAuth, Some(&key_id), async move {
            let app = self.app_key.get_data()?;
            let public = self.get_public_key_data(&c.key_id)?;
            authorize(
                app.auth_policy,
                &app,
                c.password.as_ref(),
                self.crypto.as_ref(),
                self.biometrics.as_ref(),
            )
            .await?;

            let password = non_empty(c.password);
            let encrypt = can_encrypt_key(app.auth_policy, Some(c.tx_auth));
            if encrypt {
                let Some(pw) = password.as_ref() else {
                    return Err(VaultError::password_required().into());
                };
                app.verify_password(self.crypto.as_ref(), Some(pw))?;
            }
            let next = if encrypt { password.as_ref() } else { None };
            let prev = if public.password {
                password.as_ref()
            } else {
                None
            };

            let updated = self.store.transaction(|doc| {
                self.store.reencrypt_in(doc, &c.key_id, next, prev)?;
                let rec = doc
                    .get_mut(&c.key_id)
                    .ok_or_else(|| VaultError::not_found(&c.key_id))?;
                let mut p: KeyPublicData = serde_json::from_value(rec.public.clone())?;
                p.tx_auth = Some(c.tx_auth);
                p.version = p.version.max(KEY_SCHEMA_VERSION);
                rec.public = serde_json::to_value(&p)?;
                Ok(p)
            })?;
            info!(key_id = %c.key_id, tx_auth = ?c.tx_auth, encrypted = encrypt, "key tx auth updated");
            Ok(updated)
        })
        .await
    }

    /// Legacy path for keys that predate per-key policies.
    pub async fn update_key_password(&self, c: UpdateKeyPassword) -> eyre::Result<()> {
        let key_id = c.key_id.clone();
        self.gated(MessageType::UpdateKeyPassword, Some(&key_id), async move {
            self.app_key.get_data()?;
            let public = self.get_public_key_data(&c.key_id)?;
            if public.version >= KEY_SCHEMA_VERSION {
                return Err(VaultError::Version {
                    key_id: c.key_id,
                    version: public.version,
                }
                .into());
            }
            warn!(key_id = %c.key_id, "deprecated UpdateKeyPassword used");
            self.store
                .reencrypt_key(&c.key_id, c.password, c.prev_password)
        })
        .await
    }
}

fn route<C, F, Fut>(bus: &mut CommandBus, vault: &Arc<Vault>, f: F)
where
    C: Command,
    F: Fn(Arc<Vault>, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<C::Output>> + Send + 'static,
{
    let vault = Arc::clone(vault);
    bus.expose(move |cmd: C| f(Arc::clone(&vault), cmd));
}

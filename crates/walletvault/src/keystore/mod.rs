pub mod app_key;
pub mod crypto;
pub mod storage;

use crate::{errors::VaultError, policy::non_empty};
use base64::Engine as _;
use crypto::{CryptoAdapter, KdfParams};
use eyre::Context as _;
use secrecy::SecretString;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc};
use storage::StorageBackend;
use tracing::debug;
use zeroize::Zeroizing;

/// Reserved record ID of the app key. Never listed as a user key.
pub const APP_KEY_ID: &str = "__app_key__";

/// Parameters needed to re-derive a record's encryption key from a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Base64 Argon2 salt.
    pub nonce: String,
    pub iterations: u32,
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
}

fn default_memory_kib() -> u32 {
    KdfParams::default().memory_kib
}

impl RecordMetadata {
    const fn kdf(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
        }
    }
}

/// One persisted record: `{metadata, public, private}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub metadata: RecordMetadata,
    pub public: Value,
    pub private: String,
}

impl StoredRecord {
    fn is_password_protected(&self) -> bool {
        self.public
            .get("password")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The whole vault document, keyed by record ID.
pub type KeysData = BTreeMap<String, StoredRecord>;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivateData {
    private_key: String,
}

/// Encrypted-at-rest collection of named key records.
#[derive(Debug, Clone)]
pub struct KeyStore {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoAdapter>,
    kdf: KdfParams,
}

impl KeyStore {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoAdapter>,
        kdf: KdfParams,
    ) -> Self {
        Self {
            storage,
            crypto,
            kdf,
        }
    }

    pub fn load(&self) -> eyre::Result<KeysData> {
        parse_document(self.storage.read()?)
    }

    /// Load, mutate, and write back only if `f` succeeds.
    ///
    /// The whole cycle runs under the backend's exclusive access, so writers in other
    /// processes cannot interleave with it.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut KeysData) -> eyre::Result<R>,
    ) -> eyre::Result<R> {
        let mut body = Some(f);
        let mut out = None;
        self.storage.update(&mut |doc| {
            let body = body
                .take()
                .ok_or_else(|| eyre::eyre!("transaction body already ran"))?;
            let mut data = parse_document(doc)?;
            out = Some(body(&mut data)?);
            serde_json::to_value(&data).context("serialize vault document")
        })?;
        out.ok_or_else(|| eyre::eyre!("transaction finished without a result"))
    }

    pub fn all_key_ids(&self) -> eyre::Result<Vec<String>> {
        Ok(self
            .load()?
            .into_keys()
            .filter(|id| id != APP_KEY_ID)
            .collect())
    }

    pub fn get_public_data<T: DeserializeOwned>(&self, key_id: &str) -> eyre::Result<T> {
        let data = self.load()?;
        let rec = data
            .get(key_id)
            .ok_or_else(|| VaultError::not_found(key_id))?;
        serde_json::from_value(rec.public.clone())
            .with_context(|| format!("parse public data of {key_id}"))
    }

    /// Decrypt a record's private key.
    ///
    /// Unknown IDs, wrong passwords and corrupted records all fail the same way.
    pub fn decrypt_key(
        &self,
        key_id: &str,
        password: Option<&SecretString>,
    ) -> eyre::Result<Zeroizing<String>> {
        let data = self.load()?;
        let rec = data
            .get(key_id)
            .ok_or_else(VaultError::wrong_password)?;
        self.open_record(key_id, rec, password)
    }

    /// Create or overwrite a record. `public.password` is stamped from whether a
    /// non-empty password was given.
    pub fn save_key(
        &self,
        key_id: &str,
        password: Option<SecretString>,
        private_key: &str,
        blueprint: Value,
    ) -> eyre::Result<Value> {
        let record = self.seal_record(key_id, non_empty(password).as_ref(), private_key, blueprint)?;
        let public = record.public.clone();
        self.transaction(|data| {
            data.insert(key_id.to_owned(), record);
            Ok(())
        })?;
        debug!(key_id, "saved key record");
        Ok(public)
    }

    /// Merge top-level public fields. The encrypted payload and the `password` flag are
    /// left untouched.
    pub fn update_public_data(&self, key_id: &str, updated: Value) -> eyre::Result<Value> {
        self.transaction(|data| {
            let rec = data
                .get_mut(key_id)
                .ok_or_else(|| VaultError::not_found(key_id))?;
            let protected = rec.is_password_protected();
            let mut merged = into_object(rec.public.clone())?;
            merged.extend(into_object(updated)?);
            merged.insert("password".to_owned(), Value::Bool(protected));
            rec.public = Value::Object(merged);
            Ok(rec.public.clone())
        })
    }

    pub fn reencrypt_key(
        &self,
        key_id: &str,
        new_password: Option<SecretString>,
        prev_password: Option<SecretString>,
    ) -> eyre::Result<()> {
        self.transaction(|data| {
            self.reencrypt_in(data, key_id, new_password.as_ref(), prev_password.as_ref())
        })?;
        debug!(key_id, "re-encrypted key record");
        Ok(())
    }

    /// Re-encrypt one record inside an open document, for batch callers.
    pub fn reencrypt_in(
        &self,
        data: &mut KeysData,
        key_id: &str,
        new_password: Option<&SecretString>,
        prev_password: Option<&SecretString>,
    ) -> eyre::Result<()> {
        let rec = data.get(key_id).ok_or_else(VaultError::wrong_password)?;
        let private_key = self.open_record(key_id, rec, prev_password)?;
        let new_password = non_empty(new_password.cloned());
        let resealed =
            self.seal_record(key_id, new_password.as_ref(), &private_key, rec.public.clone())?;
        data.insert(key_id.to_owned(), resealed);
        Ok(())
    }

    /// Removing an absent key is not an error.
    pub fn remove_key(&self, key_id: &str) -> eyre::Result<()> {
        self.transaction(|data| {
            if data.remove(key_id).is_none() {
                debug!(key_id, "remove of absent key ignored");
            }
            Ok(())
        })
    }

    fn seal_record(
        &self,
        key_id: &str,
        password: Option<&SecretString>,
        private_key: &str,
        blueprint: Value,
    ) -> eyre::Result<StoredRecord> {
        let salt = self.crypto.random_bytes(crypto::SALT_LEN)?;
        if salt.len() != crypto::SALT_LEN {
            eyre::bail!("crypto adapter returned {} salt bytes", salt.len());
        }
        let key = crypto::derive_record_key(password, &salt, self.kdf, key_id)?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&PrivateData {
                private_key: private_key.to_owned(),
            })
            .context("serialize private data")?,
        );
        let private = crypto::seal(&key, &plaintext)?;

        let mut public = into_object(blueprint)?;
        public.insert("password".to_owned(), Value::Bool(password.is_some()));

        Ok(StoredRecord {
            metadata: RecordMetadata {
                nonce: base64::engine::general_purpose::STANDARD.encode(salt),
                iterations: self.kdf.iterations,
                memory_kib: self.kdf.memory_kib,
            },
            public: Value::Object(public),
            private,
        })
    }

    fn open_record(
        &self,
        key_id: &str,
        rec: &StoredRecord,
        password: Option<&SecretString>,
    ) -> eyre::Result<Zeroizing<String>> {
        // Unprotected records always open with the empty password.
        let password = if rec.is_password_protected() {
            password
        } else {
            None
        };
        let opened = (|| -> eyre::Result<Zeroizing<String>> {
            let salt = base64::engine::general_purpose::STANDARD.decode(&rec.metadata.nonce)?;
            let key = crypto::derive_record_key(password, &salt, rec.metadata.kdf(), key_id)?;
            let plaintext = crypto::open(&key, &rec.private)?;
            let parsed: PrivateData = serde_json::from_slice(&plaintext)?;
            Ok(Zeroizing::new(parsed.private_key))
        })();
        opened.map_err(|e| {
            debug!(key_id, error = %e, "record did not open");
            VaultError::wrong_password().into()
        })
    }
}

fn parse_document(doc: Option<Value>) -> eyre::Result<KeysData> {
    match doc {
        Some(doc) => serde_json::from_value(doc).context("parse vault document"),
        None => Ok(KeysData::new()),
    }
}

fn into_object(v: Value) -> eyre::Result<Map<String, Value>> {
    match v {
        Value::Object(m) => Ok(m),
        Value::Null => Ok(Map::new()),
        other @ (Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Array(_)) => {
            Err(VaultError::InvalidArguments(format!(
                "public key data must be an object, got {other}"
            ))
            .into())
        }
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (KeyStore, Arc<storage::MemoryStorage>) {
    let mem = Arc::new(storage::MemoryStorage::new());
    let ks = KeyStore::new(
        Arc::clone(&mem) as Arc<dyn StorageBackend>,
        Arc::new(crypto::HostCrypto),
        KdfParams::FAST,
    );
    (ks, mem)
}

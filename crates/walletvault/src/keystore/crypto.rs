use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use eyre::Context as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
const AES_NONCE_LEN: usize = 12;

/// Host-supplied primitives: salted password hashing and secure randomness.
pub trait CryptoAdapter: Send + Sync + std::fmt::Debug {
    /// Deterministic digest of `nonce || password`, compared for equality on verify.
    fn create_password_hash(&self, password: &[u8], nonce: &[u8]) -> Vec<u8>;

    /// `n` bytes from a CSPRNG. Must fail rather than return weak output.
    fn random_bytes(&self, n: usize) -> eyre::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostCrypto;

impl CryptoAdapter for HostCrypto {
    fn create_password_hash(&self, password: &[u8], nonce: &[u8]) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(nonce);
        h.update(password);
        h.finalize().to_vec()
    }

    fn random_bytes(&self, n: usize) -> eyre::Result<Vec<u8>> {
        let mut out = vec![0_u8; n];
        fill_random(&mut out);
        Ok(out)
    }
}

// The thread RNG is seeded from the OS and panics if the OS source is unavailable.
pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

/// Argon2id cost parameters, persisted with every record so old records stay readable
/// after the configured defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Matches `argon2::Params::DEFAULT` in argon2 0.5.x.
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
        }
    }
}

impl KdfParams {
    #[cfg(test)]
    pub const FAST: Self = Self {
        memory_kib: 64,
        iterations: 1,
    };
}

/// Derive the AES key for one record.
///
/// A missing password derives from the empty string; that is how unprotected records
/// are stored.
pub fn derive_record_key(
    password: Option<&SecretString>,
    salt: &[u8],
    params: KdfParams,
    key_id: &str,
) -> eyre::Result<Zeroizing<[u8; 32]>> {
    let argon_params = Params::new(params.memory_kib, params.iterations, 1, Some(32))
        .map_err(|e| eyre::eyre!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let pw = password.map_or("", |p| p.expose_secret());
    let mut base = Zeroizing::new([0_u8; 32]);
    argon2
        .hash_password_into(pw.as_bytes(), salt, &mut *base)
        .map_err(|e| eyre::eyre!("argon2 hash: {e}"))?;

    let hk = Hkdf::<Sha256>::new(None, &*base);
    let info = format!("walletvault:{key_id}:private");
    let mut out = Zeroizing::new([0_u8; 32]);
    hk.expand(info.as_bytes(), &mut *out)
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(out)
}

/// Encrypt and encode as base64(`nonce || ciphertext`).
pub fn seal(key32: &[u8; 32], plaintext: &[u8]) -> eyre::Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let mut nonce = [0_u8; AES_NONCE_LEN];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;

    let mut blob = Vec::with_capacity(AES_NONCE_LEN + ct.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct);
    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

pub fn open(key32: &[u8; 32], blob_b64: &str) -> eyre::Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64)
        .context("decode sealed blob")?;
    if blob.len() <= AES_NONCE_LEN {
        eyre::bail!("sealed blob too short");
    }
    let (nonce, ct) = blob.split_at(AES_NONCE_LEN);
    let pt = cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|e| eyre::eyre!("aes decrypt: {e}"))?;
    Ok(Zeroizing::new(pt))
}

use crate::errors::VaultError;
use base64::Engine as _;
use ed25519_dalek::{Signer as _, SigningKey};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

pub const MAINNET_PASSPHRASE: &str = "walletvault public network";
pub const TESTNET_PASSPHRASE: &str = "walletvault test network";

/// Which network a key signs for, picked from the key's `testnet` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub const fn from_testnet_flag(testnet: bool) -> Self {
        if testnet {
            Self::Testnet
        } else {
            Self::Mainnet
        }
    }

    pub const fn passphrase(self) -> &'static str {
        match self {
            Self::Mainnet => MAINNET_PASSPHRASE,
            Self::Testnet => TESTNET_PASSPHRASE,
        }
    }
}

/// Ledger-side signing seam: add one signature to a serialized envelope.
pub trait TransactionSigner: Send + Sync + std::fmt::Debug {
    fn sign(&self, envelope: &str, private_key: &str, network: Network) -> eyre::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoratedSignature {
    /// Base64 of the last 4 bytes of the signer's public key.
    pub hint: String,
    /// Base64 Ed25519 signature.
    pub signature: String,
}

/// `base64(json({tx, signatures}))`, where `tx` is the base64 transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub tx: String,
    #[serde(default)]
    pub signatures: Vec<DecoratedSignature>,
}

impl TxEnvelope {
    #[cfg(test)]
    pub fn new(tx: &[u8]) -> Self {
        Self {
            tx: base64::engine::general_purpose::STANDARD.encode(tx),
            signatures: Vec::new(),
        }
    }

    pub fn decode(s: &str) -> eyre::Result<Self> {
        let malformed =
            |what: &str| VaultError::InvalidArguments(format!("malformed transaction envelope: {what}"));
        let raw = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| malformed(&e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| malformed(&e.to_string()).into())
    }

    pub fn encode(&self) -> eyre::Result<String> {
        let raw = serde_json::to_vec(self).context("serialize transaction envelope")?;
        Ok(base64::engine::general_purpose::STANDARD.encode(raw))
    }

    /// `SHA-256(SHA-256(passphrase) || tx)`; binds a signature to one network.
    pub fn signature_base(&self, network: Network) -> eyre::Result<[u8; 32]> {
        let tx = base64::engine::general_purpose::STANDARD
            .decode(&self.tx)
            .map_err(|e| {
                VaultError::InvalidArguments(format!("malformed transaction payload: {e}"))
            })?;
        let network_id = Sha256::digest(network.passphrase().as_bytes());
        let mut h = Sha256::new();
        h.update(network_id);
        h.update(&tx);
        Ok(h.finalize().into())
    }
}

/// Signs envelopes with a hex-encoded 32-byte Ed25519 seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519EnvelopeSigner;

impl Ed25519EnvelopeSigner {
    fn signing_key(private_key: &str) -> eyre::Result<SigningKey> {
        let bytes = Zeroizing::new(hex::decode(private_key.trim()).context("decode signing seed")?);
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|e| eyre::eyre!("signing seed must be 32 bytes: {e}"))?,
        );
        Ok(SigningKey::from_bytes(&seed))
    }
}

impl TransactionSigner for Ed25519EnvelopeSigner {
    fn sign(&self, envelope: &str, private_key: &str, network: Network) -> eyre::Result<String> {
        let mut env = TxEnvelope::decode(envelope)?;
        let sk = Self::signing_key(private_key)?;
        let sig = sk.sign(&env.signature_base(network)?);
        let pk = sk.verifying_key().to_bytes();
        let hint = pk.get(28..).unwrap_or_default();
        env.signatures.push(DecoratedSignature {
            hint: base64::engine::general_purpose::STANDARD.encode(hint),
            signature: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
        });
        env.encode()
    }
}

#[cfg(test)]
pub const TEST_SEED_HEX: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier as _};
    use eyre::ContextCompat as _;

    fn verify(env: &TxEnvelope, network: Network, idx: usize) -> eyre::Result<()> {
        let sk = Ed25519EnvelopeSigner::signing_key(TEST_SEED_HEX)?;
        let sig = env.signatures.get(idx).context("signature")?;
        let raw = base64::engine::general_purpose::STANDARD.decode(&sig.signature)?;
        let arr: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|e| eyre::eyre!("signature must be 64 bytes: {e}"))?;
        sk.verifying_key()
            .verify(&env.signature_base(network)?, &Signature::from_bytes(&arr))?;
        Ok(())
    }

    #[test]
    fn sign_appends_one_verifiable_signature() -> eyre::Result<()> {
        let unsigned = TxEnvelope::new(b"pay 10 to bob").encode()?;
        let signed = Ed25519EnvelopeSigner.sign(&unsigned, TEST_SEED_HEX, Network::Testnet)?;
        let env = TxEnvelope::decode(&signed)?;
        assert_eq!(env.signatures.len(), 1);
        verify(&env, Network::Testnet, 0)?;
        assert!(verify(&env, Network::Mainnet, 0).is_err());

        let hint = base64::engine::general_purpose::STANDARD
            .decode(&env.signatures.first().context("sig")?.hint)?;
        assert_eq!(hint.len(), 4);

        let twice = Ed25519EnvelopeSigner.sign(&signed, TEST_SEED_HEX, Network::Testnet)?;
        assert_eq!(TxEnvelope::decode(&twice)?.signatures.len(), 2);
        Ok(())
    }

    #[test]
    fn garbage_envelope_is_invalid_arguments() -> eyre::Result<()> {
        let err = Ed25519EnvelopeSigner
            .sign("%%%not-base64", TEST_SEED_HEX, Network::Mainnet)
            .err()
            .context("must fail")?;
        assert!(matches!(
            err.downcast_ref::<VaultError>(),
            Some(VaultError::InvalidArguments(_))
        ));
        Ok(())
    }

    #[test]
    fn short_seed_is_rejected() -> eyre::Result<()> {
        let unsigned = TxEnvelope::new(b"x").encode()?;
        assert!(Ed25519EnvelopeSigner
            .sign(&unsigned, "abcd", Network::Mainnet)
            .is_err());
        Ok(())
    }
}

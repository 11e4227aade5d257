//! SSH key material: generation and validation of caller-supplied keys.
//!
//! Generated keys are ed25519. Caller-supplied keys may use any algorithm the
//! SSH stack can parse.

use russh::keys::ssh_key::{HashAlg, LineEnding};
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use tracing::debug;

use super::error::{BrokerError, BrokerResult};

/// How a create call obtains its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Generate a fresh key pair
    Generate,
    /// Use the keys supplied with the request
    Supplied,
}

/// Picks the key source for a request.
///
/// Exactly one of `create_key_pair` or a non-empty key list must be given.
pub fn resolve_key_source(supplied: &[String], create_key_pair: bool) -> BrokerResult<KeySource> {
    let has_keys = supplied.iter().any(|k| !k.trim().is_empty());
    match (has_keys, create_key_pair) {
        (true, true) => Err(BrokerError::InvalidArgument(
            "supply keys or request key generation, not both".to_string(),
        )),
        (false, false) => Err(BrokerError::InvalidArgument(
            "either keys must be supplied or createKeyPair must be true".to_string(),
        )),
        (true, false) => Ok(KeySource::Supplied),
        (false, true) => Ok(KeySource::Generate),
    }
}

/// A validated private key with its derived public half.
#[derive(Clone)]
pub struct PrivateKeyMaterial {
    pub key: PrivateKey,
    /// OpenSSH private key text, as written to key files
    pub openssh: String,
    pub public: PublicKeyMaterial,
}

impl std::fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyMaterial")
            .field("fingerprint", &self.public.fingerprint)
            .finish_non_exhaustive()
    }
}

/// A validated public key.
#[derive(Debug, Clone)]
pub struct PublicKeyMaterial {
    pub key: PublicKey,
    /// `authorized_keys` line
    pub openssh: String,
    /// `SHA256:...` fingerprint
    pub fingerprint: String,
}

impl PublicKeyMaterial {
    fn from_key(key: PublicKey) -> BrokerResult<Self> {
        let openssh = key
            .to_openssh()
            .map_err(|e| BrokerError::Internal(format!("failed to encode public key: {}", e)))?;
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        Ok(Self {
            key,
            openssh,
            fingerprint,
        })
    }
}

fn private_material(key: PrivateKey) -> BrokerResult<PrivateKeyMaterial> {
    let openssh = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| BrokerError::Internal(format!("failed to encode private key: {}", e)))?
        .to_string();
    let public = PublicKeyMaterial::from_key(key.public_key().clone())?;
    Ok(PrivateKeyMaterial {
        key,
        openssh,
        public,
    })
}

/// Generates a fresh ed25519 key pair.
pub fn issue() -> BrokerResult<PrivateKeyMaterial> {
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| BrokerError::Internal(format!("failed to generate key pair: {}", e)))?;
    let material = private_material(key)?;
    debug!(fingerprint = %material.public.fingerprint, "generated key pair");
    Ok(material)
}

/// Parses caller-supplied OpenSSH private keys. Encrypted keys are rejected.
pub fn accept_private_keys(keys: &[String]) -> BrokerResult<Vec<PrivateKeyMaterial>> {
    keys.iter()
        .filter(|text| !text.trim().is_empty())
        .enumerate()
        .map(|(index, text)| {
            let key = russh::keys::decode_secret_key(text.trim(), None).map_err(|e| {
                BrokerError::InvalidArgument(format!("private key #{} is invalid: {}", index, e))
            })?;
            private_material(key)
        })
        .collect()
}

/// Parses caller-supplied `authorized_keys` lines.
pub fn accept_public_keys(keys: &[String]) -> BrokerResult<Vec<PublicKeyMaterial>> {
    keys.iter()
        .filter(|text| !text.trim().is_empty())
        .enumerate()
        .map(|(index, text)| {
            let key = PublicKey::from_openssh(text.trim()).map_err(|e| {
                BrokerError::InvalidArgument(format!("public key #{} is invalid: {}", index, e))
            })?;
            PublicKeyMaterial::from_key(key)
        })
        .collect()
}

/// Whether `candidate` matches any of `trusted`, compared by fingerprint.
pub fn is_trusted(candidate: &PublicKey, trusted: &[PublicKeyMaterial]) -> bool {
    let fingerprint = candidate.fingerprint(HashAlg::Sha256).to_string();
    trusted.iter().any(|k| k.fingerprint == fingerprint)
}

//! Identity facade: a thin pass-through to the node's key authority.
//!
//! The overlay never touches key material directly. It holds an [`Identity`]
//! and asks it to encrypt, decrypt, sign and verify on its behalf.

use std::sync::Arc;

use crate::crypto::{self, CryptoError, Keypair, SigningIdentity};
use crate::message::KeyId;

/// The external key/identity collaborator.
pub trait KeysAuth: Send + Sync {
    /// Stable key identifier advertised to peers.
    fn key_id(&self) -> KeyId;

    /// Encrypt `data` for the holder of `public_key`.
    fn encrypt(&self, data: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt `data` addressed to this node.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, signature: &[u8], data: &[u8], public_key: &[u8]) -> bool;
}

/// Cloneable handle to the key authority.
#[derive(Clone)]
pub struct Identity {
    keys: Arc<dyn KeysAuth>,
}

impl Identity {
    pub fn new(keys: Arc<dyn KeysAuth>) -> Self {
        Self { keys }
    }

    pub fn key_id(&self) -> KeyId {
        self.keys.key_id()
    }

    /// Encrypt for `public_key`. Without a key the payload goes out as-is.
    pub fn encrypt(&self, data: &[u8], public_key: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        match public_key {
            Some(key) => self.keys.encrypt(data, key),
            None => Ok(data.to_vec()),
        }
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.keys.decrypt(data)
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keys.sign(data)
    }

    pub fn verify(&self, signature: &[u8], data: &[u8], public_key: &[u8]) -> bool {
        self.keys.verify(signature, data, public_key)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("key_id", &self.keys.key_id())
            .finish()
    }
}

/// In-process key authority backed by an X25519 keypair (sealing) and an
/// Ed25519 key (signing). The key id is the hex-encoded Ed25519 verifying key.
pub struct LocalKeys {
    exchange: Keypair,
    signing: SigningIdentity,
}

impl LocalKeys {
    pub fn generate() -> Self {
        Self {
            exchange: Keypair::generate(),
            signing: SigningIdentity::generate(),
        }
    }

    pub fn from_secrets(exchange_private: [u8; 32], signing_secret: [u8; 32]) -> Self {
        Self {
            exchange: Keypair::from_private(exchange_private),
            signing: SigningIdentity::from_secret(signing_secret),
        }
    }

    /// Public X25519 key peers use when sealing payloads for this node.
    pub fn exchange_public(&self) -> [u8; 32] {
        self.exchange.public
    }

    /// Short client id derived from the signing key, for nodes without a configured one.
    pub fn derived_client_id(&self) -> String {
        hex::encode(&crypto::hash(&self.signing.verifying_key())[..16])
    }
}

impl KeysAuth for LocalKeys {
    fn key_id(&self) -> KeyId {
        hex::encode(self.signing.verifying_key())
    }

    fn encrypt(&self, data: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::BadPublicKey(public_key.len()))?;
        crypto::seal(&key, data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open(&self.exchange, data)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_vec()
    }

    fn verify(&self, signature: &[u8], data: &[u8], public_key: &[u8]) -> bool {
        crypto::verify(public_key, data, signature).is_ok()
    }
}

//! Key material for meshlink nodes.
//!
//! Provides three things:
//!   1. BLAKE3 hashing for client id derivation
//!   2. Sealing: one-shot encryption to a peer's X25519 key (Noise_N via snow)
//!   3. Signing: Ed25519 signatures over arbitrary payloads
//!
//! All private key material is wiped from memory when dropped.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use snow::Builder;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// Noise pattern used for sealing. One message, recipient key known up front.
const SEAL_PATTERN: &str = "Noise_N_25519_ChaChaPoly_BLAKE2s";

/// Ephemeral key + AEAD tag added by a Noise_N message.
const SEAL_OVERHEAD: usize = 32 + 16;

/// Largest message snow will produce.
const NOISE_MAX_MESSAGE: usize = 65535;

/// A node's long-term static X25519 keypair, used to receive sealed payloads.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Handed to peers that want to seal payloads for us.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }
}

/// Encrypt `plaintext` so only the holder of `recipient`'s private key can read it.
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let total = plaintext.len() + SEAL_OVERHEAD;
    if total > NOISE_MAX_MESSAGE {
        return Err(CryptoError::MessageTooLarge(plaintext.len()));
    }

    let mut state = Builder::new(SEAL_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
        .remote_public_key(recipient)
        .build_initiator()
        .map_err(CryptoError::Noise)?;

    let mut out = vec![0u8; total];
    let len = state
        .write_message(plaintext, &mut out)
        .map_err(CryptoError::Noise)?;
    out.truncate(len);
    Ok(out)
}

/// Decrypt a payload produced by [`seal`] for this keypair.
pub fn open(keypair: &Keypair, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Truncated(sealed.len()));
    }

    let mut state = Builder::new(SEAL_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
        .local_private_key(&*keypair.private)
        .build_responder()
        .map_err(CryptoError::Noise)?;

    let mut out = vec![0u8; sealed.len()];
    let len = state
        .read_message(sealed, &mut out)
        .map_err(CryptoError::Noise)?;
    out.truncate(len);
    Ok(out)
}

// ── Signing ───────────────────────────────────────────────────────────────────

/// Ed25519 signing key. The verifying key doubles as the node's stable key id.
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.key.sign(data).to_bytes()
    }
}

/// Check an Ed25519 signature against a raw 32-byte verifying key.
pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::BadPublicKey(public_key.len()))?;
    let sig: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::BadSignature)?;
    let key = VerifyingKey::from_bytes(&key).map_err(|_| CryptoError::BadPublicKey(32))?;
    key.verify(data, &Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::BadSignature)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid noise pattern")]
    BadPattern,
    #[error("noise error: {0}")]
    Noise(snow::Error),
    #[error("plaintext of {0} bytes does not fit in one sealed message")]
    MessageTooLarge(usize),
    #[error("sealed message truncated ({0} bytes)")]
    Truncated(usize),
    #[error("public key must be 32 bytes, got {0}")]
    BadPublicKey(usize),
    #[error("signature verification failed")]
    BadSignature,
}

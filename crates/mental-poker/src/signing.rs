//! peer identity, control-message authentication and keyed hashing
//!
//! ed25519 keys, independent of the sra card cipher. a peer id is either
//! supplied by the transport or derived from a verifying key.

use core::fmt;
use core::str::FromStr;

use ed25519_dalek::{Signer, Verifier};
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use ed25519_dalek::{Signature, VerifyingKey};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// opaque, comparable peer identifier
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// wrap a transport-supplied identifier; must be non-empty without whitespace
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!("invalid peer id {:?}", id)));
        }
        Ok(Self(id))
    }

    /// derive a peer id from a verifying key (hex of the first 16 sha256 bytes)
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// local signing key
#[derive(Clone)]
pub struct SigningIdentity {
    key: ed25519_dalek::SigningKey,
}

impl SigningIdentity {
    /// generate a fresh signing key
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self { key: ed25519_dalek::SigningKey::generate(rng) }
    }

    /// restore from a 32-byte secret
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self { key: ed25519_dalek::SigningKey::from_bytes(secret) }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// peer id derived from this identity's verifying key
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_verifying_key(&self.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.key.sign(message)
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningIdentity({})", self.peer_id())
    }
}

/// check `signature` over `message` against `key`
pub fn verify_signature(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify(message, signature).is_ok()
}

/// hmac-sha256 over the concatenation of `data`
pub fn mac(key: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let mut h: HmacSha256 = KeyInit::new_from_slice(key).expect("hmac accepts any key length");
    for d in data {
        Mac::update(&mut h, d);
    }
    Mac::finalize(h).into_bytes().into()
}

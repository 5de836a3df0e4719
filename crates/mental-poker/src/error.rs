//! error types for mental-poker

use thiserror::Error;

use crate::signing::PeerId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // === key material ===
    #[error("key generation failed after {attempts} attempts: {reason}")]
    KeyGen { attempts: u32, reason: &'static str },

    #[error("invalid modulus: {0}")]
    InvalidModulus(String),

    #[error("variation index {index} out of range ({count} generated)")]
    IndexOutOfRange { index: usize, count: usize },

    // === wire ===
    #[error("malformed payload at line {line}: {reason}")]
    MalformedPayload { line: usize, reason: String },

    // === peers ===
    #[error("peer {peer} did not respond in time")]
    PeerTimeout { peer: PeerId },

    #[error("signature from {peer} failed verification")]
    SignatureInvalid { peer: PeerId },

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("round aborted by {peer}: {reason}")]
    RoundAborted { peer: PeerId, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    // === protocol ===
    #[error("value does not match any reference card")]
    NotFound,

    #[error("out of sequence: {0}")]
    OutOfSequence(String),

    // === runtime ===
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl Error {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedPayload { line, reason: reason.into() }
    }
}

//! mental-poker: sra commutative-encryption card dealing without a dealer
//!
//! peers share one rsa-style modulus and each holds private exponents over
//! it. because exponentiation commutes, every peer can encrypt and shuffle
//! the deck in turn and later strip its own layer without seeing anyone
//! else's.
//!
//! ## round flow
//!
//! ```text
//! reference deck      hmac(session secret, card name) per card
//!   -> global pass    each peer: v^e for every position, shuffle, pass on
//!   -> variation pass each peer: strip global layer, apply e_i per position
//!   -> hands          positions i and i+N to the peer at turn index i
//!   -> reveal         other peers disclose d_i for the owner's positions only
//! ```
//!
//! a peer that vanishes after dealing can still be opened: every peer
//! time-locks its keys at the start of the round, so the rest of the table
//! recovers them after a calibrated amount of sequential squaring.
//!
//! ## features
//!
//! - `parallel` (default): per-position work fans out over rayon

pub mod arith;
pub mod config;
pub mod deck;
pub mod driver;
pub mod error;
pub mod keyring;
pub mod network;
pub mod reveal;
pub mod signing;
pub mod timelock;
pub mod wire;

#[cfg(test)]
mod tests;

pub use config::GameConfig;
pub use deck::{Card, CardId, Rank, ReferenceDeck, RoundDeck, Suit};
pub use driver::{RoundDriver, RoundOutcome, Session};
pub use error::{Error, Result};
pub use keyring::{GlobalKeyPair, KeyMaterial, KeyVariation, Keyring, SharedModulus};
pub use network::{Envelope, LocalNetwork, Message, PeerLink};
pub use reveal::{DeckStage, HandAssignment, RevealRound, RoundPhase};
pub use signing::{PeerId, SigningIdentity};
pub use timelock::{KeyEscrow, PuzzleModulus, RecoveredKeys, SquaringRate, TimeLockPuzzle};

/// cards in a deck
pub const DECK_SIZE: usize = 52;

/// bit length of each shared-modulus prime
pub const DEFAULT_BIT_LENGTH: u64 = 2048;

/// community positions dealt after the hands
pub const BOARD_SIZE: usize = 5;

/// map `f` over `items` with their index, fanning out when `parallel` is on
#[cfg(feature = "parallel")]
pub(crate) fn par_map<T, U, F>(items: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(usize, &T) -> U + Sync + Send,
{
    use rayon::prelude::*;
    items.par_iter().enumerate().map(|(i, item)| f(i, item)).collect()
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn par_map<T, U, F>(items: &[T], f: F) -> Vec<U>
where
    F: Fn(usize, &T) -> U,
{
    items.iter().enumerate().map(|(i, item)| f(i, item)).collect()
}

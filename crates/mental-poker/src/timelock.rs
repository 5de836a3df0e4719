//! sequential-squaring time-lock puzzles (rivest, shamir, wagner)
//!
//! whoever knows `phi` can compute `b = 2^(2^t) mod n` in two
//! exponentiations. everyone else has to square `t` times in sequence, which
//! makes `t` a calibrated delay:
//!
//! ```text
//! lock:    b = 2^(2^t mod phi) mod n,  locked = key + b mod n
//! unlock:  x = 2; repeat t: x = x^2 mod n;  key = locked - x mod n
//! ```
//!
//! puzzles are never locked over the shared card modulus: every peer knows its
//! `phi`. each peer draws a private `PuzzleModulus` wider than the shared one
//! and keeps its factors to itself.

use std::future::Future;
use std::time::{Duration, Instant};

use core::fmt;

use num_bigint::BigUint;
use rand::{CryptoRng, Rng};
use tracing::{debug, info};

use crate::arith::{mod_inverse, mod_sub};
use crate::keyring::{KeyMaterial, SharedModulus};
use crate::signing::mac;
use crate::{Error, Result};

// ============================================================================
// calibration
// ============================================================================

/// sequential squarings per second for a given modulus size
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SquaringRate {
    per_second: u64,
}

impl SquaringRate {
    pub fn new(per_second: u64) -> Self {
        Self { per_second: per_second.max(1) }
    }

    pub fn per_second(&self) -> u64 {
        self.per_second
    }

    /// puzzle iterations for `delay`, at least one
    pub fn iterations_for(&self, delay: Duration) -> u64 {
        let t = delay.as_secs_f64() * self.per_second as f64;
        (t as u64).max(1)
    }
}

/// time `squarings` sequential squarings of 2 modulo `n`
pub fn calibrate_squaring_rate(n: &BigUint, squarings: u64) -> SquaringRate {
    let squarings = squarings.max(1);
    let start = Instant::now();
    let mut x = BigUint::from(2u32);
    for _ in 0..squarings {
        x = (&x * &x) % n;
    }
    let elapsed = start.elapsed().as_secs_f64().max(1e-9);
    let rate = SquaringRate::new((squarings as f64 / elapsed) as u64);
    debug!(bits = n.bits(), squarings, per_second = rate.per_second(), "calibrated squaring rate");
    rate
}

/// run calibration on the blocking pool
pub fn spawn_calibration(n: BigUint, squarings: u64) -> impl Future<Output = Result<SquaringRate>> {
    let handle = tokio::task::spawn_blocking(move || calibrate_squaring_rate(&n, squarings));
    async move { handle.await.map_err(|e| Error::Worker(e.to_string())) }
}

/// accepted spread between a received puzzle's iterations and the local estimate
pub const ITERATION_TOLERANCE: u64 = 4;

/// is `iterations` within `ITERATION_TOLERANCE` of `expected` in either direction
pub fn iterations_acceptable(iterations: u64, expected: u64) -> bool {
    let expected = expected.max(1);
    let low = (expected / ITERATION_TOLERANCE).max(1);
    let high = expected.saturating_mul(ITERATION_TOLERANCE);
    (low..=high).contains(&iterations)
}

// ============================================================================
// puzzle modulus
// ============================================================================

/// extra bits per prime over the shared modulus, so any card key is a residue
pub const PUZZLE_EXTRA_BITS: u64 = 32;

/// one peer's private time-lock modulus; `p'` and `q'` never leave the peer
#[derive(Clone, PartialEq, Eq)]
pub struct PuzzleModulus {
    inner: SharedModulus,
}

impl PuzzleModulus {
    /// draw primes `PUZZLE_EXTRA_BITS` wider than `shared_prime_bits`
    pub fn generate<R: Rng + CryptoRng>(shared_prime_bits: u64, rng: &mut R) -> Result<Self> {
        let inner = SharedModulus::generate(shared_prime_bits + PUZZLE_EXTRA_BITS, rng)?;
        Ok(Self { inner })
    }

    /// a puzzle modulus for keys under `shared`
    pub fn for_shared<R: Rng + CryptoRng>(shared: &SharedModulus, rng: &mut R) -> Result<Self> {
        Self::generate((shared.bits() + 1) / 2, rng)
    }

    pub fn n(&self) -> &BigUint {
        self.inner.n()
    }

    pub fn bits(&self) -> u64 {
        self.inner.bits()
    }

    fn phi(&self) -> &BigUint {
        self.inner.phi()
    }
}

impl fmt::Debug for PuzzleModulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PuzzleModulus({} bits)", self.bits())
    }
}

// ============================================================================
// puzzle
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeLockPuzzle {
    n: BigUint,
    iterations: u64,
    locked_value: BigUint,
}

impl TimeLockPuzzle {
    pub fn new(n: BigUint, iterations: u64, locked_value: BigUint) -> Self {
        Self { n, iterations, locked_value }
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn locked_value(&self) -> &BigUint {
        &self.locked_value
    }

    /// `b` by `t` literal sequential squarings of 2
    pub fn solve(&self) -> BigUint {
        let mut x = BigUint::from(2u32);
        for _ in 0..self.iterations {
            x = (&x * &x) % &self.n;
        }
        x
    }
}

/// `b` via the phi shortcut; only the modulus owner can take it
fn puzzle_secret(modulus: &PuzzleModulus, iterations: u64) -> BigUint {
    let two = BigUint::from(2u32);
    let exponent = two.modpow(&BigUint::from(iterations), modulus.phi());
    two.modpow(&exponent, modulus.n())
}

/// lock `key` behind `delay` worth of squaring at `rate`
pub fn lock(key: &BigUint, delay: Duration, rate: SquaringRate, modulus: &PuzzleModulus) -> TimeLockPuzzle {
    lock_with_secret(key, rate.iterations_for(delay), modulus).0
}

fn lock_with_secret(key: &BigUint, iterations: u64, modulus: &PuzzleModulus) -> (TimeLockPuzzle, BigUint) {
    let b = puzzle_secret(modulus, iterations);
    let locked = (key + &b) % modulus.n();
    (TimeLockPuzzle::new(modulus.n().clone(), iterations, locked), b)
}

/// recover the locked key by sequential squaring
pub fn unlock(puzzle: &TimeLockPuzzle) -> BigUint {
    let b = puzzle.solve();
    mod_sub(puzzle.locked_value(), &b, puzzle.n())
}

/// run `unlock` on the blocking pool
pub fn spawn_unlock(puzzle: TimeLockPuzzle) -> impl Future<Output = Result<BigUint>> {
    let handle = tokio::task::spawn_blocking(move || unlock(&puzzle));
    async move { handle.await.map_err(|e| Error::Worker(e.to_string())) }
}

// ============================================================================
// key escrow
// ============================================================================

/// a peer's round keys, recoverable by solving one puzzle
///
/// the puzzle locks the global `d` under the peer's own puzzle modulus; each
/// variation factor `r_i` is masked with a keystream derived from the same
/// puzzle secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEscrow {
    puzzle: TimeLockPuzzle,
    masked_factors: Vec<BigUint>,
}

/// keys recovered from an escrow
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveredKeys {
    pub d: BigUint,
    pub factors: Vec<BigUint>,
}

impl core::fmt::Debug for RecoveredKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RecoveredKeys({} factors)", self.factors.len())
    }
}

impl RecoveredKeys {
    /// `d_i = d * r_i^-1 mod phi`
    pub fn variation_d(&self, index: usize, modulus: &SharedModulus) -> Result<BigUint> {
        let r = self.factors.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.factors.len(),
        })?;
        let r_inv = mod_inverse(r, modulus.phi())
            .ok_or_else(|| Error::InvalidModulus("escrowed factor not invertible".into()))?;
        Ok((&self.d * r_inv) % modulus.phi())
    }
}

impl KeyEscrow {
    /// lock `material.d` and mask every factor
    pub fn seal(material: &KeyMaterial, delay: Duration, rate: SquaringRate, modulus: &PuzzleModulus) -> Self {
        let iterations = rate.iterations_for(delay);
        let (puzzle, b) = lock_with_secret(&material.d, iterations, modulus);
        let masked_factors = material
            .factors
            .iter()
            .enumerate()
            .map(|(i, r)| (r + mask(&b, i, modulus.n())) % modulus.n())
            .collect();
        debug!(iterations, factors = material.factors.len(), "sealed key escrow");
        Self { puzzle, masked_factors }
    }

    pub(crate) fn from_parts(puzzle: TimeLockPuzzle, masked_factors: Vec<BigUint>) -> Self {
        Self { puzzle, masked_factors }
    }

    pub fn puzzle(&self) -> &TimeLockPuzzle {
        &self.puzzle
    }

    pub fn masked_factors(&self) -> &[BigUint] {
        &self.masked_factors
    }

    /// solve the puzzle and unmask everything; takes the full delay
    pub fn open(&self) -> RecoveredKeys {
        let n = self.puzzle.n();
        let b = self.puzzle.solve();
        let d = mod_sub(self.puzzle.locked_value(), &b, n);
        let factors = self
            .masked_factors
            .iter()
            .enumerate()
            .map(|(i, masked)| mod_sub(masked, &mask(&b, i, n), n))
            .collect();
        RecoveredKeys { d, factors }
    }

    /// run `open` on the blocking pool
    pub fn spawn_open(self) -> impl Future<Output = Result<RecoveredKeys>> {
        let iterations = self.puzzle.iterations();
        let handle = tokio::task::spawn_blocking(move || self.open());
        async move {
            let keys = handle.await.map_err(|e| Error::Worker(e.to_string()))?;
            info!(iterations, "opened key escrow");
            Ok(keys)
        }
    }
}

/// keystream block `i` for the puzzle secret `b`, widened to n and reduced
fn mask(b: &BigUint, index: usize, n: &BigUint) -> BigUint {
    let key = b.to_bytes_be();
    let width = ((n.bits() + 7) / 8) as usize;
    let mut stream = Vec::with_capacity(width + 32);
    let mut block = 0u32;
    while stream.len() < width {
        stream.extend_from_slice(&mac(&key, &[&(index as u64).to_le_bytes(), &block.to_le_bytes()]));
        block += 1;
    }
    stream.truncate(width);
    BigUint::from_bytes_be(&stream) % n
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keyring::tests::{test_keyring, test_modulus};
    use crate::DECK_SIZE;
    use rand::rngs::OsRng;
    use std::sync::OnceLock;

    /// a puzzle modulus sized for `test_modulus`, generated once per test binary
    pub(crate) fn test_puzzle_modulus() -> PuzzleModulus {
        static MODULUS: OnceLock<PuzzleModulus> = OnceLock::new();
        MODULUS
            .get_or_init(|| PuzzleModulus::for_shared(&test_modulus(), &mut OsRng).unwrap())
            .clone()
    }

    #[test]
    fn test_puzzle_modulus_wider_than_shared() {
        let shared = test_modulus();
        let puzzle = test_puzzle_modulus();
        assert!(puzzle.n() > shared.n());
        assert_eq!(puzzle.bits(), shared.bits() + 2 * PUZZLE_EXTRA_BITS);
        assert_ne!(puzzle.phi(), shared.phi());
        assert!(!format!("{:?}", puzzle).contains(&puzzle.phi().to_string()));
    }

    #[test]
    fn test_shortcut_matches_sequential() {
        let m = test_puzzle_modulus();
        for t in [1u64, 2, 17, 1000] {
            let (puzzle, b) = lock_with_secret(&BigUint::from(5u32), t, &m);
            assert_eq!(puzzle.solve(), b, "t = {}", t);
        }
    }

    #[test]
    fn test_lock_unlock_recovers_key() {
        let shared = test_modulus();
        let m = test_puzzle_modulus();
        let keyring = test_keyring(&shared, 0);
        let key = keyring.global().unwrap().d().clone();

        let puzzle = lock(&key, Duration::from_secs(1), SquaringRate::new(500), &m);
        assert_eq!(puzzle.iterations(), 500);
        assert_eq!(puzzle.n(), m.n());
        assert_ne!(puzzle.locked_value(), &key);
        assert_eq!(unlock(&puzzle), key);
    }

    #[test]
    fn test_iterations_at_least_one() {
        let rate = SquaringRate::new(10);
        assert_eq!(rate.iterations_for(Duration::ZERO), 1);
        assert_eq!(rate.iterations_for(Duration::from_secs(3)), 30);
        assert_eq!(SquaringRate::new(0).per_second(), 1);
    }

    #[test]
    fn test_iterations_tolerance() {
        assert!(iterations_acceptable(1000, 1000));
        assert!(iterations_acceptable(250, 1000));
        assert!(iterations_acceptable(4000, 1000));
        assert!(!iterations_acceptable(249, 1000));
        assert!(!iterations_acceptable(4001, 1000));
        assert!(!iterations_acceptable(u64::MAX, 1000));
        // tiny local estimates still admit a one-squaring puzzle
        assert!(iterations_acceptable(1, 1));
        assert!(iterations_acceptable(4, 0));
        assert!(!iterations_acceptable(0, 1));
    }

    #[test]
    fn test_escrow_recovers_variation_keys() {
        let shared = test_modulus();
        let keyring = test_keyring(&shared, 6);
        let material = keyring.export_keys().unwrap();

        let escrow = KeyEscrow::seal(
            &material,
            Duration::from_millis(2),
            SquaringRate::new(100_000),
            &test_puzzle_modulus(),
        );
        assert_eq!(escrow.masked_factors().len(), 6);
        assert!(escrow
            .masked_factors()
            .iter()
            .zip(&material.factors)
            .all(|(masked, r)| masked != r));

        let recovered = escrow.open();
        assert_eq!(recovered.d, material.d);
        assert_eq!(recovered.factors, material.factors);
        for i in 0..6 {
            assert_eq!(&recovered.variation_d(i, &shared).unwrap(), keyring.variation(i).unwrap().d());
        }
        assert!(recovered.variation_d(6, &shared).is_err());
    }

    #[test]
    fn test_shared_phi_does_not_open_escrow() {
        let shared = test_modulus();
        let keyring = test_keyring(&shared, 2);
        let material = keyring.export_keys().unwrap();
        let escrow = KeyEscrow::seal(
            &material,
            Duration::from_secs(1),
            SquaringRate::new(1_000),
            &test_puzzle_modulus(),
        );
        let puzzle = escrow.puzzle();

        // what any seated peer could try: the shortcut with the table's phi
        let two = BigUint::from(2u32);
        let exponent = two.modpow(&BigUint::from(puzzle.iterations()), shared.phi());
        let guess = two.modpow(&exponent, puzzle.n());
        assert_ne!(guess, puzzle.solve());
        assert_ne!(mod_sub(puzzle.locked_value(), &guess, puzzle.n()), material.d);

        // and the same shortcut reduced mod n
        let guess = two.modpow(&exponent, shared.n());
        assert_ne!(mod_sub(puzzle.locked_value(), &guess, puzzle.n()), material.d);

        assert_eq!(escrow.open().d, material.d);
    }

    #[test]
    fn test_escrow_payload_roundtrip() {
        let shared = test_modulus();
        let keyring = test_keyring(&shared, DECK_SIZE);
        let rate = SquaringRate::new(50_000);
        let delay = Duration::from_millis(1);
        let escrow = KeyEscrow::seal(&keyring.export_keys().unwrap(), delay, rate, &test_puzzle_modulus());
        let payload = crate::wire::encode_escrow(&escrow);
        let parsed = crate::wire::decode_escrow(&payload, &shared, rate.iterations_for(delay)).unwrap();
        assert_eq!(parsed, escrow);
    }

    #[tokio::test]
    async fn test_unlock_on_blocking_pool() {
        let m = test_puzzle_modulus();
        let key = BigUint::from(123_456_789u64);
        let puzzle = lock(&key, Duration::from_millis(1), SquaringRate::new(100_000), &m);
        assert_eq!(spawn_unlock(puzzle).await.unwrap(), key);

        let rate = spawn_calibration(m.n().clone(), 2_000).await.unwrap();
        assert!(rate.per_second() > 0);
    }
}

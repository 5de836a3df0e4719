//! line-oriented text payloads exchanged between peers
//!
//! every payload is one base-10 integer per line:
//!
//! ```text
//! deck          52 lines, position order
//! disclosure    one d_i per requested position
//! modulus       p, q
//! keyring       e, d, then one r_i per line
//! escrow        puzzle modulus, iterations, locked d, then 52 masked r_i
//! ```
//!
//! a trailing empty line or a `\END` sentinel line is ignored. anything else
//! that is not a plain decimal integer rejects the whole payload.
//!
//! the peer directory is the one non-numeric format: `<peer-id> <address>`.

use std::fmt::Write as _;

use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::keyring::{KeyMaterial, SharedModulus};
use crate::signing::PeerId;
use crate::timelock::{iterations_acceptable, KeyEscrow, TimeLockPuzzle};
use crate::{Error, Result, DECK_SIZE};

/// sentinel some peers append after the last value
pub const END_SENTINEL: &str = "\\END";

// ============================================================================
// integer lines
// ============================================================================

pub fn encode_values<'a>(values: impl IntoIterator<Item = &'a BigUint>) -> String {
    let mut out = String::new();
    for value in values {
        // writing into a String cannot fail
        let _ = writeln!(out, "{}", value);
    }
    out
}

/// parse exactly `expected` integer lines
pub fn decode_values(payload: &str, expected: usize) -> Result<Vec<BigUint>> {
    let values = decode_lines(payload)?;
    if values.len() != expected {
        return Err(Error::malformed(
            values.len().min(expected) + 1,
            format!("expected {} lines, got {}", expected, values.len()),
        ));
    }
    Ok(values)
}

/// parse any number of integer lines
pub fn decode_lines(payload: &str) -> Result<Vec<BigUint>> {
    content_lines(payload)
        .iter()
        .enumerate()
        .map(|(i, line)| parse_integer(line, i + 1))
        .collect()
}

/// lines of the payload with the optional trailer removed
fn content_lines(payload: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = payload.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    if lines.last() == Some(&END_SENTINEL) {
        lines.pop();
    }
    lines
}

fn parse_integer(line: &str, line_no: usize) -> Result<BigUint> {
    if line.is_empty() {
        return Err(Error::malformed(line_no, "empty line"));
    }
    if !line.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::malformed(line_no, format!("not a decimal integer: {:?}", line)));
    }
    BigUint::parse_bytes(line.as_bytes(), 10)
        .ok_or_else(|| Error::malformed(line_no, "unparseable integer"))
}

// ============================================================================
// structured payloads
// ============================================================================

pub fn encode_modulus(modulus: &SharedModulus) -> String {
    encode_values([modulus.p(), modulus.q()])
}

/// parse `p` and `q`, then validate them as a shared modulus
pub fn decode_modulus(payload: &str) -> Result<SharedModulus> {
    let mut values = decode_values(payload, 2)?.into_iter();
    match (values.next(), values.next()) {
        (Some(p), Some(q)) => SharedModulus::from_primes(p, q),
        _ => Err(Error::malformed(1, "missing prime")),
    }
}

pub fn encode_key_material(material: &KeyMaterial) -> String {
    encode_values([&material.e, &material.d].into_iter().chain(material.factors.iter()))
}

pub fn decode_key_material(payload: &str) -> Result<KeyMaterial> {
    let mut values = decode_lines(payload)?.into_iter();
    let (e, d) = match (values.next(), values.next()) {
        (Some(e), Some(d)) => (e, d),
        _ => return Err(Error::malformed(1, "keyring payload needs e and d")),
    };
    Ok(KeyMaterial { e, d, factors: values.collect() })
}

/// escrow payload; the puzzle modulus is the sender's own and travels with it
pub fn encode_escrow(escrow: &KeyEscrow) -> String {
    let puzzle = escrow.puzzle();
    let iterations = BigUint::from(puzzle.iterations());
    encode_values(
        [puzzle.n(), &iterations, puzzle.locked_value()]
            .into_iter()
            .chain(escrow.masked_factors().iter()),
    )
}

/// parse a peer's escrow
///
/// the puzzle modulus must be wider than `shared`, there must be one masked
/// factor per card, and the squaring count must sit within the accepted
/// tolerance of `expected_iterations`, the local estimate for the delay.
pub fn decode_escrow(payload: &str, shared: &SharedModulus, expected_iterations: u64) -> Result<KeyEscrow> {
    let values = decode_lines(payload)?;
    if values.len() != DECK_SIZE + 3 {
        return Err(Error::malformed(
            values.len().min(DECK_SIZE + 3) + 1,
            format!("escrow needs 3 + {} lines, got {}", DECK_SIZE, values.len()),
        ));
    }
    let mut values = values.into_iter();
    let (n, iterations, locked) = match (values.next(), values.next(), values.next()) {
        (Some(n), Some(t), Some(locked)) => (n, t, locked),
        _ => return Err(Error::malformed(1, "escrow payload needs modulus, iterations and locked key")),
    };

    if &n <= shared.n() {
        return Err(Error::malformed(1, "puzzle modulus is not wider than the shared modulus"));
    }
    let iterations = iterations
        .to_u64()
        .filter(|t| iterations_acceptable(*t, expected_iterations))
        .ok_or_else(|| {
            Error::malformed(2, format!("iterations too far from the local estimate of {}", expected_iterations))
        })?;

    let masked: Vec<BigUint> = values.collect();
    if let Some(i) = std::iter::once(&locked).chain(masked.iter()).position(|v| v >= &n) {
        return Err(Error::malformed(i + 3, "value is not a residue of the puzzle modulus"));
    }

    let puzzle = TimeLockPuzzle::new(n, iterations, locked);
    Ok(KeyEscrow::from_parts(puzzle, masked))
}

// ============================================================================
// peer directory
// ============================================================================

/// one `<peer-id> <multiaddress>` line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer: PeerId,
    pub address: String,
}

pub fn format_directory<'a>(entries: impl IntoIterator<Item = &'a PeerEntry>) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "{} {}", entry.peer, entry.address);
    }
    out
}

pub fn parse_directory(payload: &str) -> Result<Vec<PeerEntry>> {
    content_lines(payload)
        .into_iter()
        .enumerate()
        .map(|(i, line)| {
            let mut parts = line.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(peer), Some(address), None) if !address.is_empty() => Ok(PeerEntry {
                    peer: PeerId::new(peer).map_err(|e| Error::malformed(i + 1, e.to_string()))?,
                    address: address.to_string(),
                }),
                _ => Err(Error::malformed(i + 1, "expected `<peer-id> <address>`")),
            }
        })
        .collect()
}

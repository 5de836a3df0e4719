//! big integer helpers on top of num-bigint
//!
//! num-bigint gives us modpow, gcd, modinv and random draws; primality testing
//! lives here.

use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};

use crate::{Error, Result};

/// miller-rabin rounds; error probability <= 4^-40
pub const MILLER_RABIN_ROUNDS: usize = 40;

/// candidates drawn per bit of prime length before giving up
const PRIME_ATTEMPTS_PER_BIT: u64 = 64;

/// coprime candidates drawn before giving up
pub const MAX_COPRIME_ATTEMPTS: u32 = 256;

const SMALL_PRIMES: [u32; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// draw a random prime of exactly `bits` bits
///
/// the top two bits are forced so that a product of two such primes has
/// exactly `2 * bits` bits.
pub fn random_prime<R: Rng + CryptoRng + ?Sized>(bits: u64, rng: &mut R) -> Result<BigUint> {
    if bits < 16 {
        return Err(Error::KeyGen { attempts: 0, reason: "prime bit length below 16" });
    }

    let attempts = bits * PRIME_ATTEMPTS_PER_BIT;
    for _ in 0..attempts {
        let mut candidate = rng.gen_biguint(bits);
        candidate.set_bit(bits - 1, true);
        candidate.set_bit(bits - 2, true);
        candidate.set_bit(0, true);

        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS, rng) {
            return Ok(candidate);
        }
    }

    Err(Error::KeyGen {
        attempts: attempts.min(u32::MAX as u64) as u32,
        reason: "no prime found",
    })
}

/// miller-rabin with trial division by small primes
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    if *n == two {
        return true;
    }
    if n.is_even() {
        return false;
    }
    for &p in SMALL_PRIMES.iter() {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    // n - 1 = d * 2^s
    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_minus_one {
                continue 'witness;
            }
            if x.is_one() {
                return false;
            }
        }
        return false;
    }
    true
}

/// rejection-sample a value in [3, modulus) coprime to `modulus`
pub fn random_coprime<R: Rng + ?Sized>(modulus: &BigUint, rng: &mut R) -> Result<BigUint> {
    let low = BigUint::from(3u32);
    if *modulus <= low {
        return Err(Error::InvalidModulus("modulus too small for coprime sampling".into()));
    }

    for _ in 0..MAX_COPRIME_ATTEMPTS {
        let candidate = rng.gen_biguint_range(&low, modulus);
        if candidate.gcd(modulus).is_one() {
            return Ok(candidate);
        }
    }

    Err(Error::KeyGen {
        attempts: MAX_COPRIME_ATTEMPTS,
        reason: "no coprime candidate found",
    })
}

/// extended euclid over signed integers: returns (x, y, g) with a*x + b*y = g
/// modular inverse of `a` modulo `m`, if gcd(a, m) = 1
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    if m.is_zero() {
        return None;
    }
    (a % m).modinv(m)
}

/// (a - b) mod n for residues a, b < n
pub fn mod_sub(a: &BigUint, b: &BigUint, n: &BigUint) -> BigUint {
    let a = a % n;
    let b = b % n;
    if a >= b {
        a - b
    } else {
        n - (b - a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_small_primes_classified() {
        let mut rng = OsRng;
        let primes = [2u32, 3, 5, 101, 7919, 104_729];
        let composites = [1u32, 4, 9, 561, 7917, 104_730];

        for p in primes {
            assert!(is_probable_prime(&BigUint::from(p), 20, &mut rng), "{} is prime", p);
        }
        for c in composites {
            assert!(!is_probable_prime(&BigUint::from(c), 20, &mut rng), "{} is composite", c);
        }
    }

    #[test]
    fn test_carmichael_rejected() {
        // 211 * 421 * 631, every factor above the trial division table
        let mut rng = OsRng;
        assert!(!is_probable_prime(&BigUint::from(56_052_361u32), 20, &mut rng));
        assert!(!is_probable_prime(&BigUint::from(41_041u32), 20, &mut rng));
    }

    #[test]
    fn test_random_prime_bit_length() {
        let mut rng = OsRng;
        let p = random_prime(64, &mut rng).unwrap();
        assert_eq!(p.bits(), 64);
        assert!(p.is_odd());
    }

    #[test]
    fn test_mod_inverse() {
        let m = BigUint::from(3120u32);
        let a = BigUint::from(17u32);
        let inv = mod_inverse(&a, &m).unwrap();
        assert_eq!(inv, BigUint::from(2753u32));
        assert!(((a * inv) % &m).is_one());

        assert!(mod_inverse(&BigUint::from(6u32), &BigUint::from(9u32)).is_none());
        assert!(mod_inverse(&BigUint::from(6u32), &BigUint::zero()).is_none());
        // reduced before inverting
        assert_eq!(mod_inverse(&BigUint::from(3120u32 + 17), &m), Some(BigUint::from(2753u32)));
    }

    #[test]
    fn test_random_coprime() {
        let mut rng = OsRng;
        let m = BigUint::from(3120u32);
        for _ in 0..50 {
            let c = random_coprime(&m, &mut rng).unwrap();
            assert!(c.gcd(&m).is_one());
            assert!(c < m);
        }
    }

    #[test]
    fn test_mod_sub_wraps() {
        let n = BigUint::from(11u32);
        assert_eq!(mod_sub(&BigUint::from(3u32), &BigUint::from(5u32), &n), BigUint::from(9u32));
        assert_eq!(mod_sub(&BigUint::from(5u32), &BigUint::from(3u32), &n), BigUint::from(2u32));
    }
}

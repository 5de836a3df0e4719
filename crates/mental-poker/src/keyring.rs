//! sra commutative key system
//!
//! every peer derives its keys over one shared modulus `n = p * q`:
//! - global keypair `(e, d)` with `e * d = 1 mod phi`
//! - one key variation per deck position, `e_i = e * r_i`, `d_i = d * r_i^-1`
//!
//! since all exponents live in the same group, encryption layers from
//! different peers commute:
//!
//! ```text
//! (v^e1)^e2 = (v^e2)^e1          (mod n)
//! (((v^e1)^e2)^d1)^d2 = v        (mod n), in any decryption order
//! ```
//!
//! disclosing `d_i` opens position `i` only; the global `d` never leaves the
//! keyring.

use core::fmt;
use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::One;
use rand::{CryptoRng, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::arith::{is_probable_prime, mod_inverse, random_coprime, random_prime, MILLER_RABIN_ROUNDS};
use crate::signing::{verify_signature, PeerId, Signature, SigningIdentity, VerifyingKey};
use crate::{par_map, Error, Result};

/// the modulus must be wider than the 256-bit card commitments
pub const MIN_MODULUS_BITS: u64 = 257;

/// attempts at drawing a second prime distinct from the first
const MAX_DISTINCT_PRIME_ATTEMPTS: u32 = 8;

// ============================================================================
// shared modulus
// ============================================================================

/// two primes agreed by every peer before any key is derived
#[derive(Clone, PartialEq, Eq)]
pub struct SharedModulus {
    p: BigUint,
    q: BigUint,
    n: BigUint,
    phi: BigUint,
}

impl SharedModulus {
    /// draw two independent primes of `bit_length` bits each
    pub fn generate<R: Rng + CryptoRng>(bit_length: u64, rng: &mut R) -> Result<Self> {
        for _ in 0..MAX_DISTINCT_PRIME_ATTEMPTS {
            let seeds: [[u8; 32]; 2] = [rng.gen(), rng.gen()];
            let primes = par_map(&seeds, |_, seed| {
                let mut prng = ChaCha20Rng::from_seed(*seed);
                random_prime(bit_length, &mut prng)
            })
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

            if let [p, q] = primes.as_slice() {
                if p != q {
                    debug!(bits = bit_length, "generated shared modulus");
                    return Self::from_primes(p.clone(), q.clone());
                }
            }
        }

        Err(Error::KeyGen {
            attempts: MAX_DISTINCT_PRIME_ATTEMPTS,
            reason: "primes kept colliding",
        })
    }

    /// accept primes received from the session initiator
    pub fn from_primes(p: BigUint, q: BigUint) -> Result<Self> {
        if p == q {
            return Err(Error::InvalidModulus("p and q must differ".into()));
        }
        if p.bits() != q.bits() {
            return Err(Error::InvalidModulus(format!(
                "prime bit lengths differ: {} vs {}",
                p.bits(),
                q.bits()
            )));
        }

        let mut rng = rand::rngs::OsRng;
        for (name, prime) in [("p", &p), ("q", &q)] {
            if !is_probable_prime(prime, MILLER_RABIN_ROUNDS, &mut rng) {
                return Err(Error::InvalidModulus(format!("{} is not prime", name)));
            }
        }

        let n = &p * &q;
        if n.bits() < MIN_MODULUS_BITS {
            return Err(Error::InvalidModulus(format!(
                "modulus has {} bits, need at least {}",
                n.bits(),
                MIN_MODULUS_BITS
            )));
        }
        let phi = (&p - 1u32) * (&q - 1u32);
        Ok(Self { p, q, n, phi })
    }

    pub fn p(&self) -> &BigUint {
        &self.p
    }

    pub fn q(&self) -> &BigUint {
        &self.q
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn phi(&self) -> &BigUint {
        &self.phi
    }

    /// bit length of n
    pub fn bits(&self) -> u64 {
        self.n.bits()
    }

    /// value^exponent mod n
    pub fn pow(&self, value: &BigUint, exponent: &BigUint) -> BigUint {
        value.modpow(exponent, &self.n)
    }
}

impl fmt::Debug for SharedModulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedModulus({} bits)", self.bits())
    }
}

// ============================================================================
// global keypair
// ============================================================================

/// one peer's session-long commutative keypair
#[derive(Clone, PartialEq, Eq)]
pub struct GlobalKeyPair {
    e: BigUint,
    d: BigUint,
}

impl GlobalKeyPair {
    /// rejection-sample `e` coprime to phi and invert it
    pub fn generate<R: Rng + ?Sized>(modulus: &SharedModulus, rng: &mut R) -> Result<Self> {
        let e = random_coprime(modulus.phi(), rng)?;
        let d = mod_inverse(&e, modulus.phi()).ok_or(Error::KeyGen {
            attempts: 1,
            reason: "sampled exponent not invertible",
        })?;
        Ok(Self { e, d })
    }

    /// rebuild from exported exponents, checking `e * d = 1 mod phi`
    pub fn from_parts(e: BigUint, d: BigUint, modulus: &SharedModulus) -> Result<Self> {
        if !((&e * &d) % modulus.phi()).is_one() {
            return Err(Error::InvalidModulus("exponents are not inverse under this modulus".into()));
        }
        Ok(Self { e, d })
    }

    pub fn e(&self) -> &BigUint {
        &self.e
    }

    pub fn d(&self) -> &BigUint {
        &self.d
    }
}

impl fmt::Debug for GlobalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GlobalKeyPair(..)")
    }
}

// ============================================================================
// key variations
// ============================================================================

/// per-position keypair derived from the global pair and a random factor
#[derive(Clone, PartialEq, Eq)]
pub struct KeyVariation {
    e: BigUint,
    d: BigUint,
    r: BigUint,
}

impl KeyVariation {
    /// derive `(e * r, d * r^-1)` for factor `r`
    pub fn derive(keypair: &GlobalKeyPair, r: BigUint, modulus: &SharedModulus) -> Result<Self> {
        let phi = modulus.phi();
        let r_inv = mod_inverse(&r, phi).ok_or(Error::KeyGen {
            attempts: 1,
            reason: "variation factor not invertible",
        })?;
        let e = (keypair.e() * &r) % phi;
        let d = (keypair.d() * r_inv) % phi;
        Ok(Self { e, d, r })
    }

    pub fn e(&self) -> &BigUint {
        &self.e
    }

    pub fn d(&self) -> &BigUint {
        &self.d
    }

    /// the random factor, only ever exported for escrow
    pub fn r(&self) -> &BigUint {
        &self.r
    }
}

impl fmt::Debug for KeyVariation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyVariation(..)")
    }
}

/// draw `count` variations, each from an independently seeded generator
pub fn generate_variations<R: Rng + CryptoRng>(
    count: usize,
    keypair: &GlobalKeyPair,
    modulus: &SharedModulus,
    rng: &mut R,
) -> Result<Vec<KeyVariation>> {
    let seeds: Vec<[u8; 32]> = (0..count).map(|_| rng.gen()).collect();
    par_map(&seeds, |_, seed| {
        let mut prng = ChaCha20Rng::from_seed(*seed);
        let r = random_coprime(modulus.phi(), &mut prng)?;
        KeyVariation::derive(keypair, r, modulus)
    })
    .into_iter()
    .collect()
}

/// exported exponents of one peer: global pair plus every variation factor
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub e: BigUint,
    pub d: BigUint,
    pub factors: Vec<BigUint>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} factors)", self.factors.len())
    }
}

// ============================================================================
// keyring
// ============================================================================

/// all key material owned by one peer
///
/// no card semantics here; the deck and reveal modules call the point-wise
/// operations below.
pub struct Keyring {
    identity: SigningIdentity,
    peers: HashMap<PeerId, VerifyingKey>,
    modulus: Option<SharedModulus>,
    global: Option<GlobalKeyPair>,
    variations: Vec<KeyVariation>,
}

impl Keyring {
    pub fn new(identity: SigningIdentity) -> Self {
        Self {
            identity,
            peers: HashMap::new(),
            modulus: None,
            global: None,
            variations: Vec::new(),
        }
    }

    // === modulus ===

    /// generate and install a fresh shared modulus (session initiator)
    pub fn generate_shared_modulus<R: Rng + CryptoRng>(
        &mut self,
        bit_length: u64,
        rng: &mut R,
    ) -> Result<&SharedModulus> {
        let modulus = SharedModulus::generate(bit_length, rng)?;
        self.set_modulus(modulus);
        self.modulus()
    }

    /// install an agreed modulus; keys derived over a previous one are dropped
    pub fn set_modulus(&mut self, modulus: SharedModulus) {
        self.modulus = Some(modulus);
        self.global = None;
        self.variations.clear();
    }

    pub fn modulus(&self) -> Result<&SharedModulus> {
        self.modulus
            .as_ref()
            .ok_or_else(|| Error::InvalidModulus("shared modulus not established".into()))
    }

    // === global keypair ===

    pub fn generate_global_keypair<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<&GlobalKeyPair> {
        let keypair = GlobalKeyPair::generate(self.modulus()?, rng)?;
        self.variations.clear();
        Ok(&*self.global.insert(keypair))
    }

    pub fn global(&self) -> Result<&GlobalKeyPair> {
        self.global
            .as_ref()
            .ok_or_else(|| Error::InvalidModulus("global keypair not generated".into()))
    }

    // === variations ===

    /// replace this round's variations with `count` fresh ones
    pub fn generate_variations<R: Rng + CryptoRng>(
        &mut self,
        count: usize,
        rng: &mut R,
    ) -> Result<&[KeyVariation]> {
        let variations = generate_variations(count, self.global()?, self.modulus()?, rng)?;
        debug!(count, "generated key variations");
        self.variations = variations;
        Ok(&self.variations)
    }

    pub fn variation(&self, index: usize) -> Result<&KeyVariation> {
        self.variations.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.variations.len(),
        })
    }

    pub fn variation_count(&self) -> usize {
        self.variations.len()
    }

    /// forget this round's variations
    pub fn clear_variations(&mut self) {
        self.variations.clear();
    }

    // === point-wise cipher ===

    pub fn encrypt_global(&self, value: &BigUint) -> Result<BigUint> {
        Ok(self.modulus()?.pow(value, self.global()?.e()))
    }

    pub fn decrypt_global(&self, value: &BigUint) -> Result<BigUint> {
        Ok(self.modulus()?.pow(value, self.global()?.d()))
    }

    pub fn encrypt_variation(&self, value: &BigUint, index: usize) -> Result<BigUint> {
        let modulus = self.modulus()?;
        Ok(modulus.pow(value, self.variation(index)?.e()))
    }

    pub fn decrypt_variation(&self, value: &BigUint, index: usize) -> Result<BigUint> {
        let modulus = self.modulus()?;
        Ok(modulus.pow(value, self.variation(index)?.d()))
    }

    /// swap this peer's global layer at `index` for its variation layer
    pub fn rekey_variation(&self, value: &BigUint, index: usize) -> Result<BigUint> {
        let stripped = self.decrypt_global(value)?;
        self.encrypt_variation(&stripped, index)
    }

    /// apply a variation key disclosed by another peer
    pub fn decrypt_with(&self, value: &BigUint, disclosed: &BigUint) -> Result<BigUint> {
        Ok(self.modulus()?.pow(value, disclosed))
    }

    // === export ===

    /// global pair plus every variation factor, for escrow and audit
    pub fn export_keys(&self) -> Result<KeyMaterial> {
        let global = self.global()?;
        Ok(KeyMaterial {
            e: global.e().clone(),
            d: global.d().clone(),
            factors: self.variations.iter().map(|v| v.r().clone()).collect(),
        })
    }

    /// restore exported keys under the installed modulus
    pub fn import_keys(&mut self, material: KeyMaterial) -> Result<()> {
        let modulus = self.modulus()?;
        let global = GlobalKeyPair::from_parts(material.e, material.d, modulus)?;
        let variations = material
            .factors
            .into_iter()
            .map(|r| KeyVariation::derive(&global, r, modulus))
            .collect::<Result<Vec<_>>>()?;
        self.global = Some(global);
        self.variations = variations;
        Ok(())
    }

    // === peer authentication ===

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.identity.sign(message)
    }

    /// remember a peer's verifying key (exchanged by the transport)
    pub fn register_peer(&mut self, peer: PeerId, key: VerifyingKey) {
        self.peers.insert(peer, key);
    }

    /// verify a control message claimed to come from `peer`
    pub fn verify(&self, peer: &PeerId, message: &[u8], signature: &Signature) -> Result<()> {
        let key = self.peers.get(peer).ok_or_else(|| Error::UnknownPeer(peer.clone()))?;
        if verify_signature(key, message, signature) {
            Ok(())
        } else {
            Err(Error::SignatureInvalid { peer: peer.clone() })
        }
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("identity", &self.identity)
            .field("peers", &self.peers.len())
            .field("modulus", &self.modulus)
            .field("variations", &self.variations.len())
            .finish()
    }
}

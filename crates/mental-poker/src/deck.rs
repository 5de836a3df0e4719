//! card identities, the reference deck and the mutable round deck
//!
//! a card never travels as its identity. the reference deck maps each of the
//! 52 identities to a keyed commitment `hmac-sha256(session secret, name)`,
//! and only commitments (or their encryptions) enter the round deck.

use core::fmt;

use num_bigint::BigUint;
use rand::{CryptoRng, Rng};

use crate::signing::{mac, PeerId};
use crate::{par_map, wire, Error, Result, DECK_SIZE};

/// width of a card commitment
pub const COMMITMENT_BITS: u64 = 256;

// ============================================================================
// card identity
// ============================================================================

/// card rank (2-14, where 14 = ace)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Rank {
    Two = 2,
    Three = 3,
    Four = 4,
    Five = 5,
    Six = 6,
    Seven = 7,
    Eight = 8,
    Nine = 9,
    Ten = 10,
    Jack = 11,
    Queen = 12,
    King = 13,
    Ace = 14,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
        Rank::Ace,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }

    /// spelled-out name, part of the canonical card name
    pub fn name(self) -> &'static str {
        match self {
            Rank::Two => "two",
            Rank::Three => "three",
            Rank::Four => "four",
            Rank::Five => "five",
            Rank::Six => "six",
            Rank::Seven => "seven",
            Rank::Eight => "eight",
            Rank::Nine => "nine",
            Rank::Ten => "ten",
            Rank::Jack => "jack",
            Rank::Queen => "queen",
            Rank::King => "king",
            Rank::Ace => "ace",
        }
    }

    pub fn char(self) -> char {
        match self {
            Rank::Ten => 'T',
            Rank::Jack => 'J',
            Rank::Queen => 'Q',
            Rank::King => 'K',
            Rank::Ace => 'A',
            other => char::from(b'0' + other.value()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Suit {
    Clubs = 0,
    Diamonds = 1,
    Hearts = 2,
    Spades = 3,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades];

    pub fn name(self) -> &'static str {
        match self {
            Suit::Clubs => "clubs",
            Suit::Diamonds => "diamonds",
            Suit::Hearts => "hearts",
            Suit::Spades => "spades",
        }
    }

    pub fn char(self) -> char {
        match self {
            Suit::Clubs => '♣',
            Suit::Diamonds => '♦',
            Suit::Hearts => '♥',
            Suit::Spades => '♠',
        }
    }
}

/// what a card is, as opposed to where it sits in a deck
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CardId {
    pub rank: Rank,
    pub suit: Suit,
}

impl CardId {
    pub fn new(rank: Rank, suit: Suit) -> Self {
        Self { rank, suit }
    }

    /// all 52 identities, rank-major
    pub fn all() -> impl Iterator<Item = CardId> {
        Rank::ALL
            .into_iter()
            .flat_map(|rank| Suit::ALL.into_iter().map(move |suit| CardId::new(rank, suit)))
    }

    /// name hashed into the commitment, e.g. "ace of spades"
    pub fn canonical_name(&self) -> String {
        format!("{} of {}", self.rank.name(), self.suit.name())
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank.char(), self.suit.char())
    }
}

// ============================================================================
// reference deck
// ============================================================================

/// immutable identity -> commitment table for one session
#[derive(Clone, PartialEq, Eq)]
pub struct ReferenceDeck {
    entries: Vec<(CardId, BigUint)>,
}

impl ReferenceDeck {
    /// derive every commitment from the session secret; deterministic
    pub fn build(session_secret: &[u8]) -> Self {
        let entries = CardId::all()
            .map(|id| (id, commitment(session_secret, &id)))
            .collect();
        Self { entries }
    }

    pub fn commitment(&self, id: &CardId) -> Option<&BigUint> {
        self.entries.iter().find(|(card, _)| card == id).map(|(_, c)| c)
    }

    /// linear scan for the identity whose commitment equals `value`
    pub fn lookup_identity(&self, value: &BigUint) -> Result<CardId> {
        self.entries
            .iter()
            .find(|(_, commitment)| commitment == value)
            .map(|(id, _)| *id)
            .ok_or(Error::NotFound)
    }

    /// does `value` decrypt to the commitment of `id`
    pub fn verify_commitment(&self, id: &CardId, value: &BigUint) -> bool {
        self.commitment(id).map_or(false, |c| c == value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(CardId, BigUint)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ReferenceDeck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceDeck({} cards)", self.entries.len())
    }
}

fn commitment(session_secret: &[u8], id: &CardId) -> BigUint {
    BigUint::from_bytes_be(&mac(session_secret, &[id.canonical_name().as_bytes()]))
}

// ============================================================================
// round deck
// ============================================================================

/// one position of the round deck
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Card {
    pub position: usize,
    /// current residue mod n, under whatever layers have been applied
    pub value: BigUint,
    /// peers whose disclosed keys have been applied, in order
    pub revealed_by: Vec<PeerId>,
}

/// ordered 52 positions plus which peers' layers currently cover them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundDeck {
    cards: Vec<Card>,
    global_layers: Vec<PeerId>,
    variation_layers: Vec<PeerId>,
}

impl RoundDeck {
    /// the reference commitments in canonical order, unencrypted
    pub fn from_reference(reference: &ReferenceDeck) -> Self {
        Self::from_values(reference.iter().map(|(_, c)| c.clone()).collect())
    }

    pub(crate) fn from_values(values: Vec<BigUint>) -> Self {
        let cards = values
            .into_iter()
            .enumerate()
            .map(|(position, value)| Card { position, value, revealed_by: Vec::new() })
            .collect();
        Self { cards, global_layers: Vec::new(), variation_layers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn get(&self, position: usize) -> Result<&Card> {
        let count = self.cards.len();
        self.cards.get(position).ok_or(Error::IndexOutOfRange { index: position, count })
    }

    pub(crate) fn get_mut(&mut self, position: usize) -> Result<&mut Card> {
        let count = self.cards.len();
        self.cards.get_mut(position).ok_or(Error::IndexOutOfRange { index: position, count })
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn values(&self) -> impl Iterator<Item = &BigUint> {
        self.cards.iter().map(|c| &c.value)
    }

    /// peers whose global layer still covers every position
    pub fn global_layers(&self) -> &[PeerId] {
        &self.global_layers
    }

    /// peers whose variation layer covers every position
    pub fn variation_layers(&self) -> &[PeerId] {
        &self.variation_layers
    }

    pub(crate) fn set_layers(&mut self, global: Vec<PeerId>, variation: Vec<PeerId>) {
        self.global_layers = global;
        self.variation_layers = variation;
    }

    pub(crate) fn push_global_layer(&mut self, peer: PeerId) {
        self.global_layers.push(peer);
    }

    /// move `peer` from the global layers to the variation layers
    pub(crate) fn rekey_layer(&mut self, peer: &PeerId) {
        self.global_layers.retain(|p| p != peer);
        self.variation_layers.push(peer.clone());
    }

    /// uniform fisher-yates over the values; positions are renumbered
    pub fn shuffle<R: Rng + CryptoRng + ?Sized>(&mut self, rng: &mut R) {
        for i in (1..self.cards.len()).rev() {
            let j = rng.gen_range(0..=i);
            self.cards.swap(i, j);
        }
        for (position, card) in self.cards.iter_mut().enumerate() {
            card.position = position;
        }
    }

    /// replace every value with `f(position, value)`, fanning out per position
    pub(crate) fn map_values<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(usize, &BigUint) -> Result<BigUint> + Sync + Send,
    {
        let mapped = par_map(&self.cards, |i, card| f(i, &card.value));
        for (card, value) in self.cards.iter_mut().zip(mapped) {
            card.value = value?;
        }
        Ok(())
    }

    /// deck payload, one base-10 value per line
    pub fn serialize(&self) -> String {
        wire::encode_values(self.values())
    }

    /// parse a deck payload; any malformed line rejects the whole payload
    pub fn deserialize(payload: &str) -> Result<Self> {
        wire::decode_values(payload, DECK_SIZE).map(Self::from_values)
    }
}

//! reveal protocol state machine
//!
//! one `RevealRound` per peer per round. it owns no transport: the driver
//! feeds it decks and disclosures and ships whatever it returns.
//!
//! ```text
//! AwaitingSetup
//!   -> GlobalPass(0..N)     peer k: v^e for all positions, shuffle, pass to k+1
//!   -> VariationPass(0..N)  peer k: strip own global layer, apply e_i per position
//!   -> HandAssigned         positions i, i+N to turn index i; board at 2N..2N+5
//!   -> Revealing(owner)     others disclose d_i for the owner's positions
//!   -> Resolved
//! ```
//!
//! any error or timeout sends the round back to `AwaitingSetup` via `abort`.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deck::{CardId, ReferenceDeck, RoundDeck};
use crate::keyring::{Keyring, SharedModulus};
use crate::signing::PeerId;
use crate::timelock::RecoveredKeys;
use crate::{wire, Error, Result, BOARD_SIZE, DECK_SIZE};

// ============================================================================
// phases
// ============================================================================

/// which pass a deck payload has just completed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeckStage {
    /// sender finished its global pass
    Global,
    /// sender finished its variation pass
    Variation,
    /// last peer finished the variation pass; the deck is dealt
    Final,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    AwaitingSetup,
    /// peer at `turn` is due to encrypt and shuffle
    GlobalPass { turn: usize },
    /// peer at `turn` is due to re-key
    VariationPass { turn: usize },
    HandAssigned,
    Revealing { owner: PeerId },
    Resolved,
}

impl RoundPhase {
    /// the encrypted deck is final and hands are fixed
    pub fn is_dealt(&self) -> bool {
        matches!(
            self,
            RoundPhase::HandAssigned | RoundPhase::Revealing { .. } | RoundPhase::Resolved
        )
    }
}

// ============================================================================
// hand assignment
// ============================================================================

/// turn order and the positions it implies
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandAssignment {
    turn_order: Vec<PeerId>,
}

impl HandAssignment {
    pub fn new(turn_order: Vec<PeerId>) -> Result<Self> {
        let n = turn_order.len();
        if n < 2 {
            return Err(Error::Config(format!("need at least 2 peers, got {}", n)));
        }
        if 2 * n + BOARD_SIZE > DECK_SIZE {
            return Err(Error::Config(format!("{} peers do not fit one deck", n)));
        }
        for (i, peer) in turn_order.iter().enumerate() {
            if turn_order[..i].contains(peer) {
                return Err(Error::Config(format!("peer {} appears twice in turn order", peer)));
            }
        }
        Ok(Self { turn_order })
    }

    pub fn turn_order(&self) -> &[PeerId] {
        &self.turn_order
    }

    pub fn peer_count(&self) -> usize {
        self.turn_order.len()
    }

    pub fn turn_index(&self, peer: &PeerId) -> Result<usize> {
        self.turn_order
            .iter()
            .position(|p| p == peer)
            .ok_or_else(|| Error::UnknownPeer(peer.clone()))
    }

    /// positions `i` and `i + N` for the peer at turn index `i`
    pub fn hand(&self, peer: &PeerId) -> Result<[usize; 2]> {
        let i = self.turn_index(peer)?;
        Ok([i, i + self.peer_count()])
    }

    pub fn board(&self) -> [usize; BOARD_SIZE] {
        let first = 2 * self.peer_count();
        core::array::from_fn(|k| first + k)
    }

    pub fn is_board(&self, position: usize) -> bool {
        let first = 2 * self.peer_count();
        (first..first + BOARD_SIZE).contains(&position)
    }

    /// a key request names exactly one hand, the requester's, or exactly the board
    pub fn is_request_for(&self, requester: &PeerId, positions: &[usize]) -> bool {
        positions == self.board() || self.hand(requester).map_or(false, |hand| positions == hand)
    }

    /// hand owner of `position`; none for board and undealt positions
    pub fn owner_of(&self, position: usize) -> Option<&PeerId> {
        if position < 2 * self.peer_count() {
            self.turn_order.get(position % self.peer_count())
        } else {
            None
        }
    }
}

// ============================================================================
// round
// ============================================================================

#[derive(Debug)]
pub struct RevealRound {
    local: PeerId,
    index: usize,
    assignment: HandAssignment,
    phase: RoundPhase,
    acted_global: bool,
    acted_variation: bool,
    deck: Option<RoundDeck>,
    /// position -> peer -> disclosed d_i
    disclosed: BTreeMap<usize, BTreeMap<PeerId, BigUint>>,
    resolved: BTreeMap<usize, CardId>,
}

impl RevealRound {
    pub fn new(local: PeerId, assignment: HandAssignment) -> Result<Self> {
        let index = assignment.turn_index(&local)?;
        Ok(Self {
            local,
            index,
            assignment,
            phase: RoundPhase::AwaitingSetup,
            acted_global: false,
            acted_variation: false,
            deck: None,
            disclosed: BTreeMap::new(),
            resolved: BTreeMap::new(),
        })
    }

    pub fn phase(&self) -> &RoundPhase {
        &self.phase
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn assignment(&self) -> &HandAssignment {
        &self.assignment
    }

    /// the dealt deck, once the variation pass has completed
    pub fn deck(&self) -> Option<&RoundDeck> {
        self.deck.as_ref()
    }

    pub fn resolved(&self) -> &BTreeMap<usize, CardId> {
        &self.resolved
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.assignment.peer_count()
    }

    /// peer that receives this peer's passes
    pub fn successor(&self) -> &PeerId {
        let order = self.assignment.turn_order();
        &order[(self.index + 1) % order.len()]
    }

    fn peer_at(&self, index: usize) -> &PeerId {
        &self.assignment.turn_order()[index]
    }

    /// who the next deck payload should come from
    pub fn expected_deck_sender(&self) -> &PeerId {
        let n = self.assignment.peer_count();
        if self.acted_variation {
            self.peer_at(n - 1)
        } else {
            self.peer_at((self.index + n - 1) % n)
        }
    }

    fn out_of_sequence(&self, what: impl core::fmt::Display) -> Error {
        Error::OutOfSequence(format!("{} during {:?} at turn {}", what, self.phase, self.index))
    }

    // === deal ===

    pub fn begin(&mut self) -> Result<()> {
        if self.phase != RoundPhase::AwaitingSetup {
            return Err(self.out_of_sequence("begin"));
        }
        self.phase = RoundPhase::GlobalPass { turn: 0 };
        Ok(())
    }

    /// the unencrypted round deck; only the first peer starts from it
    pub fn start_deck(&self, reference: &ReferenceDeck) -> Result<RoundDeck> {
        if !self.is_first() || self.acted_global || self.phase != (RoundPhase::GlobalPass { turn: 0 }) {
            return Err(self.out_of_sequence("start deck"));
        }
        Ok(RoundDeck::from_reference(reference))
    }

    /// install a deck payload received from `from`
    pub fn accept_deck(
        &mut self,
        stage: DeckStage,
        from: &PeerId,
        payload: &str,
        modulus: &SharedModulus,
    ) -> Result<RoundDeck> {
        if !matches!(self.phase, RoundPhase::GlobalPass { .. } | RoundPhase::VariationPass { .. }) {
            return Err(self.out_of_sequence(format!("{:?} deck from {}", stage, from)));
        }

        let sender = self.assignment.turn_index(from)?;
        let order = self.assignment.turn_order();
        let n = order.len();
        let k = self.index;

        let (global, variation, next) = match stage {
            DeckStage::Global if k > 0 && sender == k - 1 && !self.acted_global => {
                (order[..k].to_vec(), Vec::new(), RoundPhase::GlobalPass { turn: k })
            }
            DeckStage::Global if k == 0 && sender == n - 1 && self.acted_global && !self.acted_variation => {
                (order.to_vec(), Vec::new(), RoundPhase::VariationPass { turn: 0 })
            }
            DeckStage::Variation if k > 0 && sender == k - 1 && self.acted_global && !self.acted_variation => {
                (order[k..].to_vec(), order[..k].to_vec(), RoundPhase::VariationPass { turn: k })
            }
            DeckStage::Final if sender == n - 1 && k != n - 1 && self.acted_variation => {
                (Vec::new(), order.to_vec(), RoundPhase::HandAssigned)
            }
            _ => return Err(self.out_of_sequence(format!("{:?} deck from {}", stage, from))),
        };

        let values = wire::decode_values(payload, DECK_SIZE)?;
        if let Some(i) = values.iter().position(|v| v >= modulus.n()) {
            return Err(Error::malformed(i + 1, "value is not a residue of the shared modulus"));
        }
        let mut deck = RoundDeck::from_values(values);
        deck.set_layers(global, variation);

        debug!(?stage, from = %from, "accepted deck");
        if next == RoundPhase::HandAssigned {
            self.deck = Some(deck.clone());
        }
        self.phase = next;
        Ok(deck)
    }

    /// encrypt every position with the global key, then shuffle
    pub fn global_pass<R: Rng + CryptoRng>(
        &mut self,
        mut deck: RoundDeck,
        keyring: &Keyring,
        rng: &mut R,
    ) -> Result<RoundDeck> {
        if self.phase != (RoundPhase::GlobalPass { turn: self.index }) || self.acted_global {
            return Err(self.out_of_sequence("global pass"));
        }
        let order = self.assignment.turn_order();
        if deck.global_layers() != &order[..self.index] || !deck.variation_layers().is_empty() {
            return Err(self.out_of_sequence("global pass over a deck with unexpected layers"));
        }

        deck.map_values(|_, v| keyring.encrypt_global(v))?;
        deck.shuffle(rng);
        deck.push_global_layer(self.local.clone());

        self.acted_global = true;
        self.phase = if self.is_last() {
            RoundPhase::VariationPass { turn: 0 }
        } else {
            RoundPhase::GlobalPass { turn: self.index + 1 }
        };
        debug!(turn = self.index, "global pass done");
        Ok(deck)
    }

    /// swap this peer's global layer for its per-position variation layer
    pub fn variation_pass(&mut self, mut deck: RoundDeck, keyring: &Keyring) -> Result<RoundDeck> {
        if self.phase != (RoundPhase::VariationPass { turn: self.index }) || self.acted_variation {
            return Err(self.out_of_sequence("variation pass"));
        }
        let order = self.assignment.turn_order();
        if deck.global_layers() != &order[self.index..] || deck.variation_layers() != &order[..self.index] {
            return Err(self.out_of_sequence("variation pass over a deck with unexpected layers"));
        }

        deck.map_values(|i, v| keyring.rekey_variation(v, i))?;
        deck.rekey_layer(&self.local);

        self.acted_variation = true;
        if self.is_last() {
            self.deck = Some(deck.clone());
            self.phase = RoundPhase::HandAssigned;
        } else {
            self.phase = RoundPhase::VariationPass { turn: self.index + 1 };
        }
        debug!(turn = self.index, "variation pass done");
        Ok(deck)
    }

    // === reveal ===

    /// this peer's two positions
    pub fn hand(&self) -> [usize; 2] {
        let n = self.assignment.peer_count();
        [self.index, self.index + n]
    }

    /// start revealing the local hand
    pub fn request_hand(&mut self) -> Result<[usize; 2]> {
        if self.phase != RoundPhase::HandAssigned {
            return Err(self.out_of_sequence("hand request"));
        }
        self.phase = RoundPhase::Revealing { owner: self.local.clone() };
        Ok(self.hand())
    }

    /// variation keys for `positions`, if `requester` is entitled to them
    ///
    /// a request is either the requester's own two hand positions or the five
    /// board positions. anything else, another peer's hand included, is
    /// refused whole.
    pub fn disclose(&self, requester: &PeerId, positions: &[usize], keyring: &Keyring) -> Result<Vec<BigUint>> {
        if !self.phase.is_dealt() {
            return Err(self.out_of_sequence(format!("key request from {}", requester)));
        }
        self.assignment.turn_index(requester)?;
        if requester == &self.local {
            return Err(self.out_of_sequence("key request from self"));
        }
        if !self.assignment.is_request_for(requester, positions) {
            return Err(Error::OutOfSequence(format!(
                "refusing to disclose positions {:?} to {}",
                positions, requester
            )));
        }

        positions
            .iter()
            .map(|&position| Ok(keyring.variation(position)?.d().clone()))
            .collect()
    }

    fn check_discloser(&self, from: &PeerId) -> Result<()> {
        if !self.phase.is_dealt() {
            return Err(self.out_of_sequence(format!("disclosure from {}", from)));
        }
        self.assignment.turn_index(from)?;
        if from == &self.local {
            return Err(self.out_of_sequence("disclosure from self"));
        }
        Ok(())
    }

    fn store_keys(&mut self, from: &PeerId, positions: &[usize], keys: Vec<BigUint>) {
        for (&position, key) in positions.iter().zip(keys) {
            self.disclosed.entry(position).or_default().insert(from.clone(), key);
        }
    }

    /// store keys disclosed by `from`, one per position
    ///
    /// the positions must answer one of our requests: our hand (two lines)
    /// or the board (five lines).
    pub fn accept_disclosure(&mut self, from: &PeerId, positions: &[usize], keys: Vec<BigUint>) -> Result<()> {
        self.check_discloser(from)?;
        if keys.len() != positions.len() {
            return Err(Error::malformed(
                keys.len().min(positions.len()) + 1,
                format!("{} keys for {} positions", keys.len(), positions.len()),
            ));
        }
        if !self.assignment.is_request_for(&self.local, positions) {
            return Err(Error::malformed(
                1,
                format!("disclosure for {:?} is neither our hand nor the board", positions),
            ));
        }
        self.store_keys(from, positions, keys);
        Ok(())
    }

    /// store keys for `positions` recomputed from `from`'s opened escrow
    ///
    /// only our hand and board positions are taken, whatever the escrow holds.
    pub fn accept_recovered(
        &mut self,
        from: &PeerId,
        positions: &[usize],
        recovered: &RecoveredKeys,
        modulus: &SharedModulus,
    ) -> Result<()> {
        self.check_discloser(from)?;
        let hand = self.hand();
        if let Some(&position) = positions
            .iter()
            .find(|&&p| !hand.contains(&p) && !self.assignment.is_board(p))
        {
            return Err(self.out_of_sequence(format!("recovering foreign position {}", position)));
        }
        let keys = positions
            .iter()
            .map(|&position| recovered.variation_d(position, modulus))
            .collect::<Result<Vec<_>>>()?;
        self.store_keys(from, positions, keys);
        Ok(())
    }

    /// peers whose key is still missing for any of `positions`
    pub fn missing_keys(&self, positions: &[usize]) -> Vec<PeerId> {
        self.assignment
            .turn_order()
            .iter()
            .filter(|peer| *peer != &self.local)
            .filter(|peer| {
                positions.iter().any(|position| {
                    self.disclosed.get(position).map_or(true, |keys| !keys.contains_key(*peer))
                })
            })
            .cloned()
            .collect()
    }

    /// strip every variation layer from `position` and look the card up
    pub fn resolve(&mut self, position: usize, keyring: &Keyring, reference: &ReferenceDeck) -> Result<CardId> {
        if let Some(id) = self.resolved.get(&position) {
            return Ok(*id);
        }
        if !self.phase.is_dealt() {
            return Err(self.out_of_sequence(format!("resolve position {}", position)));
        }
        if !self.hand().contains(&position) && !self.assignment.is_board(position) {
            return Err(self.out_of_sequence(format!("resolve foreign position {}", position)));
        }

        let order = self.assignment.turn_order();
        let deck = self.deck.as_mut().ok_or_else(|| Error::OutOfSequence("no dealt deck".into()))?;
        if !deck.global_layers().is_empty() || deck.variation_layers() != order {
            return Err(Error::OutOfSequence(format!(
                "position {} still carries global layers from {:?}",
                position,
                deck.global_layers()
            )));
        }

        let keys = self.disclosed.get(&position);
        let card = deck.get_mut(position)?;
        let mut value = card.value.clone();
        let mut revealed_by = Vec::with_capacity(order.len());
        for peer in order {
            value = if peer == &self.local {
                keyring.decrypt_variation(&value, position)?
            } else {
                let key = keys
                    .and_then(|k| k.get(peer))
                    .ok_or_else(|| Error::OutOfSequence(format!("no key from {} for position {}", peer, position)))?;
                keyring.decrypt_with(&value, key)?
            };
            revealed_by.push(peer.clone());
        }

        let id = reference.lookup_identity(&value)?;
        card.value = value;
        card.revealed_by = revealed_by;
        self.resolved.insert(position, id);
        debug!(position, "resolved position");
        Ok(id)
    }

    /// resolve both hand positions; ends the round for this peer
    pub fn resolve_hand(&mut self, keyring: &Keyring, reference: &ReferenceDeck) -> Result<[CardId; 2]> {
        if self.phase != (RoundPhase::Revealing { owner: self.local.clone() }) {
            return Err(self.out_of_sequence("resolve hand"));
        }
        let [first, second] = self.hand();
        let hand = [self.resolve(first, keyring, reference)?, self.resolve(second, keyring, reference)?];
        self.phase = RoundPhase::Resolved;
        Ok(hand)
    }

    pub fn resolve_board(&mut self, keyring: &Keyring, reference: &ReferenceDeck) -> Result<Vec<CardId>> {
        self.assignment
            .board()
            .into_iter()
            .map(|position| self.resolve(position, keyring, reference))
            .collect()
    }

    /// drop the round deck and every disclosed key
    pub fn abort(&mut self) {
        self.phase = RoundPhase::AwaitingSetup;
        self.acted_global = false;
        self.acted_variation = false;
        self.deck = None;
        self.disclosed.clear();
        self.resolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|n| PeerId::new(*n).unwrap()).collect()
    }

    #[test]
    fn test_hand_positions() {
        let assignment = HandAssignment::new(peers(&["a", "b", "c"])).unwrap();
        let [a, b, c] = [0, 1, 2].map(|i| assignment.turn_order()[i].clone());

        assert_eq!(assignment.hand(&a).unwrap(), [0, 3]);
        assert_eq!(assignment.hand(&b).unwrap(), [1, 4]);
        assert_eq!(assignment.hand(&c).unwrap(), [2, 5]);
        assert_eq!(assignment.board(), [6, 7, 8, 9, 10]);

        assert_eq!(assignment.owner_of(4), Some(&b));
        assert_eq!(assignment.owner_of(6), None);
        assert!(assignment.is_board(10));
        assert!(!assignment.is_board(11));
    }

    #[test]
    fn test_assignment_bounds() {
        assert!(HandAssignment::new(peers(&["solo"])).is_err());
        assert!(HandAssignment::new(peers(&["a", "a"])).is_err());

        let names: Vec<String> = (0..23).map(|i| format!("p{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        assert!(HandAssignment::new(peers(&refs)).is_ok());
        let names: Vec<String> = (0..24).map(|i| format!("p{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        assert!(HandAssignment::new(peers(&refs)).is_err());
    }

    #[test]
    fn test_unknown_local_peer() {
        let assignment = HandAssignment::new(peers(&["a", "b"])).unwrap();
        let err = RevealRound::new(PeerId::new("z").unwrap(), assignment).unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[test]
    fn test_phase_guards() {
        let order = peers(&["a", "b", "c"]);
        let assignment = HandAssignment::new(order.clone()).unwrap();
        let mut round = RevealRound::new(order[1].clone(), assignment).unwrap();

        assert!(round.request_hand().is_err());
        round.begin().unwrap();
        assert!(round.begin().is_err());
        assert_eq!(round.phase(), &RoundPhase::GlobalPass { turn: 0 });
        assert_eq!(round.expected_deck_sender(), &order[0]);
        assert_eq!(round.successor(), &order[2]);

        round.abort();
        assert_eq!(round.phase(), &RoundPhase::AwaitingSetup);
    }

    #[test]
    fn test_missing_keys() {
        let order = peers(&["a", "b", "c"]);
        let assignment = HandAssignment::new(order.clone()).unwrap();
        let mut round = RevealRound::new(order[0].clone(), assignment).unwrap();
        round.phase = RoundPhase::HandAssigned;

        assert_eq!(round.missing_keys(&[0, 3]), vec![order[1].clone(), order[2].clone()]);
        round
            .accept_disclosure(&order[1], &[0, 3], vec![BigUint::from(5u32), BigUint::from(7u32)])
            .unwrap();
        assert_eq!(round.missing_keys(&[0, 3]), vec![order[2].clone()]);

        assert!(matches!(
            round.accept_disclosure(&order[2], &[0, 3], vec![BigUint::from(5u32)]),
            Err(Error::MalformedPayload { .. })
        ));
        assert!(round.accept_disclosure(&order[0], &[0], vec![BigUint::from(1u32)]).is_err());
    }

    #[test]
    fn test_request_shapes() {
        let order = peers(&["a", "b", "c"]);
        let assignment = HandAssignment::new(order.clone()).unwrap();

        assert!(assignment.is_request_for(&order[0], &[0, 3]));
        assert!(assignment.is_request_for(&order[0], &[6, 7, 8, 9, 10]));
        assert!(!assignment.is_request_for(&order[0], &[1, 4]));
        assert!(!assignment.is_request_for(&order[0], &[3, 0]));
        assert!(!assignment.is_request_for(&order[0], &[0, 3, 6, 7, 8, 9, 10]));
        assert!(!assignment.is_request_for(&order[0], &[6, 7]));
        assert!(!assignment.is_request_for(&order[0], &[]));
    }

    #[test]
    fn test_disclosure_must_match_a_request() {
        let order = peers(&["a", "b", "c"]);
        let assignment = HandAssignment::new(order.clone()).unwrap();
        let mut round = RevealRound::new(order[0].clone(), assignment).unwrap();
        round.phase = RoundPhase::HandAssigned;
        let keys = |count: u32| (1..=count).map(BigUint::from).collect::<Vec<_>>();

        // hand and board in one payload is neither shape
        let combined = [0, 3, 6, 7, 8, 9, 10];
        assert!(matches!(
            round.accept_disclosure(&order[1], &combined, keys(7)),
            Err(Error::MalformedPayload { .. })
        ));
        // someone else's hand
        assert!(matches!(
            round.accept_disclosure(&order[1], &[1, 4], keys(2)),
            Err(Error::MalformedPayload { .. })
        ));
        assert_eq!(round.missing_keys(&combined).len(), 2);

        round.accept_disclosure(&order[1], &[0, 3], keys(2)).unwrap();
        round.accept_disclosure(&order[1], &[6, 7, 8, 9, 10], keys(5)).unwrap();
        assert_eq!(round.missing_keys(&combined), vec![order[2].clone()]);
    }
}

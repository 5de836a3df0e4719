//! end-to-end protocol scenarios, driven synchronously without a transport

use std::collections::HashSet;
use std::time::{Duration, Instant};

use num_bigint::BigUint;
use proptest::prelude::*;
use rand::rngs::OsRng;

use crate::keyring::tests::{test_keyring, test_modulus};
use crate::reveal::{DeckStage, HandAssignment, RevealRound, RoundPhase};
use crate::timelock::tests::test_puzzle_modulus;
use crate::timelock::{calibrate_squaring_rate, lock, unlock};
use crate::{CardId, Error, Keyring, PeerId, ReferenceDeck, RoundDeck, SharedModulus, DECK_SIZE};

struct Peer {
    id: PeerId,
    keyring: Keyring,
    round: RevealRound,
}

/// peers named after `names`, in turn order, with fresh round keys
fn table(names: &[&str], modulus: &SharedModulus) -> Vec<Peer> {
    let order: Vec<PeerId> = names.iter().map(|n| PeerId::new(*n).unwrap()).collect();
    let assignment = HandAssignment::new(order.clone()).unwrap();
    order
        .into_iter()
        .map(|id| {
            let mut round = RevealRound::new(id.clone(), assignment.clone()).unwrap();
            round.begin().unwrap();
            Peer { id, keyring: test_keyring(modulus, DECK_SIZE), round }
        })
        .collect()
}

/// run both passes around the table, handing payloads over as text
fn deal(peers: &mut [Peer], reference: &ReferenceDeck, modulus: &SharedModulus) -> RoundDeck {
    let n = peers.len();

    let mut deck = peers[0].round.start_deck(reference).unwrap();
    for k in 0..n {
        if k > 0 {
            let from = peers[k - 1].id.clone();
            deck = peers[k]
                .round
                .accept_deck(DeckStage::Global, &from, &deck.serialize(), modulus)
                .unwrap();
        }
        let peer = &mut peers[k];
        deck = peer.round.global_pass(deck, &peer.keyring, &mut OsRng).unwrap();
    }

    for k in 0..n {
        let (stage, from) = if k == 0 {
            (DeckStage::Global, peers[n - 1].id.clone())
        } else {
            (DeckStage::Variation, peers[k - 1].id.clone())
        };
        deck = peers[k].round.accept_deck(stage, &from, &deck.serialize(), modulus).unwrap();
        let peer = &mut peers[k];
        deck = peer.round.variation_pass(deck, &peer.keyring).unwrap();
    }

    let last = peers[n - 1].id.clone();
    let payload = deck.serialize();
    for peer in &mut peers[..n - 1] {
        peer.round.accept_deck(DeckStage::Final, &last, &payload, modulus).unwrap();
    }
    for peer in peers.iter() {
        assert_eq!(peer.round.phase(), &RoundPhase::HandAssigned);
    }
    deck
}

/// every other peer discloses `positions` to `owner`
fn disclose_to(peers: &mut [Peer], owner: usize, positions: &[usize]) {
    let requester = peers[owner].id.clone();
    for k in 0..peers.len() {
        if k == owner {
            continue;
        }
        let keys = peers[k].round.disclose(&requester, positions, &peers[k].keyring).unwrap();
        let from = peers[k].id.clone();
        peers[owner].round.accept_disclosure(&from, positions, keys).unwrap();
    }
}

#[test]
fn test_three_peer_round() {
    let modulus = test_modulus();
    let reference = ReferenceDeck::build(b"test");
    let mut peers = table(&["a", "b", "c"], &modulus);
    deal(&mut peers, &reference, &modulus);

    let expected_hands = [[0, 3], [1, 4], [2, 5]];
    let board = peers[0].round.assignment().board();
    let mut seen: HashSet<CardId> = HashSet::new();
    let mut boards = Vec::new();

    for owner in 0..3 {
        let hand = peers[owner].round.request_hand().unwrap();
        assert_eq!(hand, expected_hands[owner]);

        disclose_to(&mut peers, owner, &hand);
        disclose_to(&mut peers, owner, &board);

        let peer = &mut peers[owner];
        let cards = peer.round.resolve_hand(&peer.keyring, &reference).unwrap();
        assert_eq!(peer.round.phase(), &RoundPhase::Resolved);
        for card in cards {
            assert!(seen.insert(card), "{} dealt twice", card);
        }
        boards.push(peer.round.resolve_board(&peer.keyring, &reference).unwrap());

        // every layer was stripped, in turn order
        let dealt = peer.round.deck().unwrap();
        let order = peer.round.assignment().turn_order().to_vec();
        assert_eq!(dealt.get(hand[0]).unwrap().revealed_by, order);
    }

    assert!(boards.windows(2).all(|w| w[0] == w[1]));
    for card in &boards[0] {
        assert!(seen.insert(*card), "board card {} also in a hand", card);
    }
    assert_eq!(seen.len(), 11);
}

#[test]
fn test_selective_disclosure() {
    let modulus = test_modulus();
    let reference = ReferenceDeck::build(b"test");
    let mut peers = table(&["a", "b", "c"], &modulus);
    deal(&mut peers, &reference, &modulus);

    let a = peers[0].id.clone();
    let b = &peers[1];

    // b's own hand and c's hand are never disclosed to a
    for position in [1, 4, 2, 5] {
        let err = b.round.disclose(&a, &[position], &b.keyring).unwrap_err();
        assert!(matches!(err, Error::OutOfSequence(_)), "position {}", position);
    }
    // a mixed request is refused whole, even hand plus board
    assert!(b.round.disclose(&a, &[0, 1], &b.keyring).is_err());
    assert!(b.round.disclose(&a, &[0, 3, 6, 7, 8, 9, 10], &b.keyring).is_err());
    assert!(b.round.disclose(&a, &[6, 7], &b.keyring).is_err());
    assert_eq!(b.round.disclose(&a, &[0, 3], &b.keyring).unwrap().len(), 2);
    assert_eq!(b.round.disclose(&a, &[6, 7, 8, 9, 10], &b.keyring).unwrap().len(), 5);

    // with one peer's key missing nothing resolves
    peers[0].round.request_hand().unwrap();
    let keys = peers[1].round.disclose(&a, &[0, 3], &peers[1].keyring).unwrap();
    let from = peers[1].id.clone();
    peers[0].round.accept_disclosure(&from, &[0, 3], keys).unwrap();

    let peer = &mut peers[0];
    assert!(matches!(
        peer.round.resolve(0, &peer.keyring, &reference),
        Err(Error::OutOfSequence(_))
    ));
    // a's own key cannot open b's position either
    assert!(peer.round.resolve(1, &peer.keyring, &reference).is_err());
}

#[test]
fn test_wrong_key_does_not_resolve() {
    let modulus = test_modulus();
    let reference = ReferenceDeck::build(b"test");
    let mut peers = table(&["a", "b"], &modulus);
    deal(&mut peers, &reference, &modulus);

    peers[0].round.request_hand().unwrap();
    // b hands over the key for the wrong position
    let wrong = peers[1].keyring.variation(6).unwrap().d().clone();
    let correct = peers[1].keyring.variation(2).unwrap().d().clone();
    let b = peers[1].id.clone();
    peers[0].round.accept_disclosure(&b, &[0, 2], vec![wrong, correct]).unwrap();

    let peer = &mut peers[0];
    assert!(matches!(
        peer.round.resolve(0, &peer.keyring, &reference),
        Err(Error::NotFound)
    ));
    assert!(peer.round.resolve(2, &peer.keyring, &reference).is_ok());
}

#[test]
fn test_deck_integrity() {
    let modulus = test_modulus();
    let reference = ReferenceDeck::build(b"test");
    let mut peers = table(&["a", "b", "c"], &modulus);
    let dealt = deal(&mut peers, &reference, &modulus);

    // with every variation key, all 52 positions open to distinct reference cards
    let opened: HashSet<CardId> = dealt
        .cards()
        .iter()
        .map(|card| {
            let value = peers.iter().fold(card.value.clone(), |v, peer| {
                peer.keyring.decrypt_variation(&v, card.position).unwrap()
            });
            reference.lookup_identity(&value).unwrap()
        })
        .collect();
    assert_eq!(opened.len(), DECK_SIZE);

    // nothing in the dealt deck is a bare commitment
    assert!(dealt.values().all(|v| reference.lookup_identity(v).is_err()));
}

#[test]
fn test_out_of_turn_passes_rejected() {
    let modulus = test_modulus();
    let reference = ReferenceDeck::build(b"test");
    let mut peers = table(&["a", "b", "c"], &modulus);

    let deck = peers[0].round.start_deck(&reference).unwrap();
    let payload = deck.serialize();

    // c cannot take a deck straight from a
    let a = peers[0].id.clone();
    assert!(matches!(
        peers[2].round.accept_deck(DeckStage::Global, &a, &payload, &modulus),
        Err(Error::OutOfSequence(_))
    ));
    // b cannot act before receiving a deck
    let peer = &mut peers[1];
    assert!(peer.round.global_pass(deck.clone(), &peer.keyring, &mut OsRng).is_err());
    // a variation pass before the global pass is refused
    let peer = &mut peers[0];
    assert!(peer.round.variation_pass(deck, &peer.keyring).is_err());
    // a value outside the modulus rejects the whole deck
    let oversized = format!("{}\n", modulus.n()).repeat(DECK_SIZE);
    assert!(matches!(
        peers[1].round.accept_deck(DeckStage::Global, &a, &oversized, &modulus),
        Err(Error::MalformedPayload { .. })
    ));
}

#[test]
fn test_shuffle_non_identity() {
    let reference = ReferenceDeck::build(b"test");
    let canonical = RoundDeck::from_reference(&reference);
    let identical = (0..1000)
        .filter(|_| {
            let mut deck = canonical.clone();
            deck.shuffle(&mut OsRng);
            deck.values().eq(canonical.values())
        })
        .count();
    assert!(identical < 10, "{} of 1000 shuffles left the deck unchanged", identical);
}

#[test]
fn test_timelock_delay_band() {
    let modulus = test_puzzle_modulus();
    let rate = calibrate_squaring_rate(modulus.n(), 20_000);
    let key = BigUint::from(0xfeed_u32);
    let delay = Duration::from_millis(200);

    let puzzle = lock(&key, delay, rate, &modulus);
    let start = Instant::now();
    assert_eq!(unlock(&puzzle), key);
    let elapsed = start.elapsed();

    assert!(elapsed >= delay / 5, "unlock took {:?}, expected about {:?}", elapsed, delay);
    assert!(elapsed <= delay * 10, "unlock took {:?}, expected about {:?}", elapsed, delay);
}

#[test]
fn test_keyring_payload_restores_decryption() {
    let modulus = test_modulus();
    let keyring = test_keyring(&modulus, 4);
    let payload = crate::wire::encode_key_material(&keyring.export_keys().unwrap());

    let mut restored = Keyring::new(crate::SigningIdentity::generate(&mut OsRng));
    restored.set_modulus(modulus.clone());
    restored.import_keys(crate::wire::decode_key_material(&payload).unwrap()).unwrap();

    let c = keyring.encrypt_variation(&BigUint::from(31337u32), 2).unwrap();
    assert_eq!(restored.decrypt_variation(&c, 2).unwrap(), BigUint::from(31337u32));
}

// ============================================================================
// algebraic properties
// ============================================================================

fn property_keyrings() -> &'static [Keyring; 2] {
    use std::sync::OnceLock;
    static KEYRINGS: OnceLock<[Keyring; 2]> = OnceLock::new();
    KEYRINGS.get_or_init(|| {
        let modulus = test_modulus();
        [test_keyring(&modulus, 8), test_keyring(&modulus, 8)]
    })
}

proptest! {
    #[test]
    fn prop_layers_commute(v in 2u128..u128::MAX) {
        let [a, b] = property_keyrings();
        let v = BigUint::from(v);

        let ab = b.encrypt_global(&a.encrypt_global(&v).unwrap()).unwrap();
        let ba = a.encrypt_global(&b.encrypt_global(&v).unwrap()).unwrap();
        prop_assert_eq!(&ab, &ba);

        let opened = a.decrypt_global(&b.decrypt_global(&ab).unwrap()).unwrap();
        prop_assert_eq!(opened, v);
    }

    #[test]
    fn prop_variation_roundtrip(v in 2u128..u128::MAX, index in 0usize..8) {
        let [a, b] = property_keyrings();
        let v = BigUint::from(v);

        let c = a.encrypt_variation(&b.encrypt_variation(&v, index).unwrap(), index).unwrap();
        let opened = b.decrypt_variation(&a.decrypt_variation(&c, index).unwrap(), index).unwrap();
        prop_assert_eq!(opened, v);
    }

    #[test]
    fn prop_rekey_matches_variation(v in 2u128..u128::MAX, index in 0usize..8) {
        let [a, _] = property_keyrings();
        let v = BigUint::from(v);

        let rekeyed = a.rekey_variation(&a.encrypt_global(&v).unwrap(), index).unwrap();
        prop_assert_eq!(rekeyed, a.encrypt_variation(&v, index).unwrap());
    }
}

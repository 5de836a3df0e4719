//! async round driver
//!
//! owns the session and one `PeerLink`, and walks the reveal state machine
//! through a round: emit a message, await the expected reply with a timeout.
//! messages that arrive early are stashed until the driver asks for them.
//!
//! ```text
//! establish_modulus   once per session; first peer generates, others receive;
//!                     every peer also draws its private puzzle modulus
//! prepare_round       fresh variations, escrow broadcast, collect escrows
//! deal                global pass, variation pass, final deck
//! reveal              request own hand and board keys, serve others' requests
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};

use rand::rngs::OsRng;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::GameConfig;
use crate::deck::{CardId, ReferenceDeck};
use crate::keyring::{Keyring, SharedModulus};
use crate::network::{Envelope, Message, PeerLink};
use crate::reveal::{DeckStage, HandAssignment, RevealRound, RoundPhase};
use crate::signing::{PeerId, SigningIdentity, VerifyingKey};
use crate::timelock::{spawn_calibration, KeyEscrow, PuzzleModulus, SquaringRate};
use crate::{wire, Error, Result, DECK_SIZE};

// ============================================================================
// session
// ============================================================================

/// everything that outlives a single round
#[derive(Debug)]
pub struct Session {
    config: GameConfig,
    keyring: Keyring,
    reference: ReferenceDeck,
    assignment: HandAssignment,
    escrows: HashMap<PeerId, KeyEscrow>,
    puzzle: Option<PuzzleModulus>,
    rate: Option<SquaringRate>,
    round: u64,
}

impl Session {
    /// the local peer is the one `identity` names; it must be in `turn_order`
    pub fn new(config: GameConfig, identity: SigningIdentity, turn_order: Vec<PeerId>) -> Result<Self> {
        config.validate()?;
        let assignment = HandAssignment::new(turn_order)?;
        assignment.turn_index(&identity.peer_id())?;
        let reference = ReferenceDeck::build(config.session_secret.as_bytes());

        Ok(Self {
            config,
            keyring: Keyring::new(identity),
            reference,
            assignment,
            escrows: HashMap::new(),
            puzzle: None,
            rate: None,
            round: 0,
        })
    }

    pub fn local(&self) -> PeerId {
        self.keyring.identity().peer_id()
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn reference(&self) -> &ReferenceDeck {
        &self.reference
    }

    pub fn assignment(&self) -> &HandAssignment {
        &self.assignment
    }

    /// last round started
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn squaring_rate(&self) -> Option<SquaringRate> {
        self.rate
    }

    /// this peer's private time-lock modulus
    pub fn puzzle_modulus(&self) -> Option<&PuzzleModulus> {
        self.puzzle.as_ref()
    }

    /// skip calibration with a known rate
    pub fn set_squaring_rate(&mut self, rate: SquaringRate) {
        self.rate = Some(rate);
    }

    pub fn register_peer(&mut self, peer: PeerId, key: VerifyingKey) {
        self.keyring.register_peer(peer, key);
    }

    /// escrow held for `peer` this round
    pub fn escrow(&self, peer: &PeerId) -> Option<&KeyEscrow> {
        self.escrows.get(peer)
    }

    fn others(&self) -> Vec<PeerId> {
        let local = self.local();
        self.assignment.turn_order().iter().filter(|p| **p != local).cloned().collect()
    }
}

// ============================================================================
// driver
// ============================================================================

/// what the local peer learned in one round
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundOutcome {
    pub round: u64,
    pub hand: [CardId; 2],
    pub board: Vec<CardId>,
    /// peers whose keys came from their escrow instead of a disclosure
    pub recovered_from: Vec<PeerId>,
}

#[derive(Debug)]
pub struct RoundDriver {
    session: Session,
    link: PeerLink,
    reveal: RevealRound,
    stash: VecDeque<(PeerId, Message)>,
}

impl RoundDriver {
    pub fn new(session: Session, link: PeerLink) -> Result<Self> {
        let local = session.local();
        if link.local() != &local {
            return Err(Error::Config(format!(
                "link belongs to {}, session to {}",
                link.local(),
                local
            )));
        }
        let reveal = RevealRound::new(local, session.assignment.clone())?;
        Ok(Self { session, link, reveal, stash: VecDeque::new() })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn phase(&self) -> &RoundPhase {
        self.reveal.phase()
    }

    // === transport helpers ===

    /// a closed link to `to` counts as that peer going silent
    async fn send(&self, to: &PeerId, message: Message) -> Result<()> {
        let envelope = Envelope::seal(self.session.keyring.identity(), message)?;
        self.link.send(to, envelope).await.map_err(|e| match e {
            Error::Transport(reason) => {
                debug!(peer = %to, %reason, "link closed");
                Error::PeerTimeout { peer: to.clone() }
            }
            other => other,
        })
    }

    async fn broadcast(&self, message: Message) -> Result<()> {
        for peer in self.session.others() {
            self.send(&peer, message.clone()).await?;
        }
        Ok(())
    }

    /// broadcast, logging peers that can no longer be reached
    async fn broadcast_lossy(&self, message: Message) {
        for peer in self.session.others() {
            if let Err(e) = self.send(&peer, message.clone()).await {
                warn!(peer = %peer, kind = message.kind(), error = %e, "broadcast failed");
            }
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.session.config.peer_timeout()
    }

    /// next verified message off the link; none once `deadline` passes
    ///
    /// unverifiable and stale messages are dropped here. an abort for the
    /// current round ends the wait with `RoundAborted`.
    async fn recv_verified(&mut self, deadline: Instant) -> Result<Option<(PeerId, Message)>> {
        loop {
            let envelope = match timeout_at(deadline, self.link.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(Error::Transport("inbox closed".into())),
                Ok(Some(envelope)) => envelope,
            };

            let (from, message) = match envelope.open(&self.session.keyring) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(error = %e, "dropping unverifiable message");
                    continue;
                }
            };

            match message.round() {
                Some(round) if round < self.session.round => {
                    debug!(from = %from, kind = message.kind(), round, "dropping stale message");
                    continue;
                }
                _ => {}
            }
            if let Message::Abort { round, reason } = &message {
                if *round == self.session.round {
                    return Err(Error::RoundAborted { peer: from, reason: reason.clone() });
                }
            }
            return Ok(Some((from, message)));
        }
    }

    /// wait for a message from `from` that satisfies `wanted`
    async fn expect<F>(&mut self, from: &PeerId, wanted: F) -> Result<Message>
    where
        F: Fn(&Message) -> bool,
    {
        if let Some(i) = self.stash.iter().position(|(peer, m)| peer == from && wanted(m)) {
            if let Some((_, message)) = self.stash.remove(i) {
                return Ok(message);
            }
        }

        let deadline = self.deadline();
        loop {
            match self.recv_verified(deadline).await? {
                None => return Err(Error::PeerTimeout { peer: from.clone() }),
                Some((peer, message)) if &peer == from && wanted(&message) => return Ok(message),
                Some(other) => self.stash.push_back(other),
            }
        }
    }

    // === session setup ===

    /// agree on the shared modulus, then derive the session keypair
    pub async fn establish_modulus(&mut self) -> Result<()> {
        let first = self.session.assignment.turn_order()[0].clone();

        let modulus = if first == self.session.local() {
            let bits = self.session.config.bit_length;
            let modulus = tokio::task::spawn_blocking(move || SharedModulus::generate(bits, &mut OsRng))
                .await
                .map_err(|e| Error::Worker(e.to_string()))??;
            self.broadcast(Message::Modulus { payload: wire::encode_modulus(&modulus) }).await?;
            modulus
        } else {
            match self.expect(&first, |m| matches!(m, Message::Modulus { .. })).await? {
                Message::Modulus { payload } => wire::decode_modulus(&payload)?,
                other => return Err(Error::OutOfSequence(format!("expected modulus, got {}", other.kind()))),
            }
        };

        let bits = modulus.bits();
        let prime_bits = (bits + 1) / 2;
        self.session.keyring.set_modulus(modulus);
        self.session.keyring.generate_global_keypair(&mut OsRng)?;

        let puzzle = tokio::task::spawn_blocking(move || PuzzleModulus::generate(prime_bits, &mut OsRng))
            .await
            .map_err(|e| Error::Worker(e.to_string()))??;
        if self.session.rate.is_none() {
            let rate = spawn_calibration(puzzle.n().clone(), self.session.config.calibration_squarings).await?;
            self.session.rate = Some(rate);
        }
        debug!(bits = puzzle.bits(), "puzzle modulus drawn");
        self.session.puzzle = Some(puzzle);
        info!(bits, "shared modulus established");
        Ok(())
    }

    // === round ===

    /// run one full round; on any failure the round is aborted and the error returned
    pub async fn run_round(&mut self) -> Result<RoundOutcome> {
        match self.play_round().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn play_round(&mut self) -> Result<RoundOutcome> {
        self.prepare_round().await?;
        self.deal().await?;
        self.reveal().await
    }

    /// fresh variations, escrow exchange, then enter the global pass
    pub async fn prepare_round(&mut self) -> Result<u64> {
        self.session.round += 1;
        let round = self.session.round;
        self.reveal = RevealRound::new(self.session.local(), self.session.assignment.clone())?;
        self.stash.retain(|(_, m)| m.round().map_or(false, |r| r >= round));

        let rate = self
            .session
            .rate
            .ok_or_else(|| Error::OutOfSequence("squaring rate not calibrated".into()))?;
        let puzzle = self
            .session
            .puzzle
            .as_ref()
            .ok_or_else(|| Error::OutOfSequence("no puzzle modulus".into()))?;
        self.session.keyring.generate_variations(DECK_SIZE, &mut OsRng)?;
        let delay = self.session.config.timelock_delay();
        let escrow = KeyEscrow::seal(&self.session.keyring.export_keys()?, delay, rate, puzzle);
        self.broadcast(Message::Escrow { round, payload: wire::encode_escrow(&escrow) }).await?;

        self.session.escrows.clear();
        for peer in self.session.others() {
            let message = self
                .expect(&peer, |m| matches!(m, Message::Escrow { round: r, .. } if *r == round))
                .await?;
            if let Message::Escrow { payload, .. } = message {
                let modulus = self.session.keyring.modulus()?;
                let escrow = wire::decode_escrow(&payload, modulus, rate.iterations_for(delay))?;
                self.session.escrows.insert(peer, escrow);
            }
        }

        self.reveal.begin()?;
        info!(round, "round prepared");
        Ok(round)
    }

    /// take part in both passes until the final deck is dealt
    pub async fn deal(&mut self) -> Result<()> {
        let round = self.session.round;
        let mut deck = if self.reveal.is_first() {
            Some(self.reveal.start_deck(&self.session.reference)?)
        } else {
            None
        };

        loop {
            if let Some(current) = deck.take() {
                let my_turn = match self.reveal.phase() {
                    RoundPhase::GlobalPass { turn } => Some((DeckStage::Global, *turn)),
                    RoundPhase::VariationPass { turn } => Some((DeckStage::Variation, *turn)),
                    _ => None,
                };
                let index = self.session.assignment.turn_index(self.reveal.local())?;

                match my_turn {
                    Some((DeckStage::Global, turn)) if turn == index => {
                        let out = self.reveal.global_pass(current, &self.session.keyring, &mut OsRng)?;
                        let to = self.reveal.successor().clone();
                        let message = Message::Deck { round, stage: DeckStage::Global, payload: out.serialize() };
                        self.send(&to, message).await?;
                    }
                    Some((DeckStage::Variation, turn)) if turn == index => {
                        let out = self.reveal.variation_pass(current, &self.session.keyring)?;
                        if self.reveal.phase() == &RoundPhase::HandAssigned {
                            let message = Message::Deck { round, stage: DeckStage::Final, payload: out.serialize() };
                            self.broadcast(message).await?;
                        } else {
                            let to = self.reveal.successor().clone();
                            let message = Message::Deck { round, stage: DeckStage::Variation, payload: out.serialize() };
                            self.send(&to, message).await?;
                        }
                    }
                    _ => {}
                }
            }

            if self.reveal.phase() == &RoundPhase::HandAssigned {
                break;
            }

            let sender = self.reveal.expected_deck_sender().clone();
            let message = self
                .expect(&sender, |m| matches!(m, Message::Deck { round: r, .. } if *r == round))
                .await?;
            if let Message::Deck { stage, payload, .. } = message {
                let modulus = self.session.keyring.modulus()?;
                deck = Some(self.reveal.accept_deck(stage, &sender, &payload, modulus)?);
            }
        }

        info!(round, "deck dealt");
        Ok(())
    }

    /// reveal the local hand and the board while serving everyone else's requests
    pub async fn reveal(&mut self) -> Result<RoundOutcome> {
        let round = self.session.round;
        let hand = self.reveal.request_hand()?;
        let board = self.session.assignment.board();
        self.broadcast_lossy(Message::KeyRequest { round, positions: hand.to_vec() }).await;
        self.broadcast_lossy(Message::KeyRequest { round, positions: board.to_vec() }).await;
        let wanted: Vec<usize> = hand.iter().chain(&board).copied().collect();

        // (peer, is board request) still owed an answer
        let mut unserved: BTreeSet<(PeerId, bool)> = self
            .session
            .others()
            .into_iter()
            .flat_map(|peer| [(peer.clone(), false), (peer, true)])
            .collect();
        let mut recovered_from = Vec::new();
        let mut backlog = std::mem::take(&mut self.stash);
        let mut deadline = self.deadline();

        loop {
            let missing = self.reveal.missing_keys(&wanted);
            if missing.is_empty() && unserved.is_empty() {
                break;
            }

            let next = match backlog.pop_front() {
                Some(item) => Some(item),
                None => self.recv_verified(deadline).await?,
            };

            match next {
                Some((from, Message::KeyRequest { round: r, positions })) if r == round => {
                    let keys = self.reveal.disclose(&from, &positions, &self.session.keyring)?;
                    let payload = wire::encode_values(&keys);
                    let is_board = positions == board;
                    self.send(&from, Message::KeyDisclosure { round, positions, payload }).await?;
                    unserved.remove(&(from, is_board));
                    deadline = self.deadline();
                }
                Some((from, Message::KeyDisclosure { round: r, positions, payload })) if r == round => {
                    let keys = wire::decode_values(&payload, positions.len())?;
                    self.reveal.accept_disclosure(&from, &positions, keys)?;
                    deadline = self.deadline();
                }
                Some(other) => self.stash.push_back(other),
                None => {
                    if missing.is_empty() {
                        let peer = match unserved.iter().next() {
                            Some((peer, _)) => peer.clone(),
                            None => self.session.local(),
                        };
                        return Err(Error::PeerTimeout { peer });
                    }
                    for peer in missing {
                        self.recover_from_escrow(&peer, &wanted).await?;
                        unserved.retain(|(p, _)| p != &peer);
                        recovered_from.push(peer);
                    }
                    deadline = self.deadline();
                }
            }
        }

        let keyring = &self.session.keyring;
        let reference = &self.session.reference;
        let hand = self.reveal.resolve_hand(keyring, reference)?;
        let board = self.reveal.resolve_board(keyring, reference)?;
        info!(round, hand = %format!("{} {}", hand[0], hand[1]), "hand revealed");

        Ok(RoundOutcome { round, hand, board, recovered_from })
    }

    /// open `peer`'s escrow on the blocking pool and take its keys for `positions`
    async fn recover_from_escrow(&mut self, peer: &PeerId, positions: &[usize]) -> Result<()> {
        if !self.session.config.escrow_fallback {
            return Err(Error::PeerTimeout { peer: peer.clone() });
        }
        let escrow = self
            .session
            .escrows
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::PeerTimeout { peer: peer.clone() })?;

        warn!(peer = %peer, "peer silent during reveal, opening its escrow");
        let recovered = escrow.spawn_open().await?;
        let modulus = self.session.keyring.modulus()?;
        self.reveal.accept_recovered(peer, positions, &recovered, modulus)
    }

    /// tell the table, then reset to `AwaitingSetup`
    pub async fn abort(&mut self, cause: &Error) {
        let round = self.session.round;
        if !matches!(cause, Error::RoundAborted { .. }) {
            self.broadcast_lossy(Message::Abort { round, reason: cause.to_string() }).await;
        }
        self.reveal.abort();
        self.session.keyring.clear_variations();
        self.session.escrows.clear();
        warn!(round, error = %cause, "round aborted");
    }
}

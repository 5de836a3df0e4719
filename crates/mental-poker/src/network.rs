//! message boundary between the round driver and the transport
//!
//! the core never opens sockets. a transport hands each peer a `PeerLink`:
//! one inbox plus an outbox per remote peer. `LocalNetwork` wires links
//! together in-process for tests and the demo table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::keyring::Keyring;
use crate::reveal::DeckStage;
use crate::signing::{PeerId, Signature, SigningIdentity};
use crate::{Error, Result};

/// per-link channel depth
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

// ============================================================================
// messages
// ============================================================================

/// every inter-peer message; payloads use the line formats in `wire`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// shared-modulus payload from the first peer in turn order
    Modulus { payload: String },
    /// sender's time-locked keys for the round
    Escrow { round: u64, payload: String },
    /// deck after the sender's pass
    Deck { round: u64, stage: DeckStage, payload: String },
    /// ask for variation keys of `positions`
    KeyRequest { round: u64, positions: Vec<usize> },
    /// disclosure payload answering a request, one key per position
    KeyDisclosure { round: u64, positions: Vec<usize>, payload: String },
    /// sender gave up on the round
    Abort { round: u64, reason: String },
}

impl Message {
    /// round the message belongs to; none for session-level messages
    pub fn round(&self) -> Option<u64> {
        match self {
            Message::Modulus { .. } => None,
            Message::Escrow { round, .. }
            | Message::Deck { round, .. }
            | Message::KeyRequest { round, .. }
            | Message::KeyDisclosure { round, .. }
            | Message::Abort { round, .. } => Some(*round),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Modulus { .. } => "modulus",
            Message::Escrow { .. } => "escrow",
            Message::Deck { .. } => "deck",
            Message::KeyRequest { .. } => "key-request",
            Message::KeyDisclosure { .. } => "key-disclosure",
            Message::Abort { .. } => "abort",
        }
    }
}

// ============================================================================
// envelopes
// ============================================================================

/// a message signed by its sender over `bincode((from, message))`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub message: Message,
    pub signature: Signature,
}

fn signed_bytes(from: &PeerId, message: &Message) -> Result<Vec<u8>> {
    bincode::serialize(&(from, message)).map_err(|e| Error::Transport(e.to_string()))
}

impl Envelope {
    pub fn seal(identity: &SigningIdentity, message: Message) -> Result<Self> {
        let from = identity.peer_id();
        let signature = identity.sign(&signed_bytes(&from, &message)?);
        Ok(Self { from, message, signature })
    }

    /// verify against the sender's registered key
    pub fn open(self, keyring: &Keyring) -> Result<(PeerId, Message)> {
        let bytes = signed_bytes(&self.from, &self.message)?;
        keyring.verify(&self.from, &bytes, &self.signature)?;
        Ok((self.from, self.message))
    }
}

// ============================================================================
// links
// ============================================================================

/// one peer's end of the transport
#[derive(Debug)]
pub struct PeerLink {
    local: PeerId,
    inbox: mpsc::Receiver<Envelope>,
    outboxes: HashMap<PeerId, mpsc::Sender<Envelope>>,
}

impl PeerLink {
    pub fn new(
        local: PeerId,
        inbox: mpsc::Receiver<Envelope>,
        outboxes: HashMap<PeerId, mpsc::Sender<Envelope>>,
    ) -> Self {
        Self { local, inbox, outboxes }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.outboxes.keys()
    }

    /// raw sender into `peer`'s inbox
    pub fn sender_to(&self, peer: &PeerId) -> Option<mpsc::Sender<Envelope>> {
        self.outboxes.get(peer).cloned()
    }

    pub async fn send(&self, to: &PeerId, envelope: Envelope) -> Result<()> {
        let outbox = self.outboxes.get(to).ok_or_else(|| Error::UnknownPeer(to.clone()))?;
        trace!(to = %to, kind = envelope.message.kind(), "send");
        outbox
            .send(envelope)
            .await
            .map_err(|_| Error::Transport(format!("link to {} closed", to)))
    }

    /// receive the next envelope; none once every sender is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }
}

/// fully connected in-process mesh
pub struct LocalNetwork;

impl LocalNetwork {
    /// one link per peer, in the order given
    pub fn mesh(peers: &[PeerId]) -> Vec<PeerLink> {
        Self::mesh_with_capacity(peers, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn mesh_with_capacity(peers: &[PeerId], capacity: usize) -> Vec<PeerLink> {
        let (senders, receivers): (Vec<_>, Vec<_>) = peers.iter().map(|_| mpsc::channel(capacity)).unzip();

        peers
            .iter()
            .zip(receivers)
            .map(|(local, inbox)| {
                let outboxes = peers
                    .iter()
                    .zip(&senders)
                    .filter(|(peer, _)| *peer != local)
                    .map(|(peer, tx)| (peer.clone(), tx.clone()))
                    .collect();
                PeerLink::new(local.clone(), inbox, outboxes)
            })
            .collect()
    }
}

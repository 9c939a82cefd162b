// btoken_node/src/p2p/peer.rs
// Per-connection state as seen by the network loop.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::p2p::messages::{NetMessage, VersionMessage};

pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Idle,
    /// A getheaders request is outstanding.
    AwaitingHeader,
    /// Block bodies have been requested.
    AwaitingBlockDownload,
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub address: SocketAddr,
    pub inbound: bool,
    pub version: VersionMessage,
    state: PeerState,
    sender: UnboundedSender<NetMessage>,
    deadline: Option<Instant>,
    /// Heights of the blocks charged to this peer.
    pub downloads: BTreeSet<u32>,
    dispose_reason: Option<String>,
    pub count_blocks_received: u64,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: String,
    pub inbound: bool,
    pub user_agent: String,
    pub start_height: i32,
    pub state: PeerState,
    pub downloads: usize,
    pub count_blocks_received: u64,
    pub connected_at: String,
}

impl Peer {
    pub fn new(
        id: PeerId,
        address: SocketAddr,
        inbound: bool,
        version: VersionMessage,
        sender: UnboundedSender<NetMessage>,
    ) -> Self {
        Peer {
            id,
            address,
            inbound,
            version,
            state: PeerState::Idle,
            sender,
            deadline: None,
            downloads: BTreeSet::new(),
            dispose_reason: None,
            count_blocks_received: 0,
            connected_at: chrono::Utc::now(),
        }
    }

    /// Queues `message` for the writer task. A closed channel marks the peer
    /// for disposal.
    pub fn send(&mut self, message: NetMessage) -> bool {
        if self.sender.send(message).is_err() {
            self.dispose("connection closed");
            return false;
        }
        true
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == PeerState::Idle && !self.is_disposed()
    }

    /// Enters `state` with a response due within `timeout`.
    pub fn await_response(&mut self, state: PeerState, timeout: Duration) {
        self.state = state;
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn set_idle(&mut self) {
        self.state = PeerState::Idle;
        self.deadline = None;
        self.downloads.clear();
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Marks the peer for removal on the next maintenance pass.
    pub fn dispose(&mut self, reason: &str) {
        if self.dispose_reason.is_none() {
            warn!("Peer {} marked for disposal: {}", self.address, reason);
            self.dispose_reason = Some(reason.to_string());
        } else {
            debug!("Peer {} already disposed, also: {}", self.address, reason);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose_reason.is_some()
    }

    pub fn dispose_reason(&self) -> Option<&str> {
        self.dispose_reason.as_deref()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            address: self.address.to_string(),
            inbound: self.inbound,
            user_agent: self.version.user_agent.clone(),
            start_height: self.version.start_height,
            state: self.state,
            downloads: self.downloads.len(),
            count_blocks_received: self.count_blocks_received,
            connected_at: self.connected_at.to_rfc3339(),
        }
    }
}

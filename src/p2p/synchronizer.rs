// btoken_node/src/p2p/synchronizer.rs
// Pulls one chain up to the best chain its peers offer. Headers come from a
// single peer, block bodies from every idle peer, and blocks are committed in
// ascending height order through a ReorderBuffer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::seq::IteratorRandom;
use serde::Serialize;

use crate::blockchain::block::Block;
use crate::blockchain::chain::{run_blocking, try_lock, Blockchain, ChainGuard, ChainHandle};
use crate::blockchain::header::Header;
use crate::blockchain::reassembly::ReorderBuffer;
use crate::config::NetworkConfig;
use crate::error::ChainError;
use crate::p2p::header_download::HeaderDownload;
use crate::p2p::messages::{GetHeadersMessage, InventoryType, InventoryVector, NetMessage, MAX_HEADERS_PER_MSG};
use crate::p2p::peer::{Peer, PeerId, PeerState};
use crate::util::{hash_to_display, Hash, HASH_ZERO};

pub type Peers = HashMap<PeerId, Peer>;

pub const MAX_HEADERS_PER_SESSION: usize = 20 * MAX_HEADERS_PER_MSG; // Headers held before blocks are fetched
const MAX_PEERS_PER_DOWNLOAD: usize = 2; // Speculative duplicates stop here

/// What became of a block handed to the synchronizer.
#[derive(Debug)]
pub enum BlockReceipt {
    /// Part of the running download (inserted, buffered or a late duplicate).
    Consumed,
    /// Not requested by a download; the network decides what to do with it.
    Unsolicited(Block),
    /// Its parent-chain anchor has not been seen yet. The download ended at
    /// the block before it.
    Deferred(Block),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub syncing: bool,
    pub phase: Option<&'static str>,
    pub peer_sync: Option<PeerId>,
    pub height_stop: Option<u32>,
    pub queued: usize,
    pub in_flight: usize,
    pub buffered: usize,
    pub count_sessions: u64,
    pub count_aborted: u64,
}

struct BlockDownload {
    hashes: BTreeMap<u32, Hash>,
    heights: HashMap<Hash, u32>,
    height_stop: u32,
    queued: BTreeSet<u32>,
    /// Requested heights and the peers charged with them.
    in_flight: BTreeMap<u32, Vec<PeerId>>,
    buffer: ReorderBuffer<(Block, PeerId)>,
    /// Peers that answered notfound during this download.
    exhausted: HashSet<PeerId>,
}

impl BlockDownload {
    fn new(headers: &[Header], height_ancestor: u32) -> Self {
        let hashes: BTreeMap<u32, Hash> = headers.iter().map(|h| (h.height, h.hash)).collect();
        BlockDownload {
            heights: headers.iter().map(|h| (h.hash, h.height)).collect(),
            height_stop: headers.last().map_or(height_ancestor, |h| h.height),
            queued: hashes.keys().copied().collect(),
            hashes,
            in_flight: BTreeMap::new(),
            buffer: ReorderBuffer::new(height_ancestor as u64 + 1),
            exhausted: HashSet::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.buffer.cursor() > self.height_stop as u64
    }

    fn pending(&self) -> usize {
        self.buffer.len() + self.in_flight.len()
    }

    fn is_settled(&self, height: u32) -> bool {
        (height as u64) < self.buffer.cursor() || self.buffer.contains(height as u64)
    }

    /// Drops `peer_id`'s charge on `heights`. Heights nobody else carries go
    /// back to the queue.
    fn release(&mut self, peer_id: PeerId, heights: &BTreeSet<u32>) {
        for &height in heights {
            let Some(charged) = self.in_flight.get_mut(&height) else { continue };
            charged.retain(|id| *id != peer_id);
            if charged.is_empty() {
                self.in_flight.remove(&height);
                if !self.is_settled(height) {
                    self.queued.insert(height);
                }
            }
        }
    }

    /// Hands work to every idle peer: fresh heights while the capacity allows,
    /// otherwise a duplicate request for the oldest height still in flight.
    fn dispatch(&mut self, peers: &mut Peers, config: &NetworkConfig) {
        let capacity = config.download_capacity.max(1);
        let per_request = config.blocks_per_request.max(1);
        let mut idle: Vec<PeerId> = peers
            .values()
            .filter(|peer| peer.is_idle() && !self.exhausted.contains(&peer.id))
            .map(|peer| peer.id)
            .collect();
        idle.sort_unstable();

        for peer_id in idle {
            let mut heights = Vec::new();
            while heights.len() < per_request && self.pending() < capacity {
                let Some(height) = self.queued.pop_first() else { break };
                self.in_flight.entry(height).or_default().push(peer_id);
                heights.push(height);
            }
            if heights.is_empty() {
                if let Some((&height, charged)) = self.in_flight.iter_mut().next() {
                    if charged.len() < MAX_PEERS_PER_DOWNLOAD && !charged.contains(&peer_id) {
                        debug!("Requesting block at height {} again from peer {}", height, peer_id);
                        charged.push(peer_id);
                        heights.push(height);
                    }
                }
            }
            if heights.is_empty() {
                continue;
            }

            let inventory: Vec<InventoryVector> =
                heights.iter().filter_map(|h| self.hashes.get(h)).map(|hash| InventoryVector::block(*hash)).collect();
            let Some(peer) = peers.get_mut(&peer_id) else { continue };
            if peer.send(NetMessage::GetData(inventory)) {
                peer.downloads.extend(heights.iter().copied());
                peer.await_response(PeerState::AwaitingBlockDownload, config.request_timeout());
            } else {
                let heights: BTreeSet<u32> = heights.into_iter().collect();
                self.release(peer_id, &heights);
            }
        }
    }
}

enum Phase {
    Headers(HeaderDownload),
    Blocks(BlockDownload),
}

struct Session {
    guard: ChainGuard,
    peer_sync: PeerId,
    phase: Phase,
}

pub struct Synchronizer {
    chain: ChainHandle,
    config: NetworkConfig,
    session: Option<Session>,
    last_attempt: Option<Instant>,
    /// Set when a session stopped at the header cap and more is on offer.
    resume: bool,
    count_sessions: u64,
    count_aborted: u64,
}

impl Synchronizer {
    pub fn new(chain: ChainHandle, config: NetworkConfig) -> Self {
        Synchronizer {
            chain,
            config,
            session: None,
            last_attempt: None,
            resume: false,
            count_sessions: 0,
            count_aborted: 0,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.session.is_some()
    }

    /// Runs `f` on the chain: through the session's guard while syncing,
    /// otherwise if the chain lock is free. None while someone else holds it.
    pub fn read_chain<R>(&self, f: impl FnOnce(&Blockchain) -> R) -> Option<R> {
        match &self.session {
            Some(session) => Some(f(&session.guard)),
            None => try_lock(&self.chain).map(|guard| f(&guard)),
        }
    }

    /// The chain lock for mutation outside a sync. None while syncing or
    /// while another task holds it.
    pub fn lock_idle(&self) -> Option<ChainGuard> {
        if self.session.is_some() {
            return None;
        }
        try_lock(&self.chain)
    }

    /// Starts a header exchange with `peer_id`. Backs off when a session is
    /// already running or the chain lock is taken.
    pub fn start(&mut self, peers: &mut Peers, peer_id: PeerId) -> bool {
        if self.session.is_some() {
            return false;
        }
        self.last_attempt = Some(Instant::now());
        let Some(peer) = peers.get_mut(&peer_id).filter(|peer| peer.is_idle()) else { return false };
        let Some(guard) = try_lock(&self.chain) else {
            debug!("Chain busy, sync with peer {} postponed", peer_id);
            return false;
        };

        let locator = guard.get_locator();
        let request = GetHeadersMessage {
            version: guard.params().protocol_version,
            locator: locator.clone(),
            hash_stop: HASH_ZERO,
        };
        if !peer.send(NetMessage::GetHeaders(request)) {
            return false;
        }
        peer.await_response(PeerState::AwaitingHeader, self.config.request_timeout());
        info!(
            "{} sync with peer {} ({}) from height {}",
            guard.name(),
            peer_id,
            peer.address,
            guard.height()
        );
        self.resume = false;
        self.count_sessions += 1;
        self.session = Some(Session { guard, peer_sync: peer_id, phase: Phase::Headers(HeaderDownload::new(locator)) });
        true
    }

    /// Feeds a headers message. Headers outside a running exchange with
    /// `peer_id` start one if they announce something unknown.
    pub fn on_headers(&mut self, peers: &mut Peers, peer_id: PeerId, headers: Vec<Header>) {
        let Some(session) = self.session.as_mut().filter(|s| s.peer_sync == peer_id) else {
            self.on_announced(peers, peer_id, headers.iter().map(|h| h.hash));
            return;
        };
        let Phase::Headers(download) = &mut session.phase else {
            debug!("Ignoring headers from peer {} during block download", peer_id);
            return;
        };

        let count = headers.len();
        for header in headers {
            let guard = &session.guard;
            let result = download.insert_header(
                header,
                |hash| guard.header(hash),
                |header, height| guard.check_header(header, height),
            );
            if let Err(e) = result {
                warn!("{} rejected headers from peer {}: {}", guard.name(), peer_id, e);
                if let Some(peer) = peers.get_mut(&peer_id) {
                    peer.dispose(&format!("invalid headers: {}", e));
                }
                self.abort(peers);
                return;
            }
        }

        if count == MAX_HEADERS_PER_MSG && download.len() < MAX_HEADERS_PER_SESSION {
            let request = GetHeadersMessage {
                version: session.guard.params().protocol_version,
                locator: download.locator_continuation(),
                hash_stop: HASH_ZERO,
            };
            if let Some(peer) = peers.get_mut(&peer_id) {
                if peer.send(NetMessage::GetHeaders(request)) {
                    peer.await_response(PeerState::AwaitingHeader, self.config.request_timeout());
                    return;
                }
            }
            self.abort(peers);
            return;
        }
        if count == MAX_HEADERS_PER_MSG {
            self.resume = true;
        }
        self.conclude_headers(peers);
    }

    /// An inv or unsolicited headers naming blocks we lack triggers a sync.
    pub fn on_announced<I>(&mut self, peers: &mut Peers, peer_id: PeerId, hashes: I)
    where
        I: IntoIterator<Item = Hash>,
    {
        if self.session.is_some() {
            return;
        }
        let unknown = match self.read_chain(|chain| hashes.into_iter().any(|hash| !chain.contains(&hash))) {
            Some(unknown) => unknown,
            None => return,
        };
        if unknown {
            self.start(peers, peer_id);
        }
    }

    // Header exchange is over: choose between extending the tip, opening a
    // fork, or doing nothing.
    fn conclude_headers(&mut self, peers: &mut Peers) {
        let Some(Session { mut guard, peer_sync, phase: Phase::Headers(download) }) = self.session.take() else {
            return;
        };
        if let Some(peer) = peers.get_mut(&peer_sync) {
            peer.set_idle();
        }

        let (Some(ancestor), Some(tip_offered)) = (download.header_ancestor.clone(), download.header_tip().cloned())
        else {
            debug!("{} peer {} has nothing new", guard.name(), peer_sync);
            return;
        };
        let tip = guard.tip();
        if ancestor.hash != tip.hash {
            if tip_offered.difficulty_accumulated <= tip.difficulty_accumulated {
                info!(
                    "{} peer {} offers a branch from height {} that does not outweigh ours ({} <= {})",
                    guard.name(),
                    peer_sync,
                    ancestor.height,
                    tip_offered.difficulty_accumulated,
                    tip.difficulty_accumulated
                );
                self.resume = false;
                return;
            }
            match run_blocking(|| guard.try_fork(&ancestor.hash)) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    error!("{} could not open fork at height {}: {}", guard.name(), ancestor.height, e);
                    self.count_aborted += 1;
                    if let Err(e) = run_blocking(|| guard.reload()) {
                        error!("{} reload after failed fork failed: {}", guard.name(), e);
                    }
                    return;
                }
            }
        }

        info!(
            "{} downloading blocks {}..{} from peers (tip offered {})",
            guard.name(),
            ancestor.height + 1,
            tip_offered.height,
            hash_to_display(&tip_offered.hash)
        );
        let mut blocks = BlockDownload::new(download.headers(), ancestor.height);
        blocks.dispatch(peers, &self.config);
        self.session = Some(Session { guard, peer_sync, phase: Phase::Blocks(blocks) });
    }

    /// Feeds a block. Blocks of the running download are committed once
    /// every lower height is in.
    pub fn on_block(&mut self, peers: &mut Peers, peer_id: PeerId, block: Block) -> BlockReceipt {
        let hash = block.hash();
        let Some(Session { phase: Phase::Blocks(download), .. }) = self.session.as_mut() else {
            return BlockReceipt::Unsolicited(block);
        };
        let Some(&height) = download.heights.get(&hash) else {
            return BlockReceipt::Unsolicited(block);
        };

        let mut charged = download.in_flight.remove(&height).unwrap_or_default();
        if !charged.contains(&peer_id) {
            charged.push(peer_id);
        }
        if let Some(peer) = peers.get_mut(&peer_id) {
            peer.count_blocks_received += 1;
        }
        for id in charged {
            let Some(peer) = peers.get_mut(&id) else { continue };
            peer.downloads.remove(&height);
            if peer.downloads.is_empty() {
                peer.set_idle();
            } else if id == peer_id {
                peer.await_response(PeerState::AwaitingBlockDownload, self.config.request_timeout());
            }
        }
        if download.is_settled(height) {
            debug!("Duplicate block at height {} from peer {}", height, peer_id);
            download.dispatch(peers, &self.config);
            return BlockReceipt::Consumed;
        }
        download.queued.remove(&height);
        download.buffer.insert(height as u64, (block, peer_id));

        match self.commit_ready(peers) {
            Ok(()) => {}
            Err(receipt) => return receipt,
        }

        let Some(Session { phase: Phase::Blocks(download), .. }) = self.session.as_mut() else {
            return BlockReceipt::Consumed;
        };
        if download.is_complete() {
            self.finish(peers);
        } else {
            download.dispatch(peers, &self.config);
        }
        BlockReceipt::Consumed
    }

    // Inserts buffered blocks while the next height is present.
    fn commit_ready(&mut self, peers: &mut Peers) -> Result<(), BlockReceipt> {
        let Some(session) = self.session.as_mut() else { return Ok(()) };
        let Phase::Blocks(download) = &mut session.phase else { return Ok(()) };
        while let Some((height, (block, sender))) = download.buffer.pop_ready() {
            let hash = block.hash();
            match run_blocking(|| session.guard.insert_block(block.clone())) {
                Ok(_) => {
                    debug!("{} committed block {} at height {}", session.guard.name(), hex::encode(&hash[..8]), height);
                }
                Err(ChainError::NotSynchronizedWithParent(_)) => {
                    info!(
                        "{} block {} at height {} awaits its parent-chain anchor",
                        session.guard.name(),
                        hex::encode(&hash[..8]),
                        height
                    );
                    self.finish(peers);
                    return Err(BlockReceipt::Deferred(block));
                }
                Err(e) => {
                    error!(
                        "{} sync aborted: block {} at height {} from peer {} failed: {}",
                        session.guard.name(),
                        hex::encode(&hash[..8]),
                        height,
                        sender,
                        e
                    );
                    if e.is_protocol() {
                        if let Some(peer) = peers.get_mut(&sender) {
                            peer.dispose(&format!("invalid block: {}", e));
                        }
                    }
                    self.abort(peers);
                    return Err(BlockReceipt::Consumed);
                }
            }
        }
        Ok(())
    }

    /// A peer could not serve some of the blocks it was charged with.
    pub fn on_notfound(&mut self, peers: &mut Peers, peer_id: PeerId, items: &[InventoryVector]) {
        let Some(Session { phase: Phase::Blocks(download), .. }) = self.session.as_mut() else { return };
        let Some(peer) = peers.get_mut(&peer_id) else { return };
        let missing: BTreeSet<u32> = items
            .iter()
            .filter(|item| item.inv_type == InventoryType::Block)
            .filter_map(|item| download.heights.get(&item.hash).copied())
            .filter(|height| peer.downloads.contains(height))
            .collect();
        if missing.is_empty() {
            return;
        }
        debug!("Peer {} lacks {} requested blocks", peer_id, missing.len());
        for height in &missing {
            peer.downloads.remove(height);
        }
        if peer.downloads.is_empty() {
            peer.set_idle();
        }
        download.exhausted.insert(peer_id);
        download.release(peer_id, &missing);
        download.dispatch(peers, &self.config);
    }

    /// Releases whatever `peer_id` was doing for the session. Called before
    /// the peer leaves the peer list.
    pub fn on_peer_removed(&mut self, peers: &mut Peers, peer_id: PeerId) {
        let Some(session) = self.session.as_mut() else { return };
        match &mut session.phase {
            Phase::Headers(_) => {
                if session.peer_sync == peer_id {
                    warn!("{} sync peer {} went away during header exchange", session.guard.name(), peer_id);
                    self.abort(peers);
                }
            }
            Phase::Blocks(download) => {
                if let Some(peer) = peers.get_mut(&peer_id) {
                    let heights = std::mem::take(&mut peer.downloads);
                    download.release(peer_id, &heights);
                    peer.set_idle();
                }
                download.exhausted.insert(peer_id);
                download.dispatch(peers, &self.config);
            }
        }
    }

    /// Periodic pass: expires overdue requests, keeps the download moving and
    /// starts a new sync when one is due.
    pub fn tick(&mut self, peers: &mut Peers, now: Instant) {
        let overdue: Vec<PeerId> = peers
            .values()
            .filter(|peer| !peer.is_disposed() && peer.is_timed_out(now))
            .map(|peer| peer.id)
            .collect();
        for peer_id in overdue {
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.dispose(&format!("no response while {:?}", peer.state()));
            }
            self.on_peer_removed(peers, peer_id);
        }

        if let Some(Session { phase: Phase::Blocks(download), guard, .. }) = self.session.as_mut() {
            if peers.values().all(|peer| peer.is_disposed() || download.exhausted.contains(&peer.id)) {
                warn!("{} no peer left to download blocks from", guard.name());
                self.abort(peers);
            } else {
                download.dispatch(peers, &self.config);
            }
            return;
        }
        if self.session.is_some() {
            return;
        }

        let interval = Duration::from_secs(self.config.sync_interval_secs);
        let due = self.resume || self.last_attempt.map_or(true, |last| now.saturating_duration_since(last) >= interval);
        if !due {
            return;
        }
        let candidate = peers.values().filter(|peer| peer.is_idle()).map(|peer| peer.id).choose(&mut rand::thread_rng());
        match candidate {
            Some(peer_id) => {
                self.start(peers, peer_id);
            }
            None => self.last_attempt = Some(now),
        }
    }

    // Session ended normally: commit or drop a fork, free the peers, release the lock.
    fn finish(&mut self, peers: &mut Peers) {
        let Some(mut session) = self.session.take() else { return };
        reset_peers(peers);
        if session.guard.is_fork() {
            match run_blocking(|| session.guard.finalize_blockchain()) {
                Ok(true) => info!("{} reorganized onto the downloaded branch", session.guard.name()),
                Ok(false) => info!("{} kept its main chain", session.guard.name()),
                Err(e) => {
                    error!("{} fork finalization failed: {}", session.guard.name(), e);
                    if let Err(e) = run_blocking(|| session.guard.reload()) {
                        error!("{} reload failed: {}", session.guard.name(), e);
                    }
                }
            }
        }
        info!(
            "{} sync finished at height {} ({})",
            session.guard.name(),
            session.guard.height(),
            hash_to_display(&session.guard.tip().hash)
        );
    }

    /// Drops the session. Once blocks were committed the chain is reloaded
    /// from its last image so no partial state survives.
    pub fn abort(&mut self, peers: &mut Peers) {
        let Some(mut session) = self.session.take() else { return };
        self.count_aborted += 1;
        self.resume = false;
        reset_peers(peers);
        let mutated = matches!(session.phase, Phase::Blocks(_)) || session.guard.is_fork();
        if mutated {
            if let Err(e) = run_blocking(|| session.guard.reload()) {
                error!("{} reload after aborted sync failed: {}", session.guard.name(), e);
            }
        }
        warn!("{} sync aborted at height {}", session.guard.name(), session.guard.height());
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = SyncStatus {
            syncing: self.session.is_some(),
            phase: None,
            peer_sync: self.session.as_ref().map(|s| s.peer_sync),
            height_stop: None,
            queued: 0,
            in_flight: 0,
            buffered: 0,
            count_sessions: self.count_sessions,
            count_aborted: self.count_aborted,
        };
        match self.session.as_ref().map(|s| &s.phase) {
            Some(Phase::Headers(_)) => status.phase = Some("headers"),
            Some(Phase::Blocks(download)) => {
                status.phase = Some("blocks");
                status.height_stop = Some(download.height_stop);
                status.queued = download.queued.len();
                status.in_flight = download.in_flight.len();
                status.buffered = download.buffer.len();
            }
            None => {}
        }
        status
    }
}

fn reset_peers(peers: &mut Peers) {
    for peer in peers.values_mut() {
        if peer.state() != PeerState::Idle {
            peer.set_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::ChainParams;
    use crate::config::ArchiveConfig;
    use crate::p2p::peer::tests::peer;
    use crate::token::testing::{block_on, Journal, TestToken};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        _dir: tempfile::TempDir,
        handle: ChainHandle,
        journal: Arc<Mutex<Journal>>,
        params: ChainParams,
    }

    fn fixture(poison_nonce: Option<u32>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::btoken();
        let mut token = TestToken::new(params.clone());
        token.poison_nonce = poison_nonce;
        let journal = Arc::clone(&token.journal);
        let config = ArchiveConfig { segment_size: 1 << 20, image_interval_segments: 100, loader_workers: 2, io_retry_secs: 0 };
        let mut chain = Blockchain::new(Box::new(token), dir.path(), &config).unwrap();
        chain.load().unwrap();
        Fixture { _dir: dir, handle: Arc::new(tokio::sync::Mutex::new(chain)), journal, params }
    }

    fn config() -> NetworkConfig {
        NetworkConfig { download_capacity: 20, blocks_per_request: 4, request_timeout_secs: 60, ..NetworkConfig::default() }
    }

    fn blocks_from(params: &ChainParams, tip: &Header, count: u32, nonce_base: u32) -> Vec<Block> {
        let mut tip = tip.clone();
        (0..count)
            .map(|i| {
                let block = block_on(params, &tip, nonce_base + i);
                tip = block.header.clone();
                block
            })
            .collect()
    }

    fn add_peer(peers: &mut Peers, id: PeerId) -> UnboundedReceiver<NetMessage> {
        let (peer, outgoing) = peer(id);
        peers.insert(id, peer);
        outgoing
    }

    fn requested(outgoing: &mut UnboundedReceiver<NetMessage>) -> Vec<Hash> {
        let mut hashes = Vec::new();
        while let Ok(message) = outgoing.try_recv() {
            if let NetMessage::GetData(items) = message {
                hashes.extend(items.iter().map(|item| item.hash));
            }
        }
        hashes
    }

    async fn genesis(fixture: &Fixture) -> Header {
        fixture.handle.lock().await.tip()
    }

    #[tokio::test]
    async fn blocks_from_two_peers_commit_in_height_order() {
        let fixture = fixture(None);
        let blocks = blocks_from(&fixture.params, &genesis(&fixture).await, 6, 1);
        let mut peers = Peers::new();
        let mut out1 = add_peer(&mut peers, 1);
        let mut out2 = add_peer(&mut peers, 2);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());

        assert!(sync.start(&mut peers, 1));
        assert!(matches!(out1.try_recv().unwrap(), NetMessage::GetHeaders(_)));
        assert_eq!(peers[&1].state(), PeerState::AwaitingHeader);
        assert!(try_lock(&fixture.handle).is_none());

        sync.on_headers(&mut peers, 1, blocks.iter().map(|b| b.header.clone()).collect());
        assert_eq!(sync.status().phase, Some("blocks"));
        let hashes: Vec<Hash> = blocks.iter().map(|b| b.hash()).collect();
        assert_eq!(requested(&mut out1), hashes[..4].to_vec());
        assert_eq!(requested(&mut out2), hashes[4..].to_vec());

        for block in blocks[4..].iter().rev() {
            assert!(matches!(sync.on_block(&mut peers, 2, block.clone()), BlockReceipt::Consumed));
        }
        assert_eq!(sync.read_chain(|chain| chain.height()), Some(0));
        // Peer 2 ran dry and now duplicates the oldest outstanding request.
        assert_eq!(requested(&mut out2), vec![hashes[0]]);

        for block in &blocks[..4] {
            sync.on_block(&mut peers, 1, block.clone());
        }
        assert!(!sync.is_syncing());
        let chain = try_lock(&fixture.handle).unwrap();
        assert_eq!(chain.height(), 6);
        assert_eq!(fixture.journal.lock().unwrap().inserted, hashes);
        assert!(peers.values().all(|peer| peer.is_idle()));
    }

    #[tokio::test]
    async fn timed_out_peer_work_moves_to_another_peer() {
        let fixture = fixture(None);
        let blocks = blocks_from(&fixture.params, &genesis(&fixture).await, 6, 1);
        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let _out2 = add_peer(&mut peers, 2);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        assert!(sync.start(&mut peers, 1));
        sync.on_headers(&mut peers, 1, blocks.iter().map(|b| b.header.clone()).collect());
        for block in &blocks[4..] {
            sync.on_block(&mut peers, 2, block.clone());
        }

        peers.get_mut(&1).unwrap().await_response(PeerState::AwaitingBlockDownload, Duration::ZERO);
        let mut out3 = add_peer(&mut peers, 3);
        sync.tick(&mut peers, Instant::now());
        assert!(peers[&1].is_disposed());
        // Height 1 stays with peer 2, which already duplicated it.
        let hashes: Vec<Hash> = blocks[1..4].iter().map(|b| b.hash()).collect();
        assert_eq!(requested(&mut out3), hashes);

        for block in &blocks[..4] {
            sync.on_block(&mut peers, 3, block.clone());
        }
        assert!(!sync.is_syncing());
        assert_eq!(try_lock(&fixture.handle).unwrap().height(), 6);
    }

    #[tokio::test]
    async fn late_duplicate_from_second_peer_is_harmless() {
        let fixture = fixture(None);
        let blocks = blocks_from(&fixture.params, &genesis(&fixture).await, 2, 1);
        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        assert!(sync.start(&mut peers, 1));
        sync.on_headers(&mut peers, 1, blocks.iter().map(|b| b.header.clone()).collect());

        // Everything is charged to peer 1, so a newcomer duplicates the oldest height.
        let mut out2 = add_peer(&mut peers, 2);
        sync.tick(&mut peers, Instant::now());
        assert_eq!(requested(&mut out2), vec![blocks[0].hash()]);

        sync.on_block(&mut peers, 2, blocks[0].clone());
        assert!(matches!(sync.on_block(&mut peers, 1, blocks[0].clone()), BlockReceipt::Consumed));
        sync.on_block(&mut peers, 1, blocks[1].clone());
        assert!(!sync.is_syncing());
        assert_eq!(fixture.journal.lock().unwrap().inserted.len(), 2);
    }

    #[tokio::test]
    async fn invalid_block_aborts_and_reloads() {
        let fixture = fixture(Some(3));
        let blocks = blocks_from(&fixture.params, &genesis(&fixture).await, 4, 2);
        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        assert!(sync.start(&mut peers, 1));
        sync.on_headers(&mut peers, 1, blocks.iter().map(|b| b.header.clone()).collect());

        sync.on_block(&mut peers, 1, blocks[0].clone());
        sync.on_block(&mut peers, 1, blocks[1].clone());
        assert!(!sync.is_syncing());
        assert!(peers[&1].is_disposed());
        assert_eq!(sync.status().count_aborted, 1);
        let chain = try_lock(&fixture.handle).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().hash, blocks[0].hash());
    }

    #[tokio::test]
    async fn heavier_branch_reorganizes_the_chain() {
        let fixture = fixture(None);
        let main = blocks_from(&fixture.params, &genesis(&fixture).await, 3, 10);
        {
            let mut chain = fixture.handle.lock().await;
            for block in &main {
                chain.insert_block(block.clone()).unwrap();
            }
        }
        let fork = blocks_from(&fixture.params, &main[0].header, 4, 500);

        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        assert!(sync.start(&mut peers, 1));
        sync.on_headers(&mut peers, 1, fork.iter().map(|b| b.header.clone()).collect());
        assert_eq!(sync.status().phase, Some("blocks"));
        assert_eq!(sync.read_chain(|chain| chain.is_fork()), Some(true));
        for block in &fork {
            sync.on_block(&mut peers, 1, block.clone());
        }

        assert!(!sync.is_syncing());
        let chain = try_lock(&fixture.handle).unwrap();
        assert!(!chain.is_fork());
        assert_eq!(chain.height(), 5);
        assert_eq!(chain.tip().hash, fork[3].hash());
        assert!(!chain.contains(&main[2].hash()));
    }

    #[tokio::test]
    async fn lighter_branch_is_ignored() {
        let fixture = fixture(None);
        let main = blocks_from(&fixture.params, &genesis(&fixture).await, 3, 10);
        {
            let mut chain = fixture.handle.lock().await;
            for block in &main {
                chain.insert_block(block.clone()).unwrap();
            }
        }
        let fork = blocks_from(&fixture.params, &main[0].header, 2, 500);

        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        assert!(sync.start(&mut peers, 1));
        sync.on_headers(&mut peers, 1, fork.iter().map(|b| b.header.clone()).collect());
        assert!(!sync.is_syncing());
        assert!(peers[&1].is_idle());
        let chain = try_lock(&fixture.handle).unwrap();
        assert_eq!(chain.tip().hash, main[2].hash());
    }

    #[tokio::test]
    async fn out_of_order_headers_dispose_the_sync_peer() {
        let fixture = fixture(None);
        let blocks = blocks_from(&fixture.params, &genesis(&fixture).await, 3, 1);
        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        assert!(sync.start(&mut peers, 1));
        sync.on_headers(&mut peers, 1, vec![blocks[0].header.clone(), blocks[2].header.clone()]);
        assert!(!sync.is_syncing());
        assert!(peers[&1].is_disposed());
        assert!(try_lock(&fixture.handle).is_some());
    }

    #[tokio::test]
    async fn busy_chain_postpones_sync() {
        let fixture = fixture(None);
        let mut peers = Peers::new();
        let _out1 = add_peer(&mut peers, 1);
        let mut sync = Synchronizer::new(Arc::clone(&fixture.handle), config());
        let guard = try_lock(&fixture.handle).unwrap();
        assert!(!sync.start(&mut peers, 1));
        assert!(peers[&1].is_idle());
        drop(guard);
        assert!(sync.start(&mut peers, 1));
    }
}

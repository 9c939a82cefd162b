// btoken_node/src/p2p/network.rs
// One chain's peer-to-peer front: connection tasks, the peer list, the
// synchronizer, serving peers, relay and the deferred anchor-chain blocks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::anchor::AnchorState;
use crate::blockchain::block::Block;
use crate::blockchain::chain::{run_blocking, ChainHandle};
use crate::blockchain::deferred::DeferredBlocks;
use crate::blockchain::header::HEADER_SIZE;
use crate::blockchain::header_index::HeaderIndex;
use crate::blockchain::transaction::Transaction;
use crate::chainparams::ChainParams;
use crate::config::NetworkConfig;
use crate::error::ChainError;
use crate::p2p::connection::{perform_handshake, read_message, send_message, HANDSHAKE_TIMEOUT};
use crate::p2p::messages::{
    command_str, GetHeadersMessage, InventoryType, InventoryVector, NetMessage, MAX_HEADERS_PER_MSG,
};
use crate::p2p::peer::{Peer, PeerId, PeerInfo};
use crate::p2p::synchronizer::{BlockReceipt, Peers, SyncStatus, Synchronizer};
use crate::util::{sha256d, Hash};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
const PING_INTERVAL_SECONDS: u64 = 45; // Keep-alive for idle connections
const CONNECT_TIMEOUT_SECONDS: u64 = 10;
const SEED_RETRY_SECONDS: u64 = 60; // Pause before dialing the same seed again

/// Requests other tasks hand to a running network.
#[derive(Debug)]
pub enum NetworkCommand {
    /// A block produced or released locally, to be inserted and relayed.
    InsertBlock(Block),
    /// Announce a transaction we can serve on request.
    AnnounceTransaction(Transaction),
    /// The parent chain settled an anchor; deferred blocks may be ready.
    RetryDeferred,
}

#[derive(Debug)]
enum NetEvent {
    Connected { peer: Peer, seed: Option<String> },
    ConnectFailed { seed: String, reason: String },
    Message { peer_id: PeerId, message: NetMessage },
    Disconnected { peer_id: PeerId, reason: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStatus {
    pub name: String,
    pub count_peers: usize,
    pub count_deferred: usize,
    pub sync: Option<SyncStatus>,
}

/// Cloneable view on a running network for the API and the anchor loop.
#[derive(Clone)]
pub struct NetworkHandle {
    pub name: &'static str,
    peers: Arc<Mutex<Peers>>,
    status: Arc<RwLock<NetworkStatus>>,
    commands: UnboundedSender<NetworkCommand>,
}

impl NetworkHandle {
    pub fn peers(&self) -> Vec<PeerInfo> {
        let peers = lock_peers(&self.peers);
        let mut infos: Vec<PeerInfo> = peers.values().map(|peer| peer.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn send(&self, command: NetworkCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

fn lock_peers(peers: &Mutex<Peers>) -> MutexGuard<'_, Peers> {
    peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Network {
    params: ChainParams,
    config: NetworkConfig,
    index: Arc<RwLock<HeaderIndex>>,
    peers: Arc<Mutex<Peers>>,
    synchronizer: Synchronizer,
    deferred: DeferredBlocks,
    /// Source of our own unconfirmed anchor transactions, on the parent network.
    anchor_state: Option<Arc<Mutex<AnchorState>>>,
    nonce: u64,
    next_peer_id: Arc<AtomicU64>,
    /// Chain-defined seed addresses, tried after the configured ones.
    seeds: Vec<String>,
    seeds_connecting: HashSet<String>,
    seeds_connected: HashMap<PeerId, String>,
    seeds_attempted: HashMap<String, Instant>,
    last_ping: Instant,
    status: Arc<RwLock<NetworkStatus>>,
    events_tx: UnboundedSender<NetEvent>,
    events_rx: UnboundedReceiver<NetEvent>,
    commands_rx: UnboundedReceiver<NetworkCommand>,
}

impl Network {
    pub async fn new(
        chain: ChainHandle,
        config: NetworkConfig,
        anchor_state: Option<Arc<Mutex<AnchorState>>>,
    ) -> (Network, NetworkHandle) {
        let (params, index, seeds) = {
            let chain = chain.lock().await;
            (chain.params().clone(), chain.index(), chain.seed_addresses())
        };
        let (events_tx, events_rx) = unbounded_channel();
        let (commands_tx, commands_rx) = unbounded_channel();
        let peers = Arc::new(Mutex::new(Peers::new()));
        let status = Arc::new(RwLock::new(NetworkStatus { name: params.name.to_string(), ..NetworkStatus::default() }));
        let handle = NetworkHandle {
            name: params.name,
            peers: Arc::clone(&peers),
            status: Arc::clone(&status),
            commands: commands_tx,
        };
        let network = Network {
            synchronizer: Synchronizer::new(chain, config.clone()),
            params,
            config,
            index,
            peers,
            deferred: DeferredBlocks::new(),
            anchor_state,
            nonce: rand::random(),
            next_peer_id: Arc::new(AtomicU64::new(1)),
            seeds,
            seeds_connecting: HashSet::new(),
            seeds_connected: HashMap::new(),
            seeds_attempted: HashMap::new(),
            last_ping: Instant::now(),
            status,
            events_tx,
            events_rx,
            commands_rx,
        };
        (network, handle)
    }

    fn port(&self) -> u16 {
        if self.config.port == 0 {
            self.params.default_port
        } else {
            self.config.port
        }
    }

    fn tip_hash(&self) -> Hash {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner()).tip().hash
    }

    /// Runs until the command channel closes.
    pub async fn run(mut self) {
        if self.config.listen {
            let address = SocketAddr::from(([0, 0, 0, 0], self.port()));
            match TcpListener::bind(address).await {
                Ok(listener) => {
                    info!("{} listening for peers on {}", self.params.name, address);
                    tokio::spawn(accept_loop(
                        listener,
                        self.params.clone(),
                        self.nonce,
                        Arc::clone(&self.index),
                        Arc::clone(&self.next_peer_id),
                        self.events_tx.clone(),
                    ));
                }
                Err(e) => error!("{} could not listen on {}: {}", self.params.name, address, e),
            }
        }

        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = ticker.tick() => self.maintain(Instant::now()),
            }
        }
        info!("{} network stopped", self.params.name);
    }

    fn handle_event(&mut self, event: NetEvent) {
        let peers = Arc::clone(&self.peers);
        let mut peers = lock_peers(&peers);
        match event {
            NetEvent::Connected { peer, seed } => {
                if let Some(seed) = &seed {
                    self.seeds_connecting.remove(seed);
                }
                if peers.len() >= self.config.max_peers {
                    debug!("{} peer limit reached, dropping {}", self.params.name, peer.address);
                    return;
                }
                let peer_id = peer.id;
                let start_height = peer.version.start_height;
                info!("{} peer {} connected ({})", self.params.name, peer_id, peer.address);
                peers.insert(peer_id, peer);
                if let Some(seed) = seed {
                    self.seeds_connected.insert(peer_id, seed);
                }
                let height = self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner()).height();
                if start_height > height as i32 {
                    self.synchronizer.start(&mut peers, peer_id);
                }
            }
            NetEvent::ConnectFailed { seed, reason } => {
                debug!("{} could not connect to {}: {}", self.params.name, seed, reason);
                self.seeds_connecting.remove(&seed);
            }
            NetEvent::Message { peer_id, message } => {
                if let Some(block) = self.handle_message(&mut peers, peer_id, message) {
                    drop(peers);
                    self.insert_block(Some(peer_id), block);
                }
            }
            NetEvent::Disconnected { peer_id, reason } => {
                if let Some(peer) = peers.get_mut(&peer_id) {
                    peer.dispose(&reason);
                }
            }
        }
    }

    /// Returns a block outside any sync, to be inserted once the peer list
    /// is released.
    fn handle_message(&mut self, peers: &mut Peers, peer_id: PeerId, message: NetMessage) -> Option<Block> {
        if peers.get(&peer_id).map_or(true, |peer| peer.is_disposed()) {
            return None;
        }
        match message {
            NetMessage::Ping(nonce) => {
                if let Some(peer) = peers.get_mut(&peer_id) {
                    peer.send(NetMessage::Pong(nonce));
                }
            }
            NetMessage::Pong(_) => {}
            NetMessage::GetHeaders(request) => self.serve_headers(peers, peer_id, &request),
            NetMessage::Headers(headers) => self.synchronizer.on_headers(peers, peer_id, headers),
            NetMessage::Inv(items) => {
                let blocks: Vec<Hash> =
                    items.iter().filter(|item| item.inv_type == InventoryType::Block).map(|item| item.hash).collect();
                if !blocks.is_empty() {
                    self.synchronizer.on_announced(peers, peer_id, blocks);
                }
            }
            NetMessage::GetData(items) => self.serve_data(peers, peer_id, &items),
            NetMessage::Block(block) => match self.synchronizer.on_block(peers, peer_id, block) {
                BlockReceipt::Consumed => {}
                BlockReceipt::Deferred(block) => {
                    self.deferred.insert(block);
                }
                BlockReceipt::Unsolicited(block) => return Some(block),
            },
            NetMessage::NotFound(items) => self.synchronizer.on_notfound(peers, peer_id, &items),
            NetMessage::Reject(reject) => {
                warn!(
                    "{} peer {} rejected {}: {} ({})",
                    self.params.name, peer_id, reject.message, reject.reason, reject.code
                );
            }
            other => debug!("{} ignoring {} from peer {}", self.params.name, command_str(&other.command()), peer_id),
        }
        None
    }

    fn serve_headers(&self, peers: &mut Peers, peer_id: PeerId, request: &GetHeadersMessage) {
        let Some(peer) = peers.get_mut(&peer_id) else { return };
        let result = self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner()).headers_after(
            &request.locator,
            MAX_HEADERS_PER_MSG,
            &request.hash_stop,
        );
        match result {
            Ok(headers) => {
                debug!("{} serving {} headers to peer {}", self.params.name, headers.len(), peer_id);
                peer.send(NetMessage::Headers(headers));
            }
            Err(e) => peer.dispose(&format!("getheaders: {}", e)),
        }
    }

    // Blocks come back from the archive byte for byte; transactions only
    // when they are our own unconfirmed anchors.
    fn serve_data(&self, peers: &mut Peers, peer_id: PeerId, items: &[InventoryVector]) {
        let mut replies = Vec::new();
        let mut missing = Vec::new();
        for item in items {
            let reply = match item.inv_type {
                InventoryType::Block => self.archived_block(&item.hash).map(NetMessage::Block),
                InventoryType::Tx => self.unconfirmed_transaction(&item.hash).map(NetMessage::Tx),
                InventoryType::Error => None,
            };
            match reply {
                Some(message) => replies.push(message),
                None => missing.push(*item),
            }
        }
        let Some(peer) = peers.get_mut(&peer_id) else { return };
        for message in replies {
            peer.send(message);
        }
        if !missing.is_empty() {
            peer.send(NetMessage::NotFound(missing));
        }
    }

    fn archived_block(&self, hash: &Hash) -> Option<Block> {
        let bytes = match self.synchronizer.read_chain(|chain| chain.read_block(hash))? {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("{} could not read block {}: {}", self.params.name, hex::encode(&hash[..8]), e);
                return None;
            }
        };
        if bytes.len() < HEADER_SIZE || sha256d(&bytes[..HEADER_SIZE]) != *hash {
            error!("{} archive returned wrong bytes for block {}", self.params.name, hex::encode(&hash[..8]));
            return None;
        }
        Block::parse(&bytes, 0, &self.params).ok()
    }

    fn unconfirmed_transaction(&self, txid: &Hash) -> Option<Transaction> {
        let state = self.anchor_state.as_ref()?;
        let state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.resolver.unconfirmed_transaction(txid).cloned()
    }

    /// Inserts a block that extends the tip outside a sync and relays it.
    /// Blocks waiting for their parent-chain anchor, or for the chain lock,
    /// go to the deferred pool. The peer list stays unlocked while the chain
    /// works.
    fn insert_block(&mut self, from: Option<PeerId>, block: Block) {
        let hash = block.hash();
        let tip = self.tip_hash();
        if block.header.hash_previous != tip {
            if self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(&hash) {
                return;
            }
            debug!("{} block {} does not extend the tip", self.params.name, hex::encode(&hash[..8]));
            if let Some(peer_id) = from {
                self.synchronizer.on_announced(&mut lock_peers(&self.peers), peer_id, [hash]);
            } else if self.synchronizer.is_syncing() {
                self.deferred.insert(block);
            }
            return;
        }
        let Some(mut chain) = self.synchronizer.lock_idle() else {
            self.deferred.insert(block);
            return;
        };
        let inserted = run_blocking(|| chain.insert_block(block.clone()));
        drop(chain);
        match inserted {
            Ok(height) => {
                info!("{} new tip {} at height {}", self.params.name, hex::encode(&hash[..8]), height);
                for peer in lock_peers(&self.peers).values_mut() {
                    if Some(peer.id) != from && peer.is_idle() {
                        peer.send(NetMessage::Inv(vec![InventoryVector::block(hash)]));
                    }
                }
            }
            Err(ChainError::NotSynchronizedWithParent(_)) => {
                self.deferred.insert(block);
            }
            Err(e) => {
                warn!("{} rejected block {}: {}", self.params.name, hex::encode(&hash[..8]), e);
                if let Some(peer_id) = from.filter(|_| e.is_protocol()) {
                    if let Some(peer) = lock_peers(&self.peers).get_mut(&peer_id) {
                        peer.dispose(&format!("invalid block: {}", e));
                    }
                }
            }
        }
    }

    /// Inserts deferred blocks that now extend the tip, for as long as the tip moves.
    fn retry_deferred(&mut self) {
        while !self.deferred.is_empty() && !self.synchronizer.is_syncing() {
            let tip = self.tip_hash();
            let ready = self.deferred.take_ready(|block| block.header.hash_previous == tip);
            if ready.is_empty() {
                break;
            }
            for block in ready {
                self.insert_block(None, block);
            }
            if self.tip_hash() == tip {
                break;
            }
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::InsertBlock(block) => {
                self.insert_block(None, block);
                self.retry_deferred();
            }
            NetworkCommand::AnnounceTransaction(tx) => {
                let txid = tx.txid();
                info!("{} announcing transaction {}", self.params.name, hex::encode(&txid[..8]));
                for peer in lock_peers(&self.peers).values_mut().filter(|peer| !peer.is_disposed()) {
                    peer.send(NetMessage::Inv(vec![InventoryVector::tx(txid)]));
                }
            }
            NetworkCommand::RetryDeferred => self.retry_deferred(),
        }
    }

    /// Once-a-second pass: timeouts and sync scheduling, removal of disposed
    /// peers, deferred blocks, keep-alive and outbound connections.
    fn maintain(&mut self, now: Instant) {
        let peers = Arc::clone(&self.peers);
        let mut peers = lock_peers(&peers);
        self.synchronizer.tick(&mut peers, now);

        let disposed: Vec<PeerId> = peers.values().filter(|peer| peer.is_disposed()).map(|peer| peer.id).collect();
        for peer_id in disposed {
            self.synchronizer.on_peer_removed(&mut peers, peer_id);
            if let Some(peer) = peers.remove(&peer_id) {
                info!(
                    "{} peer {} ({}) removed: {}",
                    self.params.name,
                    peer_id,
                    peer.address,
                    peer.dispose_reason().unwrap_or("disposed")
                );
            }
            self.seeds_connected.remove(&peer_id);
        }

        if now.saturating_duration_since(self.last_ping) >= Duration::from_secs(PING_INTERVAL_SECONDS) {
            self.last_ping = now;
            for peer in peers.values_mut().filter(|peer| peer.is_idle()) {
                peer.send(NetMessage::Ping(rand::random()));
            }
        }

        let count = peers.len();
        drop(peers);

        self.retry_deferred();
        self.deferred.cleanup();
        *self.status.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = NetworkStatus {
            name: self.params.name.to_string(),
            count_peers: count,
            count_deferred: self.deferred.len(),
            sync: Some(self.synchronizer.status()),
        };
        self.connect_seeds(count, now);
    }

    fn seed_candidates(&self) -> Vec<String> {
        let port = self.params.default_port;
        self.config
            .seeds
            .iter()
            .map(|seed| seed.to_string())
            .chain(self.seeds.iter().cloned())
            .map(|seed| if seed.contains(':') { seed } else { format!("{}:{}", seed, port) })
            .collect()
    }

    fn connect_seeds(&mut self, count_peers: usize, now: Instant) {
        let retry = Duration::from_secs(SEED_RETRY_SECONDS);
        let mut open = self.config.max_peers.saturating_sub(count_peers + self.seeds_connecting.len());
        for seed in self.seed_candidates() {
            if open == 0 {
                break;
            }
            let busy = self.seeds_connecting.contains(&seed) || self.seeds_connected.values().any(|s| *s == seed);
            let recent = self.seeds_attempted.get(&seed).is_some_and(|at| now.saturating_duration_since(*at) < retry);
            if busy || recent {
                continue;
            }
            open -= 1;
            self.seeds_attempted.insert(seed.clone(), now);
            self.seeds_connecting.insert(seed.clone());
            tokio::spawn(connect_outbound(
                seed,
                self.params.clone(),
                self.nonce,
                Arc::clone(&self.index),
                self.next_peer_id.fetch_add(1, Ordering::Relaxed),
                self.events_tx.clone(),
            ));
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    params: ChainParams,
    nonce: u64,
    index: Arc<RwLock<HeaderIndex>>,
    next_peer_id: Arc<AtomicU64>,
    events: UnboundedSender<NetEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                debug!("{} inbound connection from {}", params.name, address);
                let peer_id = next_peer_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(run_connection(
                    stream,
                    address,
                    true,
                    None,
                    params.clone(),
                    nonce,
                    Arc::clone(&index),
                    peer_id,
                    events.clone(),
                ));
            }
            Err(e) => {
                warn!("{} accept failed: {}", params.name, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn connect_outbound(
    seed: String,
    params: ChainParams,
    nonce: u64,
    index: Arc<RwLock<HeaderIndex>>,
    peer_id: PeerId,
    events: UnboundedSender<NetEvent>,
) {
    let connect = async {
        let address = tokio::net::lookup_host(seed.as_str())
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
        let stream = TcpStream::connect(address).await?;
        Ok::<_, std::io::Error>((stream, address))
    };
    match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS), connect).await {
        Ok(Ok((stream, address))) => {
            run_connection(stream, address, false, Some(seed), params, nonce, index, peer_id, events).await;
        }
        Ok(Err(e)) => {
            let _ = events.send(NetEvent::ConnectFailed { seed, reason: e.to_string() });
        }
        Err(_) => {
            let _ = events.send(NetEvent::ConnectFailed { seed, reason: "timed out".to_string() });
        }
    }
}

/// Handshakes on `stream`, registers the peer with the network loop and
/// shuttles messages both ways until either side gives up.
#[allow(clippy::too_many_arguments)]
async fn run_connection<S>(
    mut stream: S,
    address: SocketAddr,
    inbound: bool,
    seed: Option<String>,
    params: ChainParams,
    nonce: u64,
    index: Arc<RwLock<HeaderIndex>>,
    peer_id: PeerId,
    events: UnboundedSender<NetEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let height = index.read().unwrap_or_else(|poisoned| poisoned.into_inner()).height();
    let handshake = perform_handshake(&mut stream, &params, address, nonce, height);
    let version = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(version)) => version,
        Ok(Err(e)) => {
            debug!("{} handshake with {} failed: {}", params.name, address, e);
            if let Some(seed) = seed {
                let _ = events.send(NetEvent::ConnectFailed { seed, reason: e.to_string() });
            }
            return;
        }
        Err(_) => {
            debug!("{} handshake with {} timed out", params.name, address);
            if let Some(seed) = seed {
                let _ = events.send(NetEvent::ConnectFailed { seed, reason: "handshake timed out".to_string() });
            }
            return;
        }
    };

    let (sender, mut outgoing) = unbounded_channel();
    let peer = Peer::new(peer_id, address, inbound, version, sender);
    if events.send(NetEvent::Connected { peer, seed }).is_err() {
        return;
    }

    let (mut reader, mut writer) = tokio::io::split(stream);
    let magic = params.magic;
    let mut writer_task = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            send_message(&mut writer, magic, &message).await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let reason = loop {
        tokio::select! {
            result = read_message(&mut reader, &params) => match result {
                Ok(message) => {
                    if events.send(NetEvent::Message { peer_id, message }).is_err() {
                        break "network stopped".to_string();
                    }
                }
                Err(e) => break format!("read failed: {}", e),
            },
            result = &mut writer_task => {
                break match result {
                    Ok(Ok(())) => "peer dropped".to_string(),
                    Ok(Err(e)) => format!("write failed: {}", e),
                    Err(e) => format!("writer task failed: {}", e),
                };
            }
        }
    };
    writer_task.abort();
    debug!("{} connection to {} closed: {}", params.name, address, reason);
    let _ = events.send(NetEvent::Disconnected { peer_id, reason });
}

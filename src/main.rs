use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use btoken_node::anchor::miner::{AnchorMiner, MinerStatus};
use btoken_node::anchor::wallet::KeyWallet;
use btoken_node::anchor::{AnchorEvent, AnchorRegistry, AnchorState, Wallet};
use btoken_node::api_service::{self, ApiAppState, ChainView};
use btoken_node::blockchain::header_index::HeaderIndex;
use btoken_node::blockchain::{try_lock, Blockchain, ChainHandle};
use btoken_node::chainparams::ChainParams;
use btoken_node::config::{AnchorConfig, NodeConfig};
use btoken_node::error::NodeError;
use btoken_node::p2p::network::{Network, NetworkCommand, NetworkHandle};
use btoken_node::token::bitcoin::TokenBitcoin;
use btoken_node::token::btoken::TokenBToken;
use btoken_node::token::Token;

fn open_chain(token: Box<dyn Token>, data_dir: &Path, config: &NodeConfig) -> Result<ChainHandle, NodeError> {
    let root = data_dir.join(token.params().name);
    let mut chain = Blockchain::new(token, &root, &config.archive)?;
    chain.load()?;
    info!("{} chain loaded at height {}", chain.name(), chain.height());
    Ok(Arc::new(tokio::sync::Mutex::new(chain)))
}

/// Everything the anchor loop touches besides the miner itself.
struct AnchorContext {
    config: AnchorConfig,
    bitcoin_index: Arc<RwLock<HeaderIndex>>,
    btoken: ChainHandle,
    anchor_state: Arc<Mutex<AnchorState>>,
    bitcoin_network: NetworkHandle,
    btoken_network: NetworkHandle,
    miner_status: Arc<RwLock<Option<MinerStatus>>>,
}

impl AnchorContext {
    fn publish_status(&self, miner: &AnchorMiner) {
        *self.miner_status.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(miner.status());
    }

    fn mine(&self, miner: &mut AnchorMiner) {
        let hash_parent_tip = self.bitcoin_index.read().unwrap_or_else(|poisoned| poisoned.into_inner()).tip().hash;
        let Some(mut chain) = try_lock(&self.btoken) else {
            debug!("BToken chain busy, skipping anchor cycle");
            return;
        };
        let mined = {
            let mut state = self.anchor_state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            miner.tick(hash_parent_tip, &mut state, || chain.create_block())
        };
        drop(chain);
        if let Some(mined) = mined {
            info!(
                "Broadcasting anchor {} for BToken block {}",
                hex::encode(&mined.anchor.txid[..8]),
                hex::encode(&mined.anchor.hash_target[..8])
            );
            if !self.bitcoin_network.send(NetworkCommand::AnnounceTransaction(mined.transaction)) {
                warn!("Bitcoin network stopped, anchor not announced");
            }
        }
        self.publish_status(miner);
    }

    fn settle(&self, event: AnchorEvent) {
        let AnchorEvent::Winner { record, block, .. } = event;
        info!("Anchor settled: parent height {} anchors {}", record.height_parent, hex::encode(&record.hash_child[..8]));
        let command = match block {
            Some(block) => NetworkCommand::InsertBlock(block),
            None => NetworkCommand::RetryDeferred,
        };
        if !self.btoken_network.send(command) {
            warn!("BToken network stopped, settled anchor not forwarded");
        }
    }
}

/// Mines anchors on a fixed cadence and forwards settled anchors to the
/// BToken network.
async fn run_anchor_loop(context: AnchorContext, mut events: UnboundedReceiver<AnchorEvent>) {
    let mut miner = AnchorMiner::new(&context.config);
    let mut ticker = tokio::time::interval(Duration::from_secs(context.config.interval_secs.max(1)));
    context.publish_status(&miner);

    loop {
        tokio::select! {
            _ = ticker.tick(), if context.config.enabled => context.mine(&mut miner),
            event = events.recv() => match event {
                Some(event) => context.settle(event),
                None => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    env_logger::init();

    info!("BToken node starting up...");

    let path_config = std::env::args().nth(1);
    let config = NodeConfig::load(path_config.as_deref())?;
    let params_bitcoin = match config.bitcoin_network.as_str() {
        "regtest" => ChainParams::bitcoin_regtest(),
        _ => ChainParams::bitcoin_mainnet(),
    };

    let registry = Arc::new(RwLock::new(AnchorRegistry::new()));
    let token_btoken = TokenBToken::new(ChainParams::btoken(), Arc::clone(&registry));
    let hash_genesis_btoken = token_btoken.create_header_genesis().hash;

    let wallet: Option<Box<dyn Wallet>> = match config.anchor.private_key_hex.as_deref() {
        Some(secret) => Some(Box::new(KeyWallet::from_hex(secret)?)),
        None => {
            if config.anchor.enabled {
                warn!("Anchor mining enabled without a wallet key, no anchors will be mined");
            }
            None
        }
    };
    let anchor_state = Arc::new(Mutex::new(AnchorState::new(wallet, hash_genesis_btoken)));
    let (events_tx, events_rx) = unbounded_channel();

    let token_bitcoin = TokenBitcoin::new(
        params_bitcoin.clone(),
        &config.data_dir.join(params_bitcoin.name),
        config.ledger_cache_max_entries,
        Arc::clone(&anchor_state),
        Arc::clone(&registry),
        Some(events_tx),
    )?;
    // The anchor registry is rebuilt by the parent chain, so it loads first.
    let bitcoin = open_chain(Box::new(token_bitcoin), &config.data_dir, &config)?;
    let btoken = open_chain(Box::new(token_btoken), &config.data_dir, &config)?;
    let bitcoin_index = bitcoin.lock().await.index();
    let btoken_index = btoken.lock().await.index();

    let (network_bitcoin, handle_bitcoin) =
        Network::new(Arc::clone(&bitcoin), config.bitcoin.clone(), Some(Arc::clone(&anchor_state))).await;
    let (network_btoken, handle_btoken) = Network::new(Arc::clone(&btoken), config.btoken.clone(), None).await;
    let bitcoin_task = tokio::spawn(network_bitcoin.run());
    let btoken_task = tokio::spawn(network_btoken.run());
    info!("P2P networks started.");

    let miner_status = Arc::new(RwLock::new(None));
    let context = AnchorContext {
        config: config.anchor.clone(),
        bitcoin_index: Arc::clone(&bitcoin_index),
        btoken: Arc::clone(&btoken),
        anchor_state: Arc::clone(&anchor_state),
        bitcoin_network: handle_bitcoin.clone(),
        btoken_network: handle_btoken.clone(),
        miner_status: Arc::clone(&miner_status),
    };
    let anchor_task = tokio::spawn(run_anchor_loop(context, events_rx));

    let app_state = ApiAppState {
        chains: vec![
            ChainView { name: handle_bitcoin.name, index: bitcoin_index, network: Some(handle_bitcoin) },
            ChainView { name: handle_btoken.name, index: btoken_index, network: Some(handle_btoken) },
        ],
        registry,
        anchor_state,
        miner_status,
    };

    let api_router = api_service::create_router(app_state);
    let api_listener = match tokio::net::TcpListener::bind(&config.api_listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind API listener to {}: {}", config.api_listen_addr, e);
            bitcoin_task.abort();
            btoken_task.abort();
            anchor_task.abort();
            return Err(e.into());
        }
    };
    info!("API server listening on {}", config.api_listen_addr);
    let api_task = tokio::spawn(async move {
        match axum::serve(api_listener, api_router.into_make_service()).await {
            Ok(_) => info!("API service stopped normally."),
            Err(e) => error!("API service encountered an error: {}", e),
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, BToken node shutting down...");
        }
        res_api = api_task => {
            if let Err(e) = res_api {
                error!("API service task panicked or was cancelled: {}", e);
            }
        }
    }

    anchor_task.abort();
    bitcoin_task.abort();
    btoken_task.abort();
    info!("BToken node shut down complete.");
    Ok(())
}

// btoken_node/src/api_service.rs
// Read-only HTTP status surface: chain tips, peers, sync progress, anchors.

use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::{IntoResponse, Json, Response, Sse},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt as _};
use tower_http::cors::{Any, CorsLayer};

use crate::anchor::miner::MinerStatus;
use crate::anchor::{AnchorRecord, AnchorRegistry, AnchorState};
use crate::blockchain::chain::{chain_status, ChainStatus};
use crate::blockchain::header_index::HeaderIndex;
use crate::p2p::network::{NetworkHandle, NetworkStatus};
use crate::p2p::peer::PeerInfo;
use crate::util::hash_from_display;

const STATUS_STREAM_INTERVAL_SECONDS: u64 = 2;
const MAX_ANCHORS_PER_PAGE: usize = 100;

/// One chain as the API sees it: its header index and, once started, its network.
#[derive(Clone)]
pub struct ChainView {
    pub name: &'static str,
    pub index: Arc<RwLock<HeaderIndex>>,
    pub network: Option<NetworkHandle>,
}

// Shared application state available to all handlers
#[derive(Clone)]
pub struct ApiAppState {
    pub chains: Vec<ChainView>,
    pub registry: Arc<RwLock<AnchorRegistry>>,
    pub anchor_state: Arc<Mutex<AnchorState>>,
    pub miner_status: Arc<RwLock<Option<MinerStatus>>>,
}

// --- API Error Handling ---
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

// --- Response Structs ---
#[derive(Serialize)]
struct PingResponse {
    message: String,
    status: String,
}

#[derive(Debug, Serialize)]
pub struct ChainReport {
    pub chain: ChainStatus,
    pub network: Option<NetworkStatus>,
}

#[derive(Debug, Serialize)]
pub struct AnchorSummary {
    pub count_records: usize,
    pub latest: Option<AnchorRecord>,
    pub count_unconfirmed: usize,
    pub count_self_confirmed: u64,
    pub wallet_balance: Option<i64>,
    pub miner: Option<MinerStatus>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub chains: Vec<ChainReport>,
    pub anchors: AnchorSummary,
}

#[derive(Serialize)]
struct PeersResponse {
    chain: &'static str,
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
pub struct PeersQuery {
    chain: Option<String>,
}

#[derive(Deserialize)]
pub struct AnchorsQuery {
    limit: Option<usize>,
}

fn anchor_summary(app_state: &ApiAppState) -> AnchorSummary {
    let registry = app_state.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    let state = app_state.anchor_state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    AnchorSummary {
        count_records: registry.len(),
        latest: registry.latest().cloned(),
        count_unconfirmed: state.resolver.unconfirmed().len(),
        count_self_confirmed: state.resolver.count_self_confirmed(),
        wallet_balance: state.wallet.as_ref().map(|wallet| wallet.balance()),
        miner: app_state.miner_status.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone(),
    }
}

pub fn collect_status(app_state: &ApiAppState) -> StatusResponse {
    StatusResponse {
        version: format!("btoken-node/{}", env!("CARGO_PKG_VERSION")),
        chains: app_state
            .chains
            .iter()
            .map(|view| ChainReport {
                chain: chain_status(view.name, &view.index),
                network: view.network.as_ref().map(|network| network.status()),
            })
            .collect(),
        anchors: anchor_summary(app_state),
    }
}

async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse { message: "pong".to_string(), status: "ok".to_string() })
}

async fn status_handler(State(app_state): State<ApiAppState>) -> Json<StatusResponse> {
    log::debug!("API /status endpoint called");
    Json(collect_status(&app_state))
}

async fn get_peers_handler(
    State(app_state): State<ApiAppState>,
    Query(query): Query<PeersQuery>,
) -> Result<Json<Vec<PeersResponse>>, ApiError> {
    log::debug!("API /peers endpoint called");
    let views: Vec<&ChainView> = match query.chain.as_deref() {
        Some(name) => {
            let view = app_state
                .chains
                .iter()
                .find(|view| view.name == name)
                .ok_or_else(|| ApiError::NotFound(format!("unknown chain {}", name)))?;
            vec![view]
        }
        None => app_state.chains.iter().collect(),
    };
    Ok(Json(
        views
            .into_iter()
            .map(|view| PeersResponse {
                chain: view.name,
                peers: view.network.as_ref().map(|network| network.peers()).unwrap_or_default(),
            })
            .collect(),
    ))
}

async fn get_anchors_handler(
    State(app_state): State<ApiAppState>,
    Query(query): Query<AnchorsQuery>,
) -> Json<Vec<AnchorRecord>> {
    let limit = query.limit.unwrap_or(20).min(MAX_ANCHORS_PER_PAGE);
    let registry = app_state.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    Json(registry.iter_back().take(limit).cloned().collect())
}

async fn get_anchor_by_child_handler(
    State(app_state): State<ApiAppState>,
    Path(hash): Path<String>,
) -> Result<Json<AnchorRecord>, ApiError> {
    let hash = hash_from_display(&hash).map_err(|e| ApiError::BadRequest(format!("invalid block hash: {}", e)))?;
    let registry = app_state.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    registry
        .record_of_child(&hash)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("block is not anchored".to_string()))
}

async fn status_stream_handler(
    State(app_state): State<ApiAppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    log::info!("API /status/stream endpoint called - starting status stream");

    let stream = IntervalStream::new(tokio::time::interval(Duration::from_secs(STATUS_STREAM_INTERVAL_SECONDS)))
        .map(move |_| match serde_json::to_string(&collect_status(&app_state)) {
            Ok(json_data) => Ok(Event::default().data(json_data)),
            Err(e) => {
                log::error!("Failed to serialize status for SSE: {}", e);
                Ok(Event::default().data("{\"error\":\"serialization_failed\"}"))
            }
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// Function to create the Axum router with all API routes
pub fn create_router(app_state: ApiAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/ping", get(ping_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/peers", get(get_peers_handler))
        .route("/api/v1/anchors", get(get_anchors_handler))
        .route("/api/v1/anchor/child/:hash", get(get_anchor_by_child_handler))
        .route("/api/v1/status/stream", get(status_stream_handler))
        .layer(cors)
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::header::Header;
    use crate::chainparams::ChainParams;
    use crate::util::hash_to_display;

    fn app_state() -> ApiAppState {
        let params = ChainParams::btoken();
        let genesis =
            Header::new(1, [0u8; 32], [0u8; 32], 0, params.pow_limit_bits, 0, &params);
        let mut registry = AnchorRegistry::new();
        registry.push(AnchorRecord { height_parent: 3, hash_parent: [1; 32], hash_child: [2; 32], txid: [3; 32] });
        registry.push(AnchorRecord { height_parent: 5, hash_parent: [4; 32], hash_child: [5; 32], txid: [6; 32] });
        ApiAppState {
            chains: vec![ChainView { name: "btoken", index: Arc::new(RwLock::new(HeaderIndex::new(genesis))), network: None }],
            registry: Arc::new(RwLock::new(registry)),
            anchor_state: Arc::new(Mutex::new(AnchorState::new(None, [0u8; 32]))),
            miner_status: Arc::new(RwLock::new(None)),
        }
    }

    #[test]
    fn status_reports_chains_and_anchors() {
        let status = collect_status(&app_state());
        assert_eq!(status.chains.len(), 1);
        assert_eq!(status.chains[0].chain.height, 0);
        assert!(status.chains[0].network.is_none());
        assert_eq!(status.anchors.count_records, 2);
        assert_eq!(status.anchors.latest.as_ref().unwrap().height_parent, 5);
        assert_eq!(status.anchors.wallet_balance, None);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["anchors"]["latest"]["hash_child"], hash_to_display(&[5; 32]));
    }

    #[tokio::test]
    async fn anchor_lookup_by_child_hash() {
        let state = app_state();
        let found = get_anchor_by_child_handler(State(state.clone()), Path(hash_to_display(&[2; 32]))).await;
        assert_eq!(found.ok().unwrap().0.height_parent, 3);

        let missing = get_anchor_by_child_handler(State(state.clone()), Path(hash_to_display(&[9; 32]))).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
        let malformed = get_anchor_by_child_handler(State(state), Path("zz".to_string())).await;
        assert!(matches!(malformed, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn anchors_come_newest_first() {
        let Json(records) = get_anchors_handler(State(app_state()), Query(AnchorsQuery { limit: Some(1) })).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].height_parent, 5);
    }
}

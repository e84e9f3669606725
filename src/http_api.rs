//! HTTP API: thin axum handlers over the Query Engine, one coin-scoped
//! `Store`/`NodeClient`/`CacheManager` triple per configured coin, routed
//! by a `<type>` path segment on every route.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::cache::CacheManager;
use crate::config::Settings;
use crate::error::IndexerError;
use crate::node_client::NodeClient;
use crate::query::QueryEngine;
use crate::store::Store;

/// One coin's resolved backing services, built once at startup from
/// `settings.coins` (see `main.rs`).
pub struct CoinState {
    pub store: Arc<Store>,
    pub client: Arc<NodeClient>,
    pub cache: Arc<CacheManager>,
}

pub type Coins = Arc<HashMap<String, CoinState>>;

pub fn build_router(coins: Coins, settings: Arc<Settings>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/api/block/{type}/{hash}", get(block_handler))
        .route("/api/tx/{type}/{txid}", get(tx_handler))
        .route("/api/address/{type}", get(address_missing_handler))
        .route("/api/address/{type}/{address}", get(address_handler))
        .route("/api/address/{type}/{address}/unspent", get(unspent_handler))
        .layer(cors)
        .layer(Extension(coins))
        .layer(Extension(settings))
}

async fn root_handler() -> Json<Value> {
    Json(json!({"status": "OK", "status_code": 200, "data": {"service": "chainidx"}}))
}

fn ok_envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({"status": "OK", "status_code": 200, "data": data}))
}

fn bad_request(coin_type: &str, error: &str, details: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "status": "Bad Request",
            "status_code": 400,
            "error": error,
            "details": details,
            "type": coin_type,
        })),
    )
}

fn err_envelope(coin_type: &str, err: IndexerError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        IndexerError::NotFound(_) => StatusCode::NOT_FOUND,
        IndexerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        IndexerError::Transport(_) | IndexerError::RetryExhausted(_) | IndexerError::PermanentHttp { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%err, %status, "request failed");
    (
        status,
        Json(json!({
            "status": status.canonical_reason().unwrap_or("Error"),
            "status_code": status.as_u16(),
            "error": err.to_string(),
            "type": coin_type,
        })),
    )
}

/// Resolves `coin_type` against the coins this process was started with,
/// or a 400 envelope listing the supported set.
fn resolve_coin<'a>(coins: &'a HashMap<String, CoinState>, coin_type: &str) -> std::result::Result<&'a CoinState, (StatusCode, Json<Value>)> {
    coins.get(coin_type).ok_or_else(|| {
        let mut known: Vec<&str> = coins.keys().map(String::as_str).collect();
        known.sort();
        bad_request(coin_type, "unrecognized coin type", &format!("must be one of: [{}]", known.join(", ")))
    })
}

async fn block_handler(
    Extension(coins): Extension<Coins>,
    Extension(settings): Extension<Arc<Settings>>,
    Path((coin_type, hash)): Path<(String, String)>,
) -> impl IntoResponse {
    let coin = match resolve_coin(&coins, &coin_type) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let engine = QueryEngine::new(&coin.store, &coin.cache, &coin.client, settings.address_tx_guardrail);
    match engine.get_block(&hash).await {
        Ok(doc) => ok_envelope(doc).into_response(),
        Err(e) => err_envelope(&coin_type, e).into_response(),
    }
}

async fn tx_handler(
    Extension(coins): Extension<Coins>,
    Extension(settings): Extension<Arc<Settings>>,
    Path((coin_type, txid)): Path<(String, String)>,
) -> impl IntoResponse {
    let coin = match resolve_coin(&coins, &coin_type) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let engine = QueryEngine::new(&coin.store, &coin.cache, &coin.client, settings.address_tx_guardrail);
    match engine.get_tx(&txid).await {
        Ok(doc) => ok_envelope(doc).into_response(),
        Err(e) => err_envelope(&coin_type, e).into_response(),
    }
}

async fn address_missing_handler(Extension(coins): Extension<Coins>, Path(coin_type): Path<String>) -> impl IntoResponse {
    match resolve_coin(&coins, &coin_type) {
        Err(e) => e.into_response(),
        Ok(_) => bad_request(&coin_type, "address not sent", "address is required").into_response(),
    }
}

async fn address_handler(
    Extension(coins): Extension<Coins>,
    Extension(settings): Extension<Arc<Settings>>,
    Path((coin_type, address)): Path<(String, String)>,
) -> impl IntoResponse {
    let coin = match resolve_coin(&coins, &coin_type) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let engine = QueryEngine::new(&coin.store, &coin.cache, &coin.client, settings.address_tx_guardrail);
    match engine.get_address(&address).await {
        Ok(doc) => ok_envelope(doc).into_response(),
        Err(e) => err_envelope(&coin_type, e).into_response(),
    }
}

async fn unspent_handler(
    Extension(coins): Extension<Coins>,
    Extension(settings): Extension<Arc<Settings>>,
    Path((coin_type, address)): Path<(String, String)>,
) -> impl IntoResponse {
    let coin = match resolve_coin(&coins, &coin_type) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let engine = QueryEngine::new(&coin.store, &coin.cache, &coin.client, settings.address_tx_guardrail);
    match engine.get_unspent(&address).await {
        Ok(doc) => ok_envelope(doc).into_response(),
        Err(e) => err_envelope(&coin_type, e).into_response(),
    }
}

//! # JSON-RPC + WebSocket API
//!
//! Builds the axum router that fronts the consensus core. All endpoints
//! share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                   | Description                          |
//! |--------|------------------------|--------------------------------------|
//! | GET    | `/health`              | Liveness probe                       |
//! | GET    | `/status`              | Node + core status summary           |
//! | POST   | `/rpc`                 | JSON-RPC 2.0 gateway                 |
//! | GET    | `/ws`                  | WebSocket event subscriptions        |
//! | GET    | `/transactions/{hash}` | REST mirror of `get_transaction`     |
//! | GET    | `/validators`          | Current validator set                |
//!
//! ## Error codes
//!
//! The `/rpc` gateway speaks JSON-RPC 2.0: `-32700` parse error, `-32600`
//! invalid request, `-32601` unknown method, `-32000` validation failure
//! (reason in `data.reason`), `-32029` rate limited, `-32603` internal.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use conclave_core::appeal::AppealError;
use conclave_core::events::Topic;
use conclave_core::primitives::ids::{Address, TxHash};
use conclave_core::runtime::{CoreError, CoreRuntime};
use conclave_core::transaction::types::{ConsensusRoundEntry, Transaction};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers. Cheap to
/// clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<CoreRuntime>,
    pub metrics: SharedMetrics,
    pub version: String,
    pub network: String,
    /// Shared secret for admin methods. `None` = open (dev).
    pub admin_token: Option<String>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// A small fixed-window request counter. Good enough to keep one noisy
/// client from starving the rest; anything fancier belongs in a gateway.
#[derive(Debug)]
pub struct RateLimiter {
    limit_per_second: u32,
    window: Mutex<(u64, u32)>,
}

impl RateLimiter {
    pub fn new(limit_per_second: u32) -> Self {
        Self {
            limit_per_second,
            window: Mutex::new((0, 0)),
        }
    }

    /// Returns false when the current one-second window is exhausted.
    pub fn allow(&self) -> bool {
        let second = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut window = self.window.lock();
        if window.0 != second {
            *window = (second, 0);
        }
        if window.1 >= self.limit_per_second {
            return false;
        }
        window.1 += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .route("/transactions/:hash", get(transaction_by_hash_handler))
        .route("/validators", get(validators_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// JSON-RPC Types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const VALIDATION_ERROR: i32 = -32000;
const RATE_LIMITED: i32 = -32029;

fn rpc_ok(id: serde_json::Value, result: serde_json::Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        result: Some(result),
        error: None,
        id,
    }
}

fn rpc_err(id: serde_json::Value, code: i32, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }),
        id,
    }
}

fn rpc_validation_err(id: serde_json::Value, reason: impl Into<String>) -> JsonRpcResponse {
    let reason = reason.into();
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        result: None,
        error: Some(JsonRpcError {
            code: VALIDATION_ERROR,
            message: "validation error".into(),
            data: Some(serde_json::json!({ "reason": reason })),
        }),
        id,
    }
}

// ---------------------------------------------------------------------------
// Basic handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the node is alive. The liveness probe
/// for orchestrators; subsystem health belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — node and core status summary.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.runtime.stats() {
        Ok(stats) => Json(serde_json::json!({
            "version": state.version,
            "network": state.network,
            "pending": stats.pending,
            "queued": stats.queued,
            "in_flight": stats.in_flight,
            "validators": stats.validators,
            "subscribers": stats.subscribers,
            "finality_window_seconds": stats.finality_window_seconds,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `GET /transactions/{hash}` — REST mirror of `get_transaction`.
async fn transaction_by_hash_handler(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hash = match TxHash::from_str(&hash) {
        Ok(hash) => hash,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    match state.runtime.get_transaction(&hash) {
        Ok(tx) => Json(tx_to_json(&tx)).into_response(),
        Err(CoreError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "transaction not found" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `GET /validators` — the current validator set.
async fn validators_handler(State(state): State<AppState>) -> impl IntoResponse {
    let validators: Vec<serde_json::Value> = state
        .runtime
        .registry()
        .list()
        .into_iter()
        .map(|v| {
            serde_json::json!({
                "id": v.id,
                "address": v.address.to_string(),
                "stake": v.stake,
                "provider": v.provider,
                "model": v.model,
            })
        })
        .collect();
    Json(validators)
}

// ---------------------------------------------------------------------------
// JSON-RPC gateway
// ---------------------------------------------------------------------------

/// `POST /rpc` — JSON-RPC 2.0 gateway.
///
/// The body is parsed by hand so a malformed payload gets a proper
/// `-32700` instead of an axum 400.
async fn rpc_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    if !state.rate_limiter.allow() {
        state.metrics.rpc_rate_limited_total.inc();
        return Json(rpc_err(
            serde_json::Value::Null,
            RATE_LIMITED,
            "rate limited",
        ));
    }

    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(rpc_err(
                serde_json::Value::Null,
                PARSE_ERROR,
                format!("parse error: {e}"),
            ))
        }
    };

    if request.jsonrpc != "2.0" {
        return Json(rpc_err(
            request.id,
            INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }

    Json(dispatch_rpc(&state, request).await)
}

async fn dispatch_rpc(state: &AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    let params = Params::new(request.params);

    match request.method.as_str() {
        "send_raw_transaction" => match params.hex_bytes(0) {
            Ok(raw) => match state.runtime.submit_raw(&raw) {
                Ok(hash) => {
                    state.metrics.transactions_submitted_total.inc();
                    rpc_ok(id, serde_json::json!(hash.to_string()))
                }
                Err(e) => core_error_response(id, e),
            },
            Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
        },

        "get_transaction" => match params.tx_hash(0) {
            Ok(hash) => match state.runtime.get_transaction(&hash) {
                Ok(tx) => rpc_ok(id, tx_to_json(&tx)),
                Err(e) => core_error_response(id, e),
            },
            Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
        },

        "get_transaction_status" => match params.tx_hash(0) {
            Ok(hash) => match state.runtime.get_status(&hash) {
                Ok(status) => rpc_ok(id, serde_json::json!(status.to_string())),
                Err(e) => core_error_response(id, e),
            },
            Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
        },

        "appeal_transaction" => match params.tx_hash(0) {
            Ok(hash) => match state.runtime.appeal(&hash) {
                Ok(receipt) => {
                    state.metrics.appeals_total.inc();
                    rpc_ok(
                        id,
                        serde_json::json!({
                            "accepted": true,
                            "appeal_count": receipt.appeal_count,
                            "committee_size": receipt.committee_size,
                            "reopened": receipt.reopened,
                        }),
                    )
                }
                Err(AppealError::Store(e)) => {
                    rpc_err(id, INTERNAL_ERROR, format!("internal error: {e}"))
                }
                // Refusals are results, not transport errors: the caller
                // asked a valid question and the answer is "no, because".
                Err(refusal) => rpc_ok(
                    id,
                    serde_json::json!({
                        "accepted": false,
                        "reason": refusal.to_string(),
                    }),
                ),
            },
            Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
        },

        "cancel_transaction" => match params.tx_hash(0) {
            Ok(hash) => match state.runtime.cancel(&hash) {
                Ok(tx) => rpc_ok(
                    id,
                    serde_json::json!({ "status": tx.status.to_string() }),
                ),
                Err(e) => core_error_response(id, e),
            },
            Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
        },

        "get_finality_window" => rpc_ok(
            id,
            serde_json::json!(state.runtime.get_finality_window().as_secs()),
        ),

        "set_finality_window" => {
            if let Some(response) = require_admin(state, &params, 1, id.clone()) {
                return response;
            }
            match params.u64_at(0) {
                Ok(seconds) => match state
                    .runtime
                    .set_finality_window(Duration::from_secs(seconds))
                {
                    Ok(()) => rpc_ok(id, serde_json::json!(seconds)),
                    Err(e) => core_error_response(id, e),
                },
                Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
            }
        }

        "list_validators" => {
            let validators: Vec<serde_json::Value> = state
                .runtime
                .registry()
                .list()
                .into_iter()
                .map(|v| {
                    serde_json::json!({
                        "id": v.id,
                        "address": v.address.to_string(),
                        "stake": v.stake,
                        "provider": v.provider,
                        "model": v.model,
                        "plugin_config": v.plugin_config,
                    })
                })
                .collect();
            rpc_ok(id, serde_json::json!(validators))
        }

        "add_validator" => {
            if let Some(response) = require_admin(state, &params, 4, id.clone()) {
                return response;
            }
            let parsed = (|| -> Result<_, String> {
                let address = params.address(0)?;
                let stake = params.u64_at(1)?;
                let provider = params.string(2)?;
                let model = params.string(3)?;
                Ok((address, stake, provider, model))
            })();
            match parsed {
                Ok((address, stake, provider, model)) => {
                    match state.runtime.registry().add(
                        address,
                        stake,
                        provider,
                        model,
                        serde_json::json!({}),
                    ) {
                        Ok(validator) => rpc_ok(id, serde_json::json!(validator.id)),
                        Err(e) => rpc_validation_err(id, e.to_string()),
                    }
                }
                Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
            }
        }

        "remove_validator" => {
            if let Some(response) = require_admin(state, &params, 1, id.clone()) {
                return response;
            }
            match params.address(0) {
                Ok(address) => match state.runtime.registry().remove(&address) {
                    Ok(()) => rpc_ok(id, serde_json::json!(true)),
                    Err(e) => rpc_validation_err(id, e.to_string()),
                },
                Err(reason) => rpc_err(id, INVALID_PARAMS, reason),
            }
        }

        other => rpc_err(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    }
}

/// Admin gate: when a token is configured, the parameter at `token_index`
/// must match it.
fn require_admin(
    state: &AppState,
    params: &Params,
    token_index: usize,
    id: serde_json::Value,
) -> Option<JsonRpcResponse> {
    let Some(expected) = &state.admin_token else {
        return None;
    };
    match params.string(token_index) {
        Ok(token) if &token == expected => None,
        _ => Some(rpc_validation_err(id, "admin token required")),
    }
}

fn core_error_response(id: serde_json::Value, error: CoreError) -> JsonRpcResponse {
    match error {
        CoreError::Validation(reason) => rpc_validation_err(id, reason),
        CoreError::NotFound(hash) => {
            rpc_validation_err(id, format!("transaction not found: {hash}"))
        }
        CoreError::Appeal(e) => rpc_validation_err(id, e.to_string()),
        CoreError::Store(e) => rpc_err(id, INTERNAL_ERROR, format!("internal error: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Param extraction
// ---------------------------------------------------------------------------

/// Positional-or-named parameter access. Positional params index into the
/// array; named params fall back to well-known keys.
struct Params {
    value: serde_json::Value,
}

impl Params {
    fn new(value: Option<serde_json::Value>) -> Self {
        Self {
            value: value.unwrap_or(serde_json::Value::Null),
        }
    }

    fn at(&self, index: usize) -> Option<&serde_json::Value> {
        match &self.value {
            serde_json::Value::Array(items) => items.get(index),
            serde_json::Value::Object(map) => {
                // Named-object fallback for the common single-arg calls.
                const KEYS: [&str; 5] = ["hash", "raw", "seconds", "address", "token"];
                KEYS.iter().filter_map(|k| map.get(*k)).nth(index)
            }
            _ => None,
        }
    }

    fn string(&self, index: usize) -> Result<String, String> {
        self.at(index)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("expected string at param {index}"))
    }

    fn u64_at(&self, index: usize) -> Result<u64, String> {
        self.at(index)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| format!("expected unsigned integer at param {index}"))
    }

    fn hex_bytes(&self, index: usize) -> Result<Vec<u8>, String> {
        let raw = self.string(index)?;
        let trimmed = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(trimmed).map_err(|e| format!("invalid hex at param {index}: {e}"))
    }

    fn tx_hash(&self, index: usize) -> Result<TxHash, String> {
        let raw = self.string(index)?;
        TxHash::from_str(&raw).map_err(|e| format!("invalid hash at param {index}: {e}"))
    }

    fn address(&self, index: usize) -> Result<Address, String> {
        let raw = self.string(index)?;
        Address::from_str(&raw).map_err(|e| format!("invalid address at param {index}: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Response shaping
// ---------------------------------------------------------------------------

/// Renders a transaction record (journal included) as explorer-friendly
/// JSON: hex identifiers, upper-snake statuses, camel-case round tags.
fn tx_to_json(tx: &Transaction) -> serde_json::Value {
    serde_json::json!({
        "hash": tx.hash.to_string(),
        "from": tx.from.to_string(),
        "to": tx.to.map(|a| a.to_string()),
        "kind": tx.kind.to_string(),
        "nonce": tx.nonce,
        "value": tx.value.to_string(),
        "input": format!("0x{}", hex::encode(&tx.input)),
        "status": tx.status.to_string(),
        "execution_mode": tx.execution_mode.to_string(),
        "committee_size": tx.committee_size,
        "max_rotations": tx.max_rotations,
        "rotation_count": tx.rotation_count,
        "appeal_count": tx.appeal_count,
        "triggered_by_hash": tx.triggered_by_hash.map(|h| h.to_string()),
        "current_worker": tx.current_worker.map(|w| w.to_string()),
        "timestamp_awaiting_finalization": tx.timestamp_awaiting_finalization,
        "created_at": tx.created_at,
        "consensus_history": tx.consensus_history.iter().map(round_to_json).collect::<Vec<_>>(),
    })
}

fn round_to_json(round: &ConsensusRoundEntry) -> serde_json::Value {
    serde_json::json!({
        "round_index": round.round_index,
        "monitoring": round.monitoring,
        "status_changes": round.status_changes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        "consensus_round": round.consensus_round.map(|t| t.to_string()),
        "appeal": round.appeal,
        "leader": round.leader.map(|a| a.to_string()),
        "committee": round.committee.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        "registry_version": round.registry_version,
        "warning": round.warning,
        "validator_results": round.validator_results.iter().map(|r| serde_json::json!({
            "validator": r.validator.to_string(),
            "vote": r.vote.to_string(),
            "receipt_digest": r.receipt_digest.map(hex::encode),
        })).collect::<Vec<_>>(),
    })
}

// ---------------------------------------------------------------------------
// WebSocket subscriptions
// ---------------------------------------------------------------------------

/// Client → server subscription control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WsCommand {
    /// `{"action":"subscribe","topic":"global" | "tx:0x…" | "account:0x…"}`
    Subscribe { topic: String },
    /// `{"action":"unsubscribe","topic":"…"}`
    Unsubscribe { topic: String },
}

fn parse_topic(raw: &str) -> Result<Topic, String> {
    if raw == "global" {
        return Ok(Topic::Global);
    }
    if let Some(hash) = raw.strip_prefix("tx:") {
        return TxHash::from_str(hash)
            .map(Topic::Tx)
            .map_err(|e| e.to_string());
    }
    if let Some(address) = raw.strip_prefix("account:") {
        return Address::from_str(address)
            .map(Topic::Account)
            .map_err(|e| e.to_string());
    }
    Err(format!("unknown topic: {raw}"))
}

/// `GET /ws` — WebSocket upgrade for event subscriptions.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection: the client subscribes to topics,
/// the server forwards matching [`StatusEvent`]s as JSON until the client
/// disconnects.
///
/// [`StatusEvent`]: conclave_core::events::StatusEvent
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut subscriptions: Vec<(String, conclave_core::events::Subscription)> = Vec::new();

    loop {
        // Drain whatever is ready across the client's subscriptions, then
        // give the socket a short slice to deliver commands. The list is
        // a handful of topics per client; polling it beats wrestling the
        // borrow checker over a combined select.
        let mut payloads = Vec::new();
        for (_, subscription) in &subscriptions {
            while let Some(event) = subscription.try_recv() {
                payloads.push(
                    serde_json::json!({
                        "hash": event.hash.to_string(),
                        "sender": event.sender.to_string(),
                        "contract": event.contract.map(|c| c.to_string()),
                        "status": event.status.to_string(),
                        "round_index": event.round_index,
                        "tag": event.tag.map(|t| t.to_string()),
                        "at": event.at,
                    })
                    .to_string(),
                );
            }
        }
        for payload in payloads {
            if socket.send(Message::Text(payload)).await.is_err() {
                return;
            }
        }

        let message = match tokio::time::timeout(Duration::from_millis(20), socket.recv()).await {
            Err(_) => continue, // Quiet socket; go drain events again.
            Ok(None) => return, // Disconnected.
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<WsCommand>(&text) {
                    Ok(WsCommand::Subscribe { topic }) => match parse_topic(&topic) {
                        Ok(parsed) => {
                            if !subscriptions.iter().any(|(name, _)| name == &topic) {
                                let subscription = state.runtime.subscribe(parsed);
                                subscriptions.push((topic.clone(), subscription));
                            }
                            serde_json::json!({ "subscribed": topic })
                        }
                        Err(reason) => serde_json::json!({ "error": reason }),
                    },
                    Ok(WsCommand::Unsubscribe { topic }) => {
                        subscriptions.retain(|(name, _)| name != &topic);
                        serde_json::json!({ "unsubscribed": topic })
                    }
                    Err(e) => serde_json::json!({ "error": format!("bad command: {e}") }),
                };
                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {
                // Binary/ping/pong: ignored.
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::config::CoreConfig;
    use conclave_core::executor::{MockExecutor, ValidatorExecutor};
    use conclave_core::primitives::keys::Keypair;
    use conclave_core::transaction::envelope::{SignedEnvelope, TxPayload};
    use conclave_core::transaction::types::TransactionKind;

    fn test_state(admin_token: Option<String>) -> AppState {
        let executor: Arc<dyn ValidatorExecutor> = Arc::new(MockExecutor::new());
        let config = CoreConfig {
            crawler_period: Duration::from_secs(3600),
            ..CoreConfig::default()
        };
        let runtime = CoreRuntime::start_temporary(config, executor).unwrap();
        AppState {
            runtime,
            metrics: Arc::new(crate::metrics::NodeMetrics::new()),
            version: "test".into(),
            network: "devnet".into(),
            admin_token,
            rate_limiter: Arc::new(RateLimiter::new(10_000)),
        }
    }

    fn rpc(method: &str, params: serde_json::Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: Some(params),
            id: serde_json::json!(1),
        }
    }

    fn signed_call_hex(keypair: &Keypair, nonce: u64) -> String {
        let raw = SignedEnvelope::sign(
            TxPayload {
                from: keypair.address(),
                to: Some(Address([0xC0; 20])),
                kind: TransactionKind::Call,
                nonce,
                value: 0,
                input: b"method:ping".to_vec(),
                committee_size: None,
                execution_mode: None,
                max_rotations: None,
            },
            keypair,
        )
        .encode();
        format!("0x{}", hex::encode(raw))
    }

    #[tokio::test]
    async fn send_and_get_over_rpc() {
        let state = test_state(None);
        let keypair = Keypair::generate();

        let response = dispatch_rpc(
            &state,
            rpc("send_raw_transaction", serde_json::json!([signed_call_hex(&keypair, 0)])),
        )
        .await;
        let hash = response.result.unwrap().as_str().unwrap().to_string();
        assert!(hash.starts_with("0x"));

        let status = dispatch_rpc(
            &state,
            rpc("get_transaction_status", serde_json::json!([hash.clone()])),
        )
        .await;
        assert_eq!(status.result.unwrap(), serde_json::json!("PENDING"));

        let full = dispatch_rpc(&state, rpc("get_transaction", serde_json::json!([hash]))).await;
        let record = full.result.unwrap();
        assert_eq!(record["status"], "PENDING");
        assert_eq!(record["nonce"], 0);

        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn bad_hex_is_invalid_params() {
        let state = test_state(None);
        let response = dispatch_rpc(
            &state,
            rpc("send_raw_transaction", serde_json::json!(["0xzz"])),
        )
        .await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_nonce_maps_to_validation_error() {
        let state = test_state(None);
        let keypair = Keypair::generate();
        let raw = signed_call_hex(&keypair, 0);

        dispatch_rpc(&state, rpc("send_raw_transaction", serde_json::json!([raw])))
            .await
            .result
            .unwrap();

        // A different payload with the same (from, nonce).
        let other = {
            let encoded = SignedEnvelope::sign(
                TxPayload {
                    from: keypair.address(),
                    to: Some(Address([0xC1; 20])),
                    kind: TransactionKind::Call,
                    nonce: 0,
                    value: 1,
                    input: vec![],
                    committee_size: None,
                    execution_mode: None,
                    max_rotations: None,
                },
                &keypair,
            )
            .encode();
            format!("0x{}", hex::encode(encoded))
        };
        let response =
            dispatch_rpc(&state, rpc("send_raw_transaction", serde_json::json!([other]))).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, VALIDATION_ERROR);
        assert!(error.data.unwrap()["reason"]
            .as_str()
            .unwrap()
            .contains("nonce"));

        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let state = test_state(None);
        let response = dispatch_rpc(&state, rpc("mint_money", serde_json::json!([]))).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn appeal_refusal_is_a_result_not_an_error() {
        let state = test_state(None);
        let keypair = Keypair::generate();

        let submitted = dispatch_rpc(
            &state,
            rpc("send_raw_transaction", serde_json::json!([signed_call_hex(&keypair, 0)])),
        )
        .await;
        let hash = submitted.result.unwrap();

        // A PENDING transaction cannot be appealed; that is a refusal
        // with a reason, not a transport error.
        let response = dispatch_rpc(&state, rpc("appeal_transaction", serde_json::json!([hash]))).await;
        let result = response.result.unwrap();
        assert_eq!(result["accepted"], false);
        assert!(result["reason"].as_str().unwrap().contains("PENDING"));

        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn finality_window_roundtrip_and_admin_gate() {
        let state = test_state(Some("sesame".into()));

        // Without the token: refused.
        let refused = dispatch_rpc(
            &state,
            rpc("set_finality_window", serde_json::json!([30])),
        )
        .await;
        assert_eq!(refused.error.unwrap().code, VALIDATION_ERROR);

        // With the token: applied.
        let applied = dispatch_rpc(
            &state,
            rpc("set_finality_window", serde_json::json!([30, "sesame"])),
        )
        .await;
        assert_eq!(applied.result.unwrap(), serde_json::json!(30));

        let read_back = dispatch_rpc(&state, rpc("get_finality_window", serde_json::json!([]))).await;
        assert_eq!(read_back.result.unwrap(), serde_json::json!(30));

        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn validator_admin_methods() {
        let state = test_state(None);
        let address = Address([0x11; 20]);

        let added = dispatch_rpc(
            &state,
            rpc(
                "add_validator",
                serde_json::json!([address.to_string(), 5_000, "openai", "gpt-4o"]),
            ),
        )
        .await;
        assert!(added.result.is_some());

        let listed = dispatch_rpc(&state, rpc("list_validators", serde_json::json!([]))).await;
        let validators = listed.result.unwrap();
        assert_eq!(validators.as_array().unwrap().len(), 1);
        assert_eq!(validators[0]["stake"], 5_000);

        let removed = dispatch_rpc(
            &state,
            rpc("remove_validator", serde_json::json!([address.to_string()])),
        )
        .await;
        assert_eq!(removed.result.unwrap(), serde_json::json!(true));

        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limiter_trips_at_capacity() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn topic_parsing() {
        assert!(matches!(parse_topic("global"), Ok(Topic::Global)));
        let hash = TxHash([0xAB; 32]);
        assert!(matches!(
            parse_topic(&format!("tx:{hash}")),
            Ok(Topic::Tx(h)) if h == hash
        ));
        let address = Address([0x12; 20]);
        assert!(matches!(
            parse_topic(&format!("account:{address}")),
            Ok(Topic::Account(a)) if a == address
        ));
        assert!(parse_topic("blocks").is_err());
    }
}

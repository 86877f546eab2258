//! HTTP API: settlement streams, checkout confirmation, deal tooling and health

use crate::chain::ChainManager;
use crate::config::{ApiConfig, Settings};
use crate::deal::{
    create_deal, decode_deal_payload, encode_deal_payload, payload_from_hex, payload_to_hex,
    Deal, DealTerms,
};
use crate::error::{SettlementError, SettlementResult};
use crate::session::{ConfirmOutcome, ConfirmationGate};
use crate::settlement::{Orchestrator, SettlementRequest};
use crate::stream;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const CONFIRM_ACTION: &str = "confirm_settlement";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub gate: Arc<ConfirmationGate>,
    pub orchestrator: Orchestrator,
    pub chain_manager: Arc<ChainManager>,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/settle", post(settle))
        .route("/settle/relay", post(settle_relay))
        .route("/sessions/confirm", post(confirm_session))
        .route("/deals/prepare", post(prepare_deal))
        .route("/deals/decode", post(decode_deal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SettlementResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SettlementError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SettlementError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every connected chain answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chains: Vec<ChainStatus> = state
        .chain_manager
        .health_check()
        .await
        .into_iter()
        .map(|h| ChainStatus {
            role: h.role.to_string(),
            name: h.name,
            chain_id: h.chain_id,
            healthy: h.healthy,
        })
        .collect();
    let ready = chains.iter().all(|c| c.healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            pending_confirmations: state.gate.pending_count(),
            chains,
        }),
    )
}

/// Start a settlement run and stream its progress
async fn settle(
    State(state): State<AppState>,
    Json(request): Json<SettlementRequest>,
) -> impl IntoResponse {
    let cancel = CancellationToken::new();
    let events = state.orchestrator.spawn(request, cancel.clone());
    stream::sse_response(events, cancel, state.settings.settlement.heartbeat())
}

/// Relay a settlement run hosted by the upstream engine
async fn settle_relay(State(state): State<AppState>, body: Bytes) -> Response {
    match state.settings.settlement.upstream_url.as_deref() {
        Some(upstream) if !upstream.trim().is_empty() => {
            stream::relay(&state.http, upstream.trim(), body).await
        }
        _ => ApiError::with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            SettlementError::Configuration {
                missing: vec!["settlement.upstream_url".to_string()],
            },
        )
        .into_response(),
    }
}

/// Resolve a run parked at checkout
async fn confirm_session(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRequest>,
) -> Response {
    if request.action != CONFIRM_ACTION {
        warn!("Rejected session action {:?}", request.action);
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "error": format!("unsupported action {:?}", request.action),
            })),
        )
            .into_response();
    }

    let ok = state.gate.confirm(&request.session_id) == ConfirmOutcome::Confirmed;
    Json(ConfirmResponse { ok }).into_response()
}

/// Identify agreed terms and produce the payload the gateway expects
async fn prepare_deal(
    State(state): State<AppState>,
    Json(terms): Json<DealTerms>,
) -> Result<Json<PreparedDeal>, ApiError> {
    let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
    let fields = terms.to_fields(now + state.settings.settlement.deal_ttl_secs)?;
    let deal = create_deal(fields);
    let payload = payload_to_hex(&encode_deal_payload(&deal));

    info!("Prepared deal {}", deal.short_id());
    Ok(Json(PreparedDeal { deal, payload }))
}

/// Decode a payload and report whether its id matches its terms
async fn decode_deal(Json(request): Json<DecodeRequest>) -> Result<Json<DecodedDeal>, ApiError> {
    let bytes = payload_from_hex(&request.payload)?;
    let deal = decode_deal_payload(&bytes)?;
    let verified = deal.verify().is_ok();
    Ok(Json(DecodedDeal { deal, verified }))
}

/// Error body for deal tooling endpoints
pub struct ApiError {
    status: StatusCode,
    error: SettlementError,
}

impl ApiError {
    fn with_status(status: StatusCode, error: SettlementError) -> Self {
        Self { status, error }
    }
}

impl From<SettlementError> for ApiError {
    fn from(error: SettlementError) -> Self {
        let status = match error {
            SettlementError::InvalidField { .. } | SettlementError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error.to_string(),
                kind: self.error.kind().to_string(),
            }),
        )
            .into_response()
    }
}

// Request and response types

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    session_id: String,
    action: String,
}

#[derive(Serialize)]
struct ConfirmResponse {
    ok: bool,
}

#[derive(Deserialize)]
struct DecodeRequest {
    payload: String,
}

#[derive(Serialize)]
struct PreparedDeal {
    deal: Deal,
    payload: String,
}

#[derive(Serialize)]
struct DecodedDeal {
    deal: Deal,
    verified: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    ready: bool,
    pending_confirmations: usize,
    chains: Vec<ChainStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainStatus {
    role: String,
    name: String,
    chain_id: u64,
    healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deal::tests::sample_deal;
    use crate::deal::DealWire;
    use crate::settlement::DefaultExecutorProvider;
    use crate::stream::SseParser;
    use crate::tx::{NonceManager, TransactionSender};
    use crate::watcher::PollingWatcher;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let mut settings = Settings::default();
        settings.settlement.simulate_step_delay_ms = 1;
        let settings = Arc::new(settings);

        let chain_manager = Arc::new(ChainManager::new(&settings));
        let gate = Arc::new(ConfirmationGate::new());
        let executors = Arc::new(DefaultExecutorProvider::new(
            settings.clone(),
            chain_manager.clone(),
            Arc::new(TransactionSender::new(Arc::new(NonceManager::new()))),
            Arc::new(PollingWatcher),
        ));

        AppState {
            orchestrator: Orchestrator::new(settings.clone(), gate.clone(), executors),
            settings,
            gate,
            chain_manager,
            http: reqwest::Client::new(),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_without_chains() {
        let response = router(test_state())
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["pendingConfirmations"], 0);
    }

    #[tokio::test]
    async fn test_confirm_unknown_session_is_a_no_op() {
        let response = router(test_state())
            .oneshot(post_json(
                "/sessions/confirm",
                serde_json::json!({"sessionId": "nope", "action": "confirm_settlement"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"ok": false}));
    }

    #[tokio::test]
    async fn test_confirm_resolves_registered_session() {
        let state = test_state();
        state.gate.register("s-1");

        let response = router(state.clone())
            .oneshot(post_json(
                "/sessions/confirm",
                serde_json::json!({"sessionId": "s-1", "action": "confirm_settlement"}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, serde_json::json!({"ok": true}));

        let again = router(state)
            .oneshot(post_json(
                "/sessions/confirm",
                serde_json::json!({"sessionId": "s-1", "action": "confirm_settlement"}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(again).await, serde_json::json!({"ok": false}));
    }

    #[tokio::test]
    async fn test_confirm_rejects_other_actions() {
        let response = router(test_state())
            .oneshot(post_json(
                "/sessions/confirm",
                serde_json::json!({"sessionId": "s-1", "action": "cancel"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_prepare_then_decode() {
        let wire = DealWire::from(sample_deal());
        let response = router(test_state())
            .oneshot(post_json(
                "/deals/prepare",
                serde_json::json!({
                    "buyer": wire.buyer,
                    "sellerBase": wire.seller_base,
                    "polygonEscrow": wire.polygon_escrow,
                    "nft": wire.nft,
                    "tokenId": "42",
                    "price": "80.5",
                    "deadline": wire.deadline,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let prepared = json_body(response).await;
        assert_eq!(prepared["deal"]["dealId"], wire.deal_id);
        assert_eq!(prepared["deal"]["price"], "80500000");

        let response = router(test_state())
            .oneshot(post_json(
                "/deals/decode",
                serde_json::json!({"payload": prepared["payload"]}),
            ))
            .await
            .unwrap();
        let decoded = json_body(response).await;
        assert_eq!(decoded["verified"], true);
        assert_eq!(decoded["deal"], prepared["deal"]);
    }

    #[tokio::test]
    async fn test_prepare_rejects_bad_address() {
        let response = router(test_state())
            .oneshot(post_json(
                "/deals/prepare",
                serde_json::json!({
                    "buyer": "0x12",
                    "sellerBase": "0x2000000000000000000000000000000000000002",
                    "polygonEscrow": "0x3000000000000000000000000000000000000003",
                    "nft": "0x4000000000000000000000000000000000000004",
                    "tokenId": "1",
                    "price": "1",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "invalid_field");
    }

    #[tokio::test]
    async fn test_decode_rejects_short_payload() {
        let response = router(test_state())
            .oneshot(post_json("/deals/decode", serde_json::json!({"payload": "0x00ff"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "malformed_payload");
    }

    #[tokio::test]
    async fn test_relay_requires_upstream() {
        let response = router(test_state())
            .oneshot(post_json("/settle/relay", serde_json::json!({"mode": "simulate"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_settle_streams_simulated_run() {
        let response = router(test_state())
            .oneshot(post_json(
                "/settle",
                serde_json::json!({
                    "mode": "simulate",
                    "deal": DealWire::from(sample_deal()),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let frames = SseParser::new().feed(&bytes);
        let names: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();

        assert_eq!(names.first(), Some(&"state"));
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(names.iter().filter(|n| **n == "timeline_step").count(), 12);
        assert_eq!(names.iter().filter(|n| **n == "error").count(), 0);
    }
}

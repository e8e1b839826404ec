//! Inbound webhook surface.
//!
//! Push payloads carry the same page shape as a query response, so a
//! verified request funnels straight into the page processor. Requests that
//! fail authentication are dropped with 401 before the body is interpreted;
//! a payload that fails processing returns 400 and leaves the listener up.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::PageProcessor;
use crate::error::SyncError;
use crate::orchestrator::ENTITY;
use tidemark_db::sync::store::SyncStateStore;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

const MAX_TIMESTAMP_AGE_MINUTES: i64 = 15;

#[derive(Clone)]
pub struct WebhookState {
    pub secret: Vec<u8>,
    pub store: SyncStateStore,
    pub processor: PageProcessor,
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/projects", post(receive_projects))
        .with_state(state)
}

/// Bind one listener task per configured address, all serving the same
/// router and all draining on cancellation.
pub async fn serve(
    addrs: &[String],
    state: WebhookState,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, SyncError> {
    let router = build_router(state);
    let mut handles = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "webhook listener bound");
        let app = router.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
            if let Err(error) = served {
                tracing::error!(error = %error, "webhook listener terminated");
            }
        }));
    }
    Ok(handles)
}

async fn ping() -> Json<Value> {
    Json(json!({"data": "pong", "now": Utc::now()}))
}

async fn receive_projects(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let Some(timestamp) = request_timestamp(&headers) else {
        tracing::warn!("rejected webhook post without a parseable date header");
        return StatusCode::UNAUTHORIZED;
    };
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::warn!("rejected webhook post without a signature header");
        return StatusCode::UNAUTHORIZED;
    };
    if !verify_signature(&state.secret, signature, timestamp, &body)
        || !is_recent(timestamp, Utc::now())
    {
        tracing::warn!("rejected webhook post with a bad or stale signature");
        return StatusCode::UNAUTHORIZED;
    }

    match process_payload(&state, &body).await {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            tracing::error!(error = %error, "failed to process webhook payload");
            StatusCode::BAD_REQUEST
        }
    }
}

fn request_timestamp(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get(header::DATE)?
        .to_str()
        .ok()
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// HMAC-SHA256 over `"{unix_seconds}.{body}"`, compared in constant time.
pub fn verify_signature(
    secret: &[u8],
    signature: &str,
    timestamp: DateTime<Utc>,
    body: &str,
) -> bool {
    let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(format!("{}.{body}", timestamp.timestamp()).as_bytes());
    mac.verify_slice(&provided).is_ok()
}

fn is_recent(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - timestamp).abs() <= Duration::minutes(MAX_TIMESTAMP_AGE_MINUTES)
}

async fn process_payload(state: &WebhookState, body: &str) -> Result<(), SyncError> {
    let payload: Value = serde_json::from_str(body)
        .map_err(|e| SyncError::Malformed(format!("webhook body is not json: {e}")))?;
    let sync_version = payload
        .pointer("/data/projects/edges")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.get("syncVersion").and_then(Value::as_i64))
        .max();

    let mut sync_state = state
        .store
        .fetch(ENTITY)
        .await?
        .ok_or_else(|| SyncError::Malformed("no sync state for pushed entity".into()))?;
    state.processor.apply_page(&payload, &mut sync_state).await?;
    tracing::info!(as_of = %sync_state.as_of, sync_version, "processed pushed project page");
    Ok(())
}

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const RATE_LIMIT_CODE: &str = "BAD_REQUEST.BURST_RATE_LIMIT_REACHED";
const QUOTA_CODE: &str = "BAD_REQUEST.INSUFFICIENT_CREDITS";
const RATE_LIMIT_MESSAGE_PREFIX: &str = "Burst rate limit";
const QUOTA_MESSAGE_PREFIX: &str = "Insufficient credits";

/// Why an API call failed, as far as retry scheduling cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Short burst throttle; the window clears in seconds.
    RateLimited,
    /// Credit pool exhausted; replenishes on a much longer cadence.
    QuotaExhausted,
    /// Transport failures and anything the remote did not label.
    Unclassified,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api error: {message}")]
    Graphql {
        kind: ApiErrorKind,
        message: String,
        extensions: Option<Value>,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::Graphql { kind, .. } => *kind,
            ApiError::Request(_) => ApiErrorKind::Unclassified,
        }
    }
}

/// Thin GraphQL-over-HTTP client for the remote API.
///
/// Every call posts to the single configured endpoint with token auth and
/// returns the raw response document; callers navigate the shape they asked
/// for. A response carrying an `errors` array is surfaced as a classified
/// [`ApiError`] even when partial data is present.
#[derive(Clone)]
pub struct GraphqlClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl GraphqlClient {
    pub fn new(endpoint: &str, token: &str) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        })
    }

    pub async fn query(&self, document: &str, variables: Value) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("token {}", self.token))
            .json(&json!({ "query": document, "variables": variables }))
            .send()
            .await?;
        let body: Value = response.json().await?;

        if let Some(first) = body.pointer("/errors/0") {
            let message = first
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string();
            let code = first.get("code").and_then(Value::as_str);
            let kind = classify(code, &message);
            tracing::warn!(?kind, code, message = %message, "graphql call returned errors");
            return Err(ApiError::Graphql {
                kind,
                message,
                extensions: first.get("extensions").cloned(),
            });
        }
        Ok(body)
    }
}

/// Classify on the stable error code when the remote provides one, otherwise
/// fall back to the known message prefixes.
fn classify(code: Option<&str>, message: &str) -> ApiErrorKind {
    match code {
        Some(RATE_LIMIT_CODE) => ApiErrorKind::RateLimited,
        Some(QUOTA_CODE) => ApiErrorKind::QuotaExhausted,
        Some(_) => ApiErrorKind::Unclassified,
        None if message.starts_with(RATE_LIMIT_MESSAGE_PREFIX) => ApiErrorKind::RateLimited,
        None if message.starts_with(QUOTA_MESSAGE_PREFIX) => ApiErrorKind::QuotaExhausted,
        None => ApiErrorKind::Unclassified,
    }
}

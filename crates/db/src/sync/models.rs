use chrono::{DateTime, Utc};

use tidemark_common::error::{TidemarkError, TidemarkResult};

/// How far the sync lifecycle for an entity has progressed.
///
/// Progression is forward-only: `Idle -> CursorSyncing -> WebhookListening`.
/// A faulted subscription rewinds the watermark, never the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    CursorSyncing,
    WebhookListening,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "Idle",
            SyncPhase::CursorSyncing => "CursorSyncing",
            SyncPhase::WebhookListening => "WebhookListening",
        }
    }

    pub fn parse(s: &str) -> TidemarkResult<Self> {
        match s {
            "Idle" => Ok(SyncPhase::Idle),
            "CursorSyncing" => Ok(SyncPhase::CursorSyncing),
            "WebhookListening" => Ok(SyncPhase::WebhookListening),
            other => Err(TidemarkError::Validation(format!(
                "unknown sync phase: {other}"
            ))),
        }
    }
}

/// Persisted watermark row, one per tracked entity.
///
/// `cursor` is only meaningful while `phase` is `CursorSyncing`; `as_of` is
/// the point up to which local data is known synchronized.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub entity: String,
    pub phase: SyncPhase,
    pub cursor: Option<String>,
    pub started_at: DateTime<Utc>,
    pub as_of: DateTime<Utc>,
    pub subscription_id: Option<i64>,
}

impl SyncState {
    /// Fresh state for an entity about to begin a cursor backfill.
    pub fn begin(entity: &str) -> Self {
        let now = Utc::now();
        Self {
            entity: entity.to_string(),
            phase: SyncPhase::CursorSyncing,
            cursor: None,
            started_at: now,
            as_of: now,
            subscription_id: None,
        }
    }
}

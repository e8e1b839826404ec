use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::sync::models::{SyncPhase, SyncState};
use tidemark_common::error::{TidemarkError, TidemarkResult};

/// Durable access to the per-entity sync watermark row.
///
/// The orchestrator is the single writer per entity name; `save_with` exists
/// so a page's state update commits in the same transaction as its data.
#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, entity: &str) -> TidemarkResult<Option<SyncState>> {
        let row = sqlx::query(
            "select entity, phase, cursor, started_at, as_of, subscription_id
             from sync_state
             where entity = ?1",
        )
        .bind(entity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TidemarkError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::map_row(r)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, state: &SyncState) -> TidemarkResult<()> {
        self.save_with(&self.pool, state).await
    }

    /// Upsert keyed on entity, through any executor (pool or open transaction).
    pub async fn save_with<'e, E>(&self, executor: E, state: &SyncState) -> TidemarkResult<()>
    where
        E: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query(
            "insert into sync_state (entity, phase, cursor, started_at, as_of, subscription_id)
             values (?1, ?2, ?3, ?4, ?5, ?6)
             on conflict (entity) do update set
               phase = excluded.phase,
               cursor = excluded.cursor,
               started_at = excluded.started_at,
               as_of = excluded.as_of,
               subscription_id = excluded.subscription_id",
        )
        .bind(&state.entity)
        .bind(state.phase.as_str())
        .bind(&state.cursor)
        .bind(state.started_at)
        .bind(state.as_of)
        .bind(state.subscription_id)
        .execute(executor)
        .await
        .map_err(|e| TidemarkError::Database(e.to_string()))?;
        Ok(())
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> TidemarkResult<SyncState> {
        let phase: String = row.get("phase");
        Ok(SyncState {
            entity: row.get("entity"),
            phase: SyncPhase::parse(&phase)?,
            cursor: row.get("cursor"),
            started_at: row.get::<DateTime<Utc>, _>("started_at"),
            as_of: row.get::<DateTime<Utc>, _>("as_of"),
            subscription_id: row.get("subscription_id"),
        })
    }
}

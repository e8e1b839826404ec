//! Drives one entity's sync lifecycle: cursor backfill, catch-up, webhook
//! registration, then passive listening with background supervision.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{PageOutcome, PageProcessor};
use crate::error::SyncError;
use crate::fields::{FieldKind, FieldValue};
use crate::graphql::client::GraphqlClient;
use crate::graphql::queries::{
    PROJECTS_CHANGES_QUERY, PROJECTS_FULL_SYNC_QUERY, PROJECTS_SUBSCRIPTION_PAYLOAD,
    REGISTER_WEBHOOK_MUTATION, REMOVE_WEBHOOK_MUTATION, WEBHOOK_STATE_QUERY,
};
use crate::graphql::retry::RetryPolicy;
use crate::webhook::{self, WebhookState};
use tidemark_config::AppConfig;
use tidemark_db::sync::models::{SyncPhase, SyncState};
use tidemark_db::sync::store::SyncStateStore;

pub const ENTITY: &str = "Project";

const PAGE_DELAY: Duration = Duration::from_millis(100);
const SUBSCRIPTION_POLL_INTERVAL: Duration = Duration::from_secs(10);
const FAULT_POLL_INTERVAL: Duration = Duration::from_secs(23 * 60 * 60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const WATERMARK_OVERLAP_MINUTES: i64 = 15;

/// States a subscription may report while it is being brought up.
const SUBSCRIPTION_READY_STATES: &[&str] = &["PAUSED", "RECOVERING", "RUNNING"];
const SUBSCRIPTION_FAULTED_STATE: &str = "FAULTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncerPhase {
    NotStarted,
    Initializing,
    CursorSyncing,
    IncrementallySyncing,
    WebhookListening,
}

pub struct ProjectSyncer {
    store: SyncStateStore,
    processor: PageProcessor,
    client: GraphqlClient,
    retry: RetryPolicy,
    listen_addrs: Vec<String>,
    public_url: String,
    secret: Vec<u8>,
    cancel: CancellationToken,
    phase: SyncerPhase,
}

impl ProjectSyncer {
    pub fn new(
        pool: SqlitePool,
        client: GraphqlClient,
        config: &AppConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, SyncError> {
        let store = SyncStateStore::new(pool.clone());
        let processor = PageProcessor::new(pool, store.clone());
        Ok(Self {
            store,
            processor,
            client,
            retry: RetryPolicy::default(),
            listen_addrs: config.listen_addrs.clone(),
            public_url: config.public_url.clone(),
            secret: config.signing_secret()?,
            // Child of the process-wide token, so an internal fault can stop
            // this syncer's tasks without tearing down unrelated ones.
            cancel: shutdown.child_token(),
            phase: SyncerPhase::NotStarted,
        })
    }

    pub fn phase(&self) -> SyncerPhase {
        self.phase
    }

    /// Run to completion. Returns `Ok(())` on clean shutdown; an error means
    /// the sync cannot continue without intervention.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        self.phase = SyncerPhase::Initializing;
        tracing::info!(entity = ENTITY, "syncer starting");
        let result = self.run_inner().await;
        self.cancel.cancel();
        match result {
            Err(SyncError::Cancelled) => {
                tracing::info!(entity = ENTITY, "syncer cancelled, shutting down");
                Ok(())
            }
            other => other,
        }
    }

    async fn run_inner(&mut self) -> Result<(), SyncError> {
        match self.store.fetch(ENTITY).await? {
            Some(state) if state.phase == SyncPhase::WebhookListening => {
                tracing::info!("backfill already complete, resuming incremental sync");
                self.incremental_sync(state).await
            }
            resumed => self.full_cursor_sync(resumed).await,
        }
    }

    /// Page through the whole remote collection, resuming from any persisted
    /// cursor.
    async fn full_cursor_sync(&mut self, resumed: Option<SyncState>) -> Result<(), SyncError> {
        self.phase = SyncerPhase::CursorSyncing;
        let mut state = match resumed {
            Some(state) => {
                tracing::info!(cursor = ?state.cursor, "resuming cursor backfill");
                state
            }
            None => {
                let state = SyncState::begin(ENTITY);
                self.store.save(&state).await?;
                tracing::info!("starting cursor backfill from the beginning");
                state
            }
        };

        loop {
            let variables = match &state.cursor {
                Some(cursor) => json!({ "after": cursor }),
                None => Value::Null,
            };
            let outcome = self
                .fetch_and_apply(&PROJECTS_FULL_SYNC_QUERY, variables, &mut state)
                .await?;
            if !outcome.should_continue {
                break;
            }
            self.pause_between_pages().await?;
        }
        tracing::info!("cursor backfill complete");
        self.incremental_sync(state).await
    }

    /// Catch up on changes since the watermark, then hand over to the
    /// webhook subscription.
    async fn incremental_sync(&mut self, mut state: SyncState) -> Result<(), SyncError> {
        self.phase = SyncerPhase::IncrementallySyncing;

        let watermark = state.as_of.max(state.started_at)
            - chrono::Duration::minutes(WATERMARK_OVERLAP_MINUTES);
        // The filter compares against modifiedAt, so the watermark goes out
        // in that field's wire shape.
        let since = FieldKind::ZonedDateTime
            .encode(&FieldValue::Text(watermark.to_rfc3339()))
            .map_err(SyncError::Malformed)?;
        tracing::info!(%since, "fetching changes since watermark");

        let mut cursor: Option<String> = None;
        loop {
            let mut variables = json!({ "since": since });
            if let Some(cursor) = &cursor {
                variables["after"] = json!(cursor);
            }
            let outcome = self
                .fetch_and_apply(&PROJECTS_CHANGES_QUERY, variables, &mut state)
                .await?;
            cursor = outcome.next_cursor;
            if !outcome.should_continue {
                break;
            }
            self.pause_between_pages().await?;
        }

        let background = self.start_webhook(&mut state).await?;

        let now = Utc::now();
        state.phase = SyncPhase::WebhookListening;
        state.started_at = now;
        state.as_of = now;
        self.store.save(&state).await?;
        self.phase = SyncerPhase::WebhookListening;
        tracing::info!("listening for pushed changes");

        self.cancel.cancelled().await;
        background.join().await
    }

    async fn fetch_and_apply(
        &self,
        document: &str,
        variables: Value,
        state: &mut SyncState,
    ) -> Result<PageOutcome, SyncError> {
        let response = self
            .retry
            .run(&self.cancel, || {
                let client = self.client.clone();
                let variables = variables.clone();
                async move { client.query(document, variables).await }
            })
            .await?;
        self.processor.apply_page(&response, state).await
    }

    /// Bring up the listener and the remote subscription, then spawn the
    /// tasks that keep the passive phase honest.
    async fn start_webhook(&mut self, state: &mut SyncState) -> Result<BackgroundTasks, SyncError> {
        let listeners = webhook::serve(
            &self.listen_addrs,
            WebhookState {
                secret: self.secret.clone(),
                store: self.store.clone(),
                processor: self.processor.clone(),
            },
            self.cancel.clone(),
        )
        .await?;

        // A subscription left over from a previous run points at this same
        // callback, but its delivery queue is stale. Best effort removal.
        if let Some(old_id) = state.subscription_id {
            tracing::info!(subscription_id = old_id, "removing previous webhook subscription");
            let removed = self
                .run_query(REMOVE_WEBHOOK_MUTATION, json!({ "dbId": old_id }))
                .await;
            match removed {
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(error) => {
                    tracing::warn!(error = %error, "failed to remove previous subscription")
                }
                Ok(_) => {}
            }
        }

        let callback_url = format!("{}/projects", self.public_url.trim_end_matches('/'));
        tracing::info!(%callback_url, "registering webhook subscription");
        let response = self
            .run_query(
                REGISTER_WEBHOOK_MUTATION,
                json!({
                    "description": "All project events",
                    "url": callback_url,
                    "serializedPayload": PROJECTS_SUBSCRIPTION_PAYLOAD.as_str(),
                }),
            )
            .await?;
        let subscription_id = response
            .pointer("/data/addWebhooks/edges/0/node/dbId")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                SyncError::Malformed("registration response missing subscription id".into())
            })?;
        state.subscription_id = Some(subscription_id);
        self.store.save(state).await?;
        tracing::info!(subscription_id, "webhook subscription created");

        let watch = self.watch();
        watch
            .poll_until(
                subscription_id,
                SUBSCRIPTION_POLL_INTERVAL,
                SUBSCRIPTION_READY_STATES,
            )
            .await?;
        tracing::info!(subscription_id, "webhook subscription is live");

        let heartbeat = tokio::spawn(heartbeat_loop(self.store.clone(), self.cancel.clone()));
        let fault_poll = tokio::spawn(async move {
            match watch
                .poll_until(subscription_id, FAULT_POLL_INTERVAL, &[])
                .await
            {
                Ok(()) | Err(SyncError::Cancelled) => Ok(()),
                Err(error) => Err(error),
            }
        });

        Ok(BackgroundTasks {
            listeners,
            heartbeat,
            fault_poll,
        })
    }

    async fn run_query(&self, document: &str, variables: Value) -> Result<Value, SyncError> {
        self.retry
            .run(&self.cancel, || {
                let client = self.client.clone();
                let variables = variables.clone();
                async move { client.query(document, variables).await }
            })
            .await
    }

    async fn pause_between_pages(&self) -> Result<(), SyncError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(PAGE_DELAY) => Ok(()),
        }
    }

    fn watch(&self) -> SubscriptionWatch {
        SubscriptionWatch {
            client: self.client.clone(),
            retry: self.retry.clone(),
            store: self.store.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

struct BackgroundTasks {
    listeners: Vec<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
    fault_poll: JoinHandle<Result<(), SyncError>>,
}

impl BackgroundTasks {
    /// Drain every spawned task. Only called after cancellation, so each
    /// join completes promptly.
    async fn join(self) -> Result<(), SyncError> {
        for listener in self.listeners {
            let _ = listener.await;
        }
        let _ = self.heartbeat.await;
        match self.fault_poll.await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!(error = %join_error, "subscription watch task panicked");
                Ok(())
            }
        }
    }
}

/// Periodic subscription state checks and the fault handling they share.
struct SubscriptionWatch {
    client: GraphqlClient,
    retry: RetryPolicy,
    store: SyncStateStore,
    cancel: CancellationToken,
}

impl SubscriptionWatch {
    /// Poll the subscription state every `interval` until it reports one of
    /// `accept`. A faulted or unreadable state rewinds the watermark, cancels
    /// the syncer and returns the fault.
    async fn poll_until(
        &self,
        subscription_id: i64,
        interval: Duration,
        accept: &[&str],
    ) -> Result<(), SyncError> {
        loop {
            let response = self
                .retry
                .run(&self.cancel, || {
                    let client = self.client.clone();
                    async move {
                        client
                            .query(WEBHOOK_STATE_QUERY, json!({ "dbId": subscription_id }))
                            .await
                    }
                })
                .await?;

            let code = response
                .pointer("/data/webhook/state/code")
                .and_then(Value::as_str);
            match code {
                Some(code) if accept.contains(&code) => return Ok(()),
                Some(SUBSCRIPTION_FAULTED_STATE) | None => {
                    tracing::error!(
                        subscription_id,
                        state = code,
                        "webhook subscription faulted, manual intervention required"
                    );
                    // Cancel before rewinding, so no heartbeat write can land
                    // on top of the rolled-back watermark.
                    self.cancel.cancel();
                    self.rollback_watermark(interval).await;
                    return Err(SyncError::SubscriptionFaulted(format!(
                        "subscription {subscription_id}"
                    )));
                }
                Some(code) => {
                    tracing::debug!(subscription_id, code, "webhook subscription not ready")
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Rewind the watermark past the window in which pushes may have been
    /// silently dropped, so the next start re-fetches them.
    async fn rollback_watermark(&self, poll_interval: Duration) {
        let undelivered_window = chrono::Duration::from_std(poll_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(1))
            + chrono::Duration::minutes(1);
        let rewound = Utc::now() - undelivered_window;

        match self.store.fetch(ENTITY).await {
            Ok(Some(mut state)) => {
                state.as_of = rewound;
                if let Err(error) = self.store.save(&state).await {
                    tracing::error!(error = %error, "failed to persist watermark rollback");
                } else {
                    tracing::warn!(as_of = %rewound, "watermark rolled back after fault");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(error = %error, "failed to load state for watermark rollback")
            }
        }
    }
}

/// Keep the watermark fresh while the webhook phase is quiet; a persistence
/// failure here means future restarts would miss changes, so it is fatal.
async fn heartbeat_loop(store: SyncStateStore, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }
        let advanced = async {
            let mut state = store
                .fetch(ENTITY)
                .await?
                .ok_or_else(|| tidemark_common::error::TidemarkError::Internal(
                    "sync state disappeared".into(),
                ))?;
            state.as_of = Utc::now();
            store.save(&state).await
        }
        .await;
        if let Err(error) = advanced {
            tracing::error!(error = %error, "failed to advance watermark, stopping syncer");
            cancel.cancel();
            return;
        }
        tracing::trace!("watermark advanced");
    }
}

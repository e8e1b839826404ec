use thiserror::Error;

use crate::graphql::client::ApiError;
use tidemark_common::error::TidemarkError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    State(#[from] TidemarkError),

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response shape: {0}")]
    Malformed(String),

    #[error("webhook subscription faulted: {0}")]
    SubscriptionFaulted(String),

    #[error("cancelled")]
    Cancelled,
}

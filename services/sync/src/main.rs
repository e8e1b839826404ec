mod engine;
mod error;
mod fields;
mod graphql;
mod orchestrator;
mod webhook;

use tokio_util::sync::CancellationToken;

use crate::graphql::client::GraphqlClient;
use crate::orchestrator::ProjectSyncer;
use tidemark_config::{init_tracing, AppConfig};

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(error = %error, "invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        database = %config.database_path,
        endpoint = %config.api_endpoint,
        "tidemark sync service starting"
    );

    if let Err(error) = run(config).await {
        tracing::error!(error = %error, "project sync failed");
        std::process::exit(1);
    }
    tracing::info!("project sync stopped");
}

async fn run(config: AppConfig) -> Result<(), error::SyncError> {
    let pool = tidemark_db::create_pool(&config.database_path).await?;
    tidemark_db::schema::ensure_schema(&pool).await?;

    let client = GraphqlClient::new(&config.api_endpoint, &config.api_token)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    let mut syncer = ProjectSyncer::new(pool, client, &config, &shutdown)?;
    syncer.run().await
}

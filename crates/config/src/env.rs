use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::env;

use tidemark_common::error::{TidemarkError, TidemarkResult};

/// Service configuration, loaded from the environment.
///
/// The API token doubles as the webhook signing secret, so it must be a
/// valid base64url string (no padding).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub api_endpoint: String,
    pub api_token: String,
    /// Local addresses the webhook listener binds to, e.g. "127.0.0.1:9920".
    pub listen_addrs: Vec<String>,
    /// Externally reachable base URL the remote side posts events to.
    pub public_url: String,
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> TidemarkResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        let config = Self {
            database_path: get_var("DATABASE_PATH")?,
            api_endpoint: get_var("API_ENDPOINT")?,
            api_token: get_var("API_TOKEN")?,
            listen_addrs: parse_csv(&get_var_or("LISTEN_ADDRS", "127.0.0.1:9920")),
            public_url: get_var("PUBLIC_URL")?,
            log_level: get_var_or("LOG_LEVEL", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on misconfiguration rather than at first use.
    pub fn validate(&self) -> TidemarkResult<()> {
        if !self.database_path.ends_with(".db") {
            return Err(TidemarkError::Config(
                "DATABASE_PATH must have a .db extension".into(),
            ));
        }

        // The token is used as raw HMAC key bytes, so it has to round-trip.
        let decoded = URL_SAFE_NO_PAD.decode(&self.api_token).map_err(|e| {
            TidemarkError::Config(format!("API_TOKEN is not valid base64url: {e}"))
        })?;
        if URL_SAFE_NO_PAD.encode(&decoded) != self.api_token {
            return Err(TidemarkError::Config(
                "API_TOKEN does not round-trip through base64url".into(),
            ));
        }

        if self.listen_addrs.is_empty() {
            return Err(TidemarkError::Config(
                "LISTEN_ADDRS must contain at least one address".into(),
            ));
        }

        if !self.public_url.starts_with("http://") && !self.public_url.starts_with("https://") {
            return Err(TidemarkError::Config(
                "PUBLIC_URL must be an http or https URL".into(),
            ));
        }

        Ok(())
    }

    /// The decoded HMAC secret used to verify webhook signatures.
    pub fn signing_secret(&self) -> TidemarkResult<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(&self.api_token)
            .map_err(|e| TidemarkError::Config(format!("API_TOKEN is not valid base64url: {e}")))
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn get_var(key: &str) -> TidemarkResult<String> {
    env::var(key).map_err(|_| TidemarkError::Config(format!("{key} is required but not set")))
}

fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

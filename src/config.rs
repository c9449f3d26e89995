use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "edualert=info";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to the Postgres instance holding settings")?;
        let http_timeout = parse_timeout(std::env::var("EDUALERT_HTTP_TIMEOUT_SECS").ok())?;
        Ok(Self {
            database_url,
            http_timeout,
        })
    }
}

fn parse_timeout(raw: Option<String>) -> anyhow::Result<Option<Duration>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("EDUALERT_HTTP_TIMEOUT_SECS must be whole seconds, got `{value}`"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
    }
}

/// Logs go to stderr; stdout is reserved for command output.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod lot;
pub mod product;
pub mod scrape;
pub mod types;

use anyhow::Context;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::Config;
use crate::fetch::StrategyChain;

pub const CERT_DIR: &str = "/app/certificates";

pub struct AppState {
    pub config: Arc<Config>,
    pub fetcher: StrategyChain,
    // Concurrency control for calls to the vendor
    pub outbound_limit: Arc<Semaphore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("target_url", &self.config.target_url)
            .field("strategies", &self.fetcher.names())
            .field("outbound_limit", &self.config.outbound_limit)
            .finish()
    }
}

pub use types::*;

impl AppState {
    pub fn new(config: Config, http_client: reqwest::Client) -> anyhow::Result<Self> {
        let fetcher = StrategyChain::from_config(&config, http_client)?;
        Ok(Self {
            outbound_limit: Arc::new(Semaphore::new(config.outbound_limit)),
            config: Arc::new(config),
            fetcher,
        })
    }

    /// Builds the state with a freshly configured HTTP client.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let http_client = build_http_client(&config)?;
        Self::new(config, http_client)
    }
}

pub fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.timeout)
        .redirect(reqwest::redirect::Policy::limited(10));

    if let Ok(ca_cert_name) = env::var("TLS_CA_CERT") {
        let cert_path = Path::new(CERT_DIR).join(&ca_cert_name);
        let pem = std::fs::read(&cert_path)
            .with_context(|| format!("Failed to read TLS CA certificate at {}", cert_path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("Failed to parse TLS CA certificate at {}", cert_path.display()))?;
        info!("Loaded TLS CA certificate from {}", cert_path.display());
        builder = builder.add_root_certificate(cert);
    }

    builder.build().context("Failed to build HTTP client")
}

use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use coa_scraper::{api, config::Config, AppState, CERT_DIR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting COA scraper");
    info!("Target URL: {}", config.target_url);
    if config.enable_fallback_data {
        warn!("Fallback reference data is enabled; degraded results may be returned");
    }

    let state = AppState::from_config(config)?;
    info!("Fetch strategies: {:?}", state.fetcher.names());
    let addr: SocketAddr = state
        .config
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid COA_BIND_ADDR '{}'", state.config.bind_addr))?;

    let app = api::router(Arc::new(state));

    // Start server
    let tls_cert = env::var("TLS_HOST_CERT").ok();
    let tls_key = env::var("TLS_HOST_KEY").ok();

    match (tls_cert, tls_key) {
        (Some(cert_name), Some(key_name)) => {
            let cert_path = Path::new(CERT_DIR).join(cert_name);
            let key_path = Path::new(CERT_DIR).join(key_name);
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path,
            )
            .await?;
            info!("COA scraper listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        (None, None) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("COA scraper listening on http://{}", addr);
            axum::serve(listener, app).await?;
        }
        _ => {
            warn!("TLS_HOST_CERT and TLS_HOST_KEY must both be set to enable inbound TLS. Falling back to HTTP.");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("COA scraper listening on http://{}", addr);
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

//! Startup utilities for the operator: CRD installation and the webhook server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tracing::info;

use cmstate_common::kube_utils::install_crds;
use cmstate_common::retry::{retry_with_backoff, RetryConfig};

/// Attempts at installing CRDs before startup fails
const CRD_INSTALL_ATTEMPTS: u32 = 5;

/// Certificate and key for serving the webhook over TLS
#[derive(Clone, Debug)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// Install CRDs, retrying while the API server warms up
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let config = RetryConfig {
        initial_delay: Duration::from_secs(1),
        ..RetryConfig::with_max_attempts(CRD_INSTALL_ATTEMPTS)
    };
    retry_with_backoff(&config, "install_crds", || install_crds(client)).await?;
    info!("All CMState CRDs installed/updated");
    Ok(())
}

/// Serve the webhook router on `0.0.0.0:port`
///
/// Without TLS files the server speaks plain HTTP, which the API server will
/// not call; that mode is for local testing behind a proxy.
pub async fn serve_webhook(router: Router, port: u16, tls: Option<TlsFiles>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    match tls {
        Some(files) => {
            let tls_config = RustlsConfig::from_pem_file(&files.cert, &files.key)
                .await
                .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;
            info!(addr = %addr, "Starting webhook server (TLS)");
            axum_server::bind_rustls(addr, tls_config)
                .serve(router.into_make_service())
                .await
                .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind webhook port {}: {}", port, e))?;
            info!(addr = %addr, "Starting webhook server (plain HTTP)");
            axum::serve(listener, router)
                .await
                .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))?;
        }
    }

    Ok(())
}

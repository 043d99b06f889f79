pub mod auth;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod http;
pub mod metrics_defs;
pub mod service;
pub mod synthesize;
pub mod targets;

use crate::config::RelayConfig;
use crate::errors::Result;
use crate::service::RelayService;
use shared::admin_service::Readiness;
use shared::http::serve_on;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Runs the relay listener until the accept loop fails.
///
/// `readiness` is marked once the listener is bound, so an admin `/ready`
/// probe never answers ok before the relay can accept traffic.
pub async fn run(config: RelayConfig, readiness: Readiness) -> Result<()> {
    if config.require_api_key && config.api_key.is_empty() {
        tracing::warn!("require_api_key is set with an empty api_key; every request will be denied");
    }

    let config = Arc::new(config);
    let service = RelayService::new(config.clone())?;

    let listener = TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    readiness.mark_ready();
    tracing::info!(
        host = %config.host,
        port = config.port,
        instances = config.instances.len(),
        "relay listening"
    );
    serve_on(listener, service).await
}

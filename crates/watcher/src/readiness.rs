//! Readiness probing for collaborator APIs.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Interval between attempts to reach an API.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Health-check capability implemented by every collaborator adapter.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Checks the API readiness.
    async fn health(&self) -> anyhow::Result<()>;
}

/// Spins until the API can be reached successfully or the token is
/// cancelled.
pub async fn wait_for_api(client: &dyn ApiClient, token: &CancellationToken) -> anyhow::Result<()> {
    wait_for_api_with(client, POLL_INTERVAL, token).await
}

async fn wait_for_api_with(
    client: &dyn ApiClient,
    interval: Duration,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = token.cancelled() => anyhow::bail!("cancelled while waiting for API readiness"),
            _ = tokio::time::sleep(interval) => match client.health().await {
                Ok(()) => return Ok(()),
                Err(error) => info!(error = ?error, "API is not ready"),
            },
        }
    }
}

//! Keeps dashboards in sync with dashboard ConfigMaps.
//!
//! Every value in a matching ConfigMap's data is one dashboard JSON
//! document; Added and Modified events create (or overwrite) the
//! dashboard, Deleted events remove it by its `title` field.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::apply_or_queue;
use crate::kubernetes::{ConfigMapData, ConfigMapUpdate, EventType, UpdateReceiver};
use crate::retry::RetryQueue;

/// Dashboard operations the reconciler needs from the dashboard server.
#[async_trait]
pub trait DashboardStore: Send + Sync + 'static {
    /// Creates a dashboard from its JSON document, overwriting any
    /// existing dashboard with the same identity.
    async fn create_dashboard(&self, dashboard: &Value) -> anyhow::Result<()>;

    /// Deletes the dashboard with the given title.
    async fn delete_dashboard(&self, title: &str) -> anyhow::Result<()>;
}

/// Consumes dashboard updates until the watch stops or the token is
/// cancelled.
pub async fn run<S: DashboardStore>(
    store: Arc<S>,
    mut updates: UpdateReceiver<ConfigMapData>,
    retry: RetryQueue,
    token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = token.cancelled() => return,
            update = updates.recv() => match update {
                Some(update) => update,
                None => return,
            },
        };
        handle(update, &store, &retry).await;
    }
}

async fn handle<S: DashboardStore>(update: ConfigMapUpdate, store: &Arc<S>, retry: &RetryQueue) {
    let context = update.to_string();
    for (key, document) in &update.data {
        let dashboard: Value = match serde_json::from_str(document) {
            Ok(value) => value,
            Err(error) => {
                error!(
                    resource = %context,
                    key = %key,
                    error = ?error,
                    "ignoring malformed dashboard document",
                );
                continue;
            }
        };
        match update.event_type {
            EventType::Added | EventType::Modified => {
                info!(resource = %context, key = %key, "creating dashboard");
                let store = Arc::clone(store);
                apply_or_queue(retry, context.clone(), move || {
                    let store = Arc::clone(&store);
                    let dashboard = dashboard.clone();
                    async move { store.create_dashboard(&dashboard).await }
                })
                .await;
            }
            EventType::Deleted => {
                let title = match dashboard.get("title").and_then(Value::as_str) {
                    Some(title) => title.to_string(),
                    None => {
                        error!(
                            resource = %context,
                            key = %key,
                            "dashboard document has no title, cannot delete",
                        );
                        continue;
                    }
                };
                info!(resource = %context, key = %key, title = %title, "deleting dashboard");
                let store = Arc::clone(store);
                apply_or_queue(retry, context.clone(), move || {
                    let store = Arc::clone(&store);
                    let title = title.clone();
                    async move { store.delete_dashboard(&title).await }
                })
                .await;
            }
        }
    }
}

//! Keeps data-retention rollups in sync with rollup ConfigMaps.
//!
//! Every value in a matching ConfigMap's data is a JSON array of rollup
//! documents. Added and Modified events create or update each rollup,
//! Deleted events remove them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::apply_or_queue;
use crate::influxdb::Rollup;
use crate::kubernetes::{ConfigMapData, ConfigMapUpdate, EventType, UpdateReceiver};
use crate::retry::RetryQueue;

/// Rollup operations the reconciler needs from the time-series database.
#[async_trait]
pub trait RollupStore: Send + Sync + 'static {
    /// Creates a rollup query.
    async fn create_rollup(&self, rollup: &Rollup) -> anyhow::Result<()>;

    /// Replaces an existing rollup query.
    async fn update_rollup(&self, rollup: &Rollup) -> anyhow::Result<()>;

    /// Removes a rollup query.
    async fn delete_rollup(&self, rollup: &Rollup) -> anyhow::Result<()>;
}

/// Consumes rollup updates until the watch stops or the token is
/// cancelled.
pub async fn run<S: RollupStore>(
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

async fn handle<S: RollupStore>(update: ConfigMapUpdate, store: &Arc<S>, retry: &RetryQueue) {
    let context = update.to_string();
    for (key, document) in &update.data {
        let rollups: Vec<Rollup> = match serde_json::from_str(document) {
            Ok(rollups) => rollups,
            Err(error) => {
                error!(
                    resource = %context,
                    key = %key,
                    error = ?error,
                    "ignoring malformed rollup document",
                );
                continue;
            }
        };
        for rollup in rollups {
            info!(resource = %context, rollup = %rollup.name, event = %update.event_type, "applying rollup change");
            let store = Arc::clone(store);
            let event_type = update.event_type;
            apply_or_queue(retry, context.clone(), move || {
                let store = Arc::clone(&store);
                let rollup = rollup.clone();
                async move {
                    match event_type {
                        EventType::Added => store.create_rollup(&rollup).await,
                        EventType::Modified => store.update_rollup(&rollup).await,
                        EventType::Deleted => store.delete_rollup(&rollup).await,
                    }
                }
            })
            .await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::kubernetes::ResourceKind;

    #[derive(Default)]
    struct MockStore {
        created: AtomicUsize,
        updated: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl RollupStore for MockStore {
        async fn create_rollup(&self, _rollup: &Rollup) -> anyhow::Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update_rollup(&self, _rollup: &Rollup) -> anyhow::Result<()> {
            self.updated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_rollup(&self, _rollup: &Rollup) -> anyhow::Result<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const ROLLUPS: &str = r#"[
        {"retention": "medium", "measurement": "cpu", "name": "cpu_medium",
         "functions": [{"function": "mean", "field": "usage"}]},
        {"retention": "long", "measurement": "cpu", "name": "cpu_long",
         "functions": [{"function": "max", "field": "usage", "alias": "peak"}]}
    ]"#;

    fn update(event_type: EventType, document: &str) -> ConfigMapUpdate {
        let mut data = BTreeMap::new();
        data.insert("rollups".to_string(), document.to_string());
        ConfigMapUpdate {
            event_type,
            kind: ResourceKind::ConfigMap,
            namespace: "monitoring".to_string(),
            name: "rollups-cpu".to_string(),
            labels: BTreeMap::new(),
            data,
        }
    }

    fn queue() -> (RetryQueue, CancellationToken) {
        let token = CancellationToken::new();
        let (queue, _task) = RetryQueue::spawn(Duration::from_millis(20), &token);
        (queue, token)
    }

    #[tokio::test]
    async fn event_type_selects_the_store_operation() {
        let store = Arc::new(MockStore::default());
        let (retry, token) = queue();

        handle(update(EventType::Added, ROLLUPS), &store, &retry).await;
        handle(update(EventType::Modified, ROLLUPS), &store, &retry).await;
        handle(update(EventType::Deleted, ROLLUPS), &store, &retry).await;

        assert_eq!(store.created.load(Ordering::SeqCst), 2);
        assert_eq!(store.updated.load(Ordering::SeqCst), 2);
        assert_eq!(store.deleted.load(Ordering::SeqCst), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn undecodable_document_is_dropped_without_retry() {
        let store = Arc::new(MockStore::default());
        let (retry, token) = queue();

        handle(update(EventType::Added, "not a rollup list"), &store, &retry).await;
        assert_eq!(store.created.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.created.load(Ordering::SeqCst), 0);
        token.cancel();
    }
}

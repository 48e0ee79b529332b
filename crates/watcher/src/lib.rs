//! A crate for watching cluster configuration resources and keeping
//! external monitoring systems in sync with them.
//!
//! The core is the resource-watch and deferred-retry engine: register
//! [`kubernetes::Watcher`] subscriptions before watching starts, and
//! every matching ConfigMap/Secret change arrives on a typed channel in
//! server order. Watch streams are supervised and transparently
//! reconnected with exponential backoff; reconciliation actions that
//! fail against a downstream system are parked in a [`retry::RetryQueue`]
//! and re-attempted on a fixed period until they succeed.
//!
//! # Example
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use watcher::kubernetes::{Selector, SinkBuffer, Watcher};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = kube::Client::try_default().await?;
//! let mut watcher = Watcher::new(client, "monitoring");
//! let selector = Selector::match_label("monitoring", "dashboard")?;
//! let mut dashboards = watcher.subscribe_config_maps(selector, SinkBuffer::default());
//!
//! let token = CancellationToken::new();
//! watcher.start(&token);
//! while let Some(update) = dashboards.recv().await {
//!     println!("{}", update);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod grafana;
pub mod influxdb;
pub mod kapacitor;
pub mod kubernetes;
pub mod readiness;
pub mod reconcile;
pub mod retry;

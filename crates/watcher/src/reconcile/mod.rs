//! Event-to-action dispatch.
//!
//! Each submodule consumes one mode's subscription channels and drives a
//! collaborator adapter. A failed action is handed to the retry queue so
//! a transient downstream outage never loses an update. A malformed
//! document is logged and dropped, since retrying it unmodified cannot
//! succeed; it is only reconsidered when a later event changes it.

use std::future::Future;

use tracing::warn;

use crate::retry::RetryQueue;

pub mod alerts;
pub mod dashboards;
pub mod rollups;

/// Label key on resources carrying configuration updates.
pub const MONITORING_LABEL: &str = "monitoring";
/// Label value selecting dashboard updates.
pub const UPDATE_DASHBOARD: &str = "dashboard";
/// Label value selecting rollup updates.
pub const UPDATE_ROLLUP: &str = "rollup";
/// Label value selecting alert updates.
pub const UPDATE_ALERT: &str = "alert";
/// Label value selecting alert-target updates.
pub const UPDATE_ALERT_TARGET: &str = "alert-target";
/// Label value selecting SMTP configuration updates.
pub const UPDATE_SMTP: &str = "smtp";
/// Name of the data key holding the raw resource specification.
pub const RESOURCE_SPEC_KEY: &str = "spec";

/// Runs a reconciliation action once; on failure the action is queued
/// for periodic retry under the given resource context.
pub(crate) async fn apply_or_queue<F, Fut>(retry: &RetryQueue, context: String, action: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match action().await {
        Ok(()) => {}
        Err(error) => {
            warn!(resource = %context, error = ?error, "reconciliation failed, queueing for retry");
            retry.submit(action);
        }
    }
}

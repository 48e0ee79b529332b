//! Keeps alert tasks, alert targets and SMTP settings in sync with
//! their ConfigMaps and Secrets.
//!
//! Three subscriptions feed this reconciler: alert ConfigMaps carrying a
//! `spec` with the alert name and formula, alert-target ConfigMaps
//! carrying the notification address, and SMTP Secrets carrying the mail
//! relay settings.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{apply_or_queue, RESOURCE_SPEC_KEY};
use crate::kubernetes::{
    ConfigMapData, ConfigMapUpdate, EventType, SecretData, SecretUpdate, UpdateReceiver,
};
use crate::retry::RetryQueue;

/// An alert task definition.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AlertSpec {
    /// Name of the alert task.
    pub name: String,
    /// The alerting formula to evaluate.
    pub formula: String,
}

/// The cluster SMTP configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SmtpConfig {
    /// SMTP service host.
    pub host: String,
    /// SMTP service port.
    pub port: u16,
    /// Name of the user to connect as.
    pub username: String,
    /// Password to connect with.
    pub password: String,
}

/// The alert notification target.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AlertTarget {
    /// Recipient email address.
    pub email: String,
}

/// Alerting operations the reconciler needs from the alerting engine.
#[async_trait]
pub trait AlertEngine: Send + Sync + 'static {
    /// Creates (or replaces) an alert task.
    async fn create_alert(&self, name: &str, formula: &str) -> anyhow::Result<()>;

    /// Applies the SMTP configuration.
    async fn update_smtp_config(&self, config: &SmtpConfig) -> anyhow::Result<()>;

    /// Points alert notifications at the given address.
    async fn update_alert_target(&self, email: &str) -> anyhow::Result<()>;

    /// Removes the alert notification target.
    async fn delete_alert_target(&self) -> anyhow::Result<()>;
}

/// Consumes alert, alert-target and SMTP updates until every watch stops
/// or the token is cancelled.
pub async fn run<E: AlertEngine>(
    engine: Arc<E>,
    mut alerts: UpdateReceiver<ConfigMapData>,
    mut targets: UpdateReceiver<ConfigMapData>,
    mut smtp: UpdateReceiver<SecretData>,
    retry: RetryQueue,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            update = alerts.recv() => match update {
                Some(update) => handle_alert(update, &engine, &retry).await,
                None => return,
            },
            update = targets.recv() => match update {
                Some(update) => handle_target(update, &engine, &retry).await,
                None => return,
            },
            update = smtp.recv() => match update {
                Some(update) => handle_smtp(update, &engine, &retry).await,
                None => return,
            },
        }
    }
}

async fn handle_alert<E: AlertEngine>(
    update: ConfigMapUpdate,
    engine: &Arc<E>,
    retry: &RetryQueue,
) {
    let context = update.to_string();
    let spec = match config_map_spec(&update.data) {
        Some(spec) => spec,
        None => {
            error!(resource = %context, "empty configuration");
            return;
        }
    };
    match update.event_type {
        EventType::Added | EventType::Modified => {
            let alert: AlertSpec = match serde_yaml::from_str(spec) {
                Ok(alert) => alert,
                Err(error) => {
                    error!(resource = %context, error = ?error, "ignoring malformed alert spec");
                    return;
                }
            };
            info!(resource = %context, alert = %alert.name, "creating alert");
            let engine = Arc::clone(engine);
            apply_or_queue(retry, context, move || {
                let engine = Arc::clone(&engine);
                let alert = alert.clone();
                async move { engine.create_alert(&alert.name, &alert.formula).await }
            })
            .await;
        }
        // Alert tasks are only ever created or replaced.
        EventType::Deleted => {}
    }
}

async fn handle_target<E: AlertEngine>(
    update: ConfigMapUpdate,
    engine: &Arc<E>,
    retry: &RetryQueue,
) {
    let context = update.to_string();
    match update.event_type {
        EventType::Added | EventType::Modified => {
            let spec = match config_map_spec(&update.data) {
                Some(spec) => spec,
                None => {
                    error!(resource = %context, "empty configuration");
                    return;
                }
            };
            let target: AlertTarget = match serde_yaml::from_str(spec) {
                Ok(target) => target,
                Err(error) => {
                    error!(resource = %context, error = ?error, "ignoring malformed alert target");
                    return;
                }
            };
            info!(resource = %context, email = %target.email, "updating alert target");
            let engine = Arc::clone(engine);
            apply_or_queue(retry, context, move || {
                let engine = Arc::clone(&engine);
                let target = target.clone();
                async move { engine.update_alert_target(&target.email).await }
            })
            .await;
        }
        EventType::Deleted => {
            info!(resource = %context, "deleting alert target");
            let engine = Arc::clone(engine);
            apply_or_queue(retry, context, move || {
                let engine = Arc::clone(&engine);
                async move { engine.delete_alert_target().await }
            })
            .await;
        }
    }
}

async fn handle_smtp<E: AlertEngine>(update: SecretUpdate, engine: &Arc<E>, retry: &RetryQueue) {
    let context = update.to_string();
    let spec = match secret_spec(&update.data) {
        Some(spec) => spec,
        None => {
            error!(resource = %context, "empty configuration");
            return;
        }
    };
    match update.event_type {
        EventType::Added | EventType::Modified => {
            let config: SmtpConfig = match serde_yaml::from_slice(spec) {
                Ok(config) => config,
                Err(error) => {
                    error!(resource = %context, error = ?error, "ignoring malformed SMTP configuration");
                    return;
                }
            };
            info!(resource = %context, host = %config.host, "updating SMTP configuration");
            let engine = Arc::clone(engine);
            apply_or_queue(retry, context, move || {
                let engine = Arc::clone(&engine);
                let config = config.clone();
                async move { engine.update_smtp_config(&config).await }
            })
            .await;
        }
        // SMTP settings are only ever replaced.
        EventType::Deleted => {}
    }
}

fn config_map_spec(data: &ConfigMapData) -> Option<&str> {
    let spec = data.get(RESOURCE_SPEC_KEY)?;
    if spec.trim().is_empty() {
        return None;
    }
    Some(spec)
}

fn secret_spec(data: &SecretData) -> Option<&[u8]> {
    let spec = &data.get(RESOURCE_SPEC_KEY)?.0;
    if spec.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(spec)
}

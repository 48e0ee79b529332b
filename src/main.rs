use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use watcher::config::{Mode, Opts};
use watcher::kubernetes::{Selector, SinkBuffer, Watcher};
use watcher::readiness::wait_for_api;
use watcher::reconcile::{
    self, MONITORING_LABEL, UPDATE_ALERT, UPDATE_ALERT_TARGET, UPDATE_DASHBOARD, UPDATE_ROLLUP,
    UPDATE_SMTP,
};
use watcher::retry::RetryQueue;
use watcher::{grafana, influxdb, kapacitor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::from_flags();

    let level = if opts.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // This tries a local kubeconfig first, then falls back on the
    // in-cluster configuration.
    let client = kube::Client::try_default().await?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("caught interrupt, shutting down");
            signal_token.cancel();
        }
    });

    let (retry, _retry_task) = RetryQueue::spawn(opts.retry_interval(), &token);

    info!(mode = %opts.mode, namespace = %opts.namespace, "starting watcher");
    match opts.mode {
        Mode::Dashboards => run_dashboards(&opts, client, retry, token).await,
        Mode::Rollups => run_rollups(&opts, client, retry, token).await,
        Mode::Alerts => run_alerts(&opts, client, retry, token).await,
    }
}

async fn run_dashboards(
    opts: &Opts,
    client: kube::Client,
    retry: RetryQueue,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let (username, password) = opts.grafana_credentials()?;
    let grafana = Arc::new(grafana::Client::new(
        &opts.grafana_address,
        username,
        password,
    )?);
    wait_for_api(grafana.as_ref(), &token).await?;

    let selector = Selector::match_label(MONITORING_LABEL, UPDATE_DASHBOARD)?;
    let mut watcher = Watcher::new(client, &opts.namespace);
    let updates = watcher.subscribe_config_maps(selector, SinkBuffer::default());
    watcher.start(&token);

    reconcile::dashboards::run(grafana, updates, retry, token).await;
    Ok(())
}

async fn run_rollups(
    opts: &Opts,
    client: kube::Client,
    retry: RetryQueue,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let influxdb = Arc::new(influxdb::Client::new(opts.influxdb_config())?);
    wait_for_api(influxdb.as_ref(), &token).await?;
    influxdb.setup().await?;

    let selector = Selector::match_label(MONITORING_LABEL, UPDATE_ROLLUP)?;
    let mut watcher = Watcher::new(client, &opts.namespace);
    let updates = watcher.subscribe_config_maps(selector, SinkBuffer::default());
    watcher.start(&token);

    reconcile::rollups::run(influxdb, updates, retry, token).await;
    Ok(())
}

async fn run_alerts(
    opts: &Opts,
    client: kube::Client,
    retry: RetryQueue,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let kapacitor = Arc::new(kapacitor::Client::new(
        &opts.kapacitor_address,
        opts.kapacitor_username.clone(),
        opts.kapacitor_password.clone(),
    )?);
    wait_for_api(kapacitor.as_ref(), &token).await?;

    let mut watcher = Watcher::new(client, &opts.namespace);
    let alerts = watcher.subscribe_config_maps(
        Selector::match_label(MONITORING_LABEL, UPDATE_ALERT)?,
        SinkBuffer::default(),
    );
    let targets = watcher.subscribe_config_maps(
        Selector::match_label(MONITORING_LABEL, UPDATE_ALERT_TARGET)?,
        SinkBuffer::default(),
    );
    let smtp = watcher.subscribe_secrets(
        Selector::match_label(MONITORING_LABEL, UPDATE_SMTP)?,
        SinkBuffer::default(),
    );
    watcher.start(&token);

    reconcile::alerts::run(kapacitor, alerts, targets, smtp, retry, token).await;
    Ok(())
}

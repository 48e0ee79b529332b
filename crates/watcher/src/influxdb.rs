//! InfluxDB HTTP API adapter: database setup and rollup management.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::readiness::ApiClient;
use crate::reconcile::rollups::RollupStore;

/// API address of InfluxDB running in the same pod.
pub const DEFAULT_API_ADDRESS: &str = "http://localhost:8086";

/// Name of the database all metrics go to.
const DATABASE: &str = "k8s";
/// Name of the default retention policy rollups read from.
const RETENTION_DEFAULT: &str = "default";
/// Name of the "medium" retention policy.
const RETENTION_MEDIUM: &str = "medium";
/// Name of the "long" retention policy.
const RETENTION_LONG: &str = "long";

const DURATION_DEFAULT: &str = "24h";
const DURATION_MEDIUM: &str = "4w";
const DURATION_LONG: &str = "52w";

const INTERVAL_MEDIUM: &str = "5m";
const INTERVAL_LONG: &str = "1h";

/// A rollup configuration document.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Rollup {
    /// The retention policy rollup results go into.
    pub retention: String,
    /// The measurement to run the rollup on.
    pub measurement: String,
    /// Name of the rollup query and of the measurement rollup data is
    /// inserted into.
    pub name: String,
    /// Functions for rollup calculation.
    pub functions: Vec<Function>,
}

/// A single rollup function.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Function {
    /// The function name (`mean`, `max`, `percentile_90`, ...).
    pub function: String,
    /// Name of the field to apply the function to.
    pub field: String,
    /// Optional alias for the new field in the rollup measurement.
    #[serde(default)]
    pub alias: Option<String>,
}

/// Connection settings for the InfluxDB API.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the InfluxDB HTTP API.
    pub api_address: String,
    /// Administrator username.
    pub admin_username: String,
    /// Administrator password.
    pub admin_password: String,
    /// Username created for the dashboard server.
    pub grafana_username: String,
    /// Password for the dashboard server user.
    pub grafana_password: String,
}

/// The InfluxDB API client.
pub struct Client {
    http: reqwest::Client,
    base: reqwest::Url,
    config: Config,
}

impl Client {
    /// Creates a new InfluxDB client.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Ok(Client {
            http: reqwest::Client::new(),
            base: reqwest::Url::parse(&config.api_address)?,
            config,
        })
    }

    async fn query(&self, statement: &str) -> anyhow::Result<()> {
        debug!(query = %statement, "executing query");
        let response = self
            .http
            .post(self.base.join("query")?)
            .basic_auth(&self.config.admin_username, Some(&self.config.admin_password))
            .form(&[("q", statement)])
            .send()
            .await?
            .error_for_status()?;
        debug!(status = %response.status(), "query complete");
        Ok(())
    }

    /// Sets up the database: users, database and retention policies.
    /// All statements are idempotent, so setup can run on every start.
    pub async fn setup(&self) -> anyhow::Result<()> {
        let statements = vec![
            format!(
                "create user {} with password '{}' with all privileges",
                self.config.admin_username, self.config.admin_password
            ),
            format!(
                "create user {} with password '{}'",
                self.config.grafana_username, self.config.grafana_password
            ),
            format!(
                "create database {} with duration {}",
                DATABASE, DURATION_DEFAULT
            ),
            format!(
                "grant read on {} to {}",
                DATABASE, self.config.grafana_username
            ),
            format!(
                "create retention policy \"{}\" on {} duration {} replication 1 default",
                RETENTION_DEFAULT, DATABASE, DURATION_DEFAULT
            ),
            format!(
                "create retention policy \"{}\" on {} duration {} replication 1",
                RETENTION_MEDIUM, DATABASE, DURATION_MEDIUM
            ),
            format!(
                "create retention policy \"{}\" on {} duration {} replication 1",
                RETENTION_LONG, DATABASE, DURATION_LONG
            ),
        ];
        for statement in statements {
            self.query(&statement).await?;
        }
        info!("database setup complete");
        Ok(())
    }
}

fn aggregation_interval(retention: &str) -> anyhow::Result<&'static str> {
    match retention {
        RETENTION_MEDIUM => Ok(INTERVAL_MEDIUM),
        RETENTION_LONG => Ok(INTERVAL_LONG),
        other => anyhow::bail!(
            "unknown retention policy {:?}, expected one of: {}, {}",
            other,
            RETENTION_MEDIUM,
            RETENTION_LONG
        ),
    }
}

fn render_function(function: &Function) -> String {
    let alias = function.alias.as_deref().unwrap_or(&function.field);
    match function.function.strip_prefix("percentile_") {
        Some(value) => format!("percentile({}, {}) as {}", function.field, value, alias),
        None => format!("{}({}) as {}", function.function, function.field, alias),
    }
}

fn create_query(rollup: &Rollup) -> anyhow::Result<String> {
    let functions: Vec<String> = rollup.functions.iter().map(render_function).collect();
    Ok(format!(
        "create continuous query \"{name}\" on {db} begin select {functions} into {db}.\"{retention}\".\"{name}\" from {db}.\"{retention_from}\".\"{measurement}\" group by *, time({interval}) end",
        name = rollup.name,
        db = DATABASE,
        functions = functions.join(", "),
        retention = rollup.retention,
        retention_from = RETENTION_DEFAULT,
        measurement = rollup.measurement,
        interval = aggregation_interval(&rollup.retention)?,
    ))
}

fn delete_query(rollup: &Rollup) -> String {
    format!(
        "drop continuous query \"{}\" on {}",
        rollup.name, DATABASE
    )
}

#[async_trait]
impl RollupStore for Client {
    async fn create_rollup(&self, rollup: &Rollup) -> anyhow::Result<()> {
        self.query(&create_query(rollup)?).await
    }

    async fn update_rollup(&self, rollup: &Rollup) -> anyhow::Result<()> {
        // Continuous queries cannot be altered in place.
        let statement = format!("{}; {}", delete_query(rollup), create_query(rollup)?);
        self.query(&statement).await
    }

    async fn delete_rollup(&self, rollup: &Rollup) -> anyhow::Result<()> {
        self.query(&delete_query(rollup)).await
    }
}

#[async_trait]
impl ApiClient for Client {
    async fn health(&self) -> anyhow::Result<()> {
        self.http
            .get(self.base.join("ping")?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

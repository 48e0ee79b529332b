//! Configuration for the watcher process.
//!
//! All configuration comes from command-line flags with environment
//! variable fallbacks. It is parsed and validated before the core
//! starts; an invalid configuration is fatal at startup and never
//! surfaces mid-stream.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use structopt::StructOpt;

use crate::influxdb;

/// Names of all modes the watcher can run in.
pub const ALL_MODES: &[&str] = &["dashboards", "rollups", "alerts"];

/// The mode the watcher runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Watch dashboard ConfigMaps and sync the dashboard server.
    Dashboards,
    /// Watch rollup ConfigMaps and sync the time-series database.
    Rollups,
    /// Watch alert ConfigMaps/Secrets and sync the alerting engine.
    Alerts,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dashboards => write!(f, "dashboards"),
            Mode::Rollups => write!(f, "rollups"),
            Mode::Alerts => write!(f, "alerts"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dashboards" => Ok(Mode::Dashboards),
            "rollups" => Ok(Mode::Rollups),
            "alerts" => Ok(Mode::Alerts),
            other => Err(format!(
                "unknown mode {:?}, expected one of: {}",
                other,
                ALL_MODES.join(", ")
            )),
        }
    }
}

/// Command-line options for the watcher.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "monitoring-watcher",
    about = "Keeps dashboards, rollups and alerts in sync with cluster resources"
)]
pub struct Opts {
    /// Watcher mode: dashboards, rollups or alerts
    #[structopt(long = "mode")]
    pub mode: Mode,

    /// Namespace holding the monitoring resources
    #[structopt(long = "namespace", default_value = "monitoring")]
    pub namespace: String,

    /// Seconds between retry-queue drain cycles
    #[structopt(long = "retry-interval", default_value = "60")]
    pub retry_interval_secs: u64,

    /// Enable debug logging
    #[structopt(long = "debug")]
    pub debug: bool,

    /// Grafana API address
    #[structopt(long = "grafana-address", default_value = "http://localhost:3000")]
    pub grafana_address: String,

    /// Grafana username (required in dashboards mode)
    #[structopt(long = "grafana-username", env = "GRAFANA_USERNAME")]
    pub grafana_username: Option<String>,

    /// Grafana password (required in dashboards mode)
    #[structopt(long = "grafana-password", env = "GRAFANA_PASSWORD", hide_env_values = true)]
    pub grafana_password: Option<String>,

    /// InfluxDB API address
    #[structopt(long = "influxdb-address", default_value = "http://localhost:8086")]
    pub influxdb_address: String,

    /// InfluxDB administrator username
    #[structopt(
        long = "influxdb-admin-username",
        env = "INFLUXDB_ADMIN_USERNAME",
        default_value = "root"
    )]
    pub influxdb_admin_username: String,

    /// InfluxDB administrator password
    #[structopt(
        long = "influxdb-admin-password",
        env = "INFLUXDB_ADMIN_PASSWORD",
        hide_env_values = true,
        default_value = "root"
    )]
    pub influxdb_admin_password: String,

    /// InfluxDB username created for the dashboard server
    #[structopt(
        long = "influxdb-grafana-username",
        env = "INFLUXDB_GRAFANA_USERNAME",
        default_value = "grafana"
    )]
    pub influxdb_grafana_username: String,

    /// InfluxDB password for the dashboard server user
    #[structopt(
        long = "influxdb-grafana-password",
        env = "INFLUXDB_GRAFANA_PASSWORD",
        hide_env_values = true,
        default_value = "grafana"
    )]
    pub influxdb_grafana_password: String,

    /// Kapacitor API address
    #[structopt(long = "kapacitor-address", default_value = "http://localhost:9092")]
    pub kapacitor_address: String,

    /// Kapacitor username
    #[structopt(long = "kapacitor-username", env = "KAPACITOR_USERNAME")]
    pub kapacitor_username: Option<String>,

    /// Kapacitor password
    #[structopt(long = "kapacitor-password", env = "KAPACITOR_PASSWORD", hide_env_values = true)]
    pub kapacitor_password: Option<String>,
}

impl Opts {
    /// Parses all command-line flags.
    pub fn from_flags() -> Self {
        Opts::from_args()
    }

    /// The period between retry-queue drain cycles.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Returns the Grafana credentials, failing if either is unset.
    pub fn grafana_credentials(&self) -> anyhow::Result<(String, String)> {
        match (&self.grafana_username, &self.grafana_password) {
            (Some(username), Some(password)) => Ok((username.clone(), password.clone())),
            _ => anyhow::bail!(
                "GRAFANA_USERNAME and GRAFANA_PASSWORD must be set in dashboards mode"
            ),
        }
    }

    /// Builds the InfluxDB connection settings.
    pub fn influxdb_config(&self) -> influxdb::Config {
        influxdb::Config {
            api_address: self.influxdb_address.clone(),
            admin_username: self.influxdb_admin_username.clone(),
            admin_password: self.influxdb_admin_password.clone(),
            grafana_username: self.influxdb_grafana_username.clone(),
            grafana_password: self.influxdb_grafana_password.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("dashboards".parse::<Mode>().unwrap(), Mode::Dashboards);
        assert_eq!("rollups".parse::<Mode>().unwrap(), Mode::Rollups);
        assert_eq!("alerts".parse::<Mode>().unwrap(), Mode::Alerts);
    }

    #[test]
    fn unknown_mode_names_the_valid_ones() {
        let error = "autoscale".parse::<Mode>().unwrap_err();
        assert!(error.contains("dashboards, rollups, alerts"));
    }

    #[test]
    fn defaults_are_applied() {
        let opts = Opts::from_iter_safe(["monitoring-watcher", "--mode", "rollups"]).unwrap();
        assert_eq!(opts.mode, Mode::Rollups);
        assert_eq!(opts.namespace, "monitoring");
        assert_eq!(opts.retry_interval(), Duration::from_secs(60));
        assert_eq!(opts.influxdb_admin_username, "root");
    }

    #[test]
    fn missing_grafana_credentials_are_a_startup_error() {
        let opts = Opts::from_iter_safe(["monitoring-watcher", "--mode", "dashboards"]).unwrap();
        if opts.grafana_username.is_none() {
            assert!(opts.grafana_credentials().is_err());
        }
    }
}

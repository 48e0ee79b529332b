//! Kapacitor HTTP API adapter: alert tasks, SMTP settings and alert
//! targets.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::readiness::ApiClient;
use crate::reconcile::alerts::{AlertEngine, SmtpConfig};

/// API address of Kapacitor running in the same pod.
pub const DEFAULT_API_ADDRESS: &str = "http://localhost:9092";

/// Database alert tasks stream from.
const DATABASE: &str = "k8s";
/// Retention policy alert tasks stream from.
const RETENTION_POLICY: &str = "default";

/// The Kapacitor API client.
pub struct Client {
    http: reqwest::Client,
    base: reqwest::Url,
    credentials: Option<(String, String)>,
}

impl Client {
    /// Creates a new Kapacitor client. Credentials are optional and only
    /// used when both the username and the password are set.
    pub fn new(
        api_address: &str,
        username: Option<String>,
        password: Option<String>,
    ) -> anyhow::Result<Self> {
        let credentials = match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some((username, password))
            }
            _ => None,
        };
        Ok(Client {
            http: reqwest::Client::new(),
            base: reqwest::Url::parse(api_address)?,
            credentials,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let mut builder = self.http.request(method, self.base.join(path)?);
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, Some(password));
        }
        Ok(builder)
    }

    async fn update_smtp_section(&self, set: serde_json::Value) -> anyhow::Result<()> {
        self.request(reqwest::Method::POST, "kapacitor/v1/config/smtp/")?
            .json(&json!({ "set": set }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl AlertEngine for Client {
    async fn create_alert(&self, name: &str, formula: &str) -> anyhow::Result<()> {
        // Task names carrying "batch" run as batch tasks, everything
        // else streams.
        let task_type = if name.contains("batch") { "batch" } else { "stream" };
        let response = self
            .request(reqwest::Method::POST, "kapacitor/v1/tasks")?
            .json(&json!({
                "id": name,
                "type": task_type,
                "dbrps": [{"db": DATABASE, "rp": RETENTION_POLICY}],
                "script": formula,
                "status": "enabled",
            }))
            .send()
            .await?
            .error_for_status()?;
        info!(task = %name, status = %response.status(), "created alert task");
        Ok(())
    }

    async fn update_smtp_config(&self, config: &SmtpConfig) -> anyhow::Result<()> {
        self.update_smtp_section(json!({
            "host": config.host,
            "port": config.port,
            "username": config.username,
            "password": config.password,
        }))
        .await?;
        info!(host = %config.host, "updated SMTP configuration");
        Ok(())
    }

    async fn update_alert_target(&self, email: &str) -> anyhow::Result<()> {
        self.update_smtp_section(json!({ "to": [email] })).await?;
        info!(email = %email, "updated alert target");
        Ok(())
    }

    async fn delete_alert_target(&self) -> anyhow::Result<()> {
        self.update_smtp_section(json!({ "to": [] })).await?;
        info!("deleted alert target");
        Ok(())
    }
}

#[async_trait]
impl ApiClient for Client {
    async fn health(&self) -> anyhow::Result<()> {
        self.request(reqwest::Method::GET, "kapacitor/v1/ping")?
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

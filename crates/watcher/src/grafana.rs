//! Grafana HTTP API adapter: dashboard creation and deletion.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::readiness::ApiClient;
use crate::reconcile::dashboards::DashboardStore;

/// API address of Grafana running in the same pod.
pub const DEFAULT_API_ADDRESS: &str = "http://localhost:3000";

/// The Grafana API client.
pub struct Client {
    http: reqwest::Client,
    base: reqwest::Url,
    username: String,
    password: String,
}

impl Client {
    /// Creates a new Grafana client with basic-auth credentials.
    pub fn new(
        api_address: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Client {
            http: reqwest::Client::new(),
            base: reqwest::Url::parse(api_address)?,
            username: username.into(),
            password: password.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        Ok(self
            .http
            .request(method, self.base.join(path)?)
            .basic_auth(&self.username, Some(&self.password)))
    }
}

#[derive(Serialize)]
struct CreateDashboardRequest<'a> {
    dashboard: &'a Value,
    // Overwrite an existing dashboard with the same title or uid.
    overwrite: bool,
}

#[async_trait]
impl DashboardStore for Client {
    async fn create_dashboard(&self, dashboard: &Value) -> anyhow::Result<()> {
        let response = self
            .request(reqwest::Method::POST, "api/dashboards/db")?
            .json(&CreateDashboardRequest {
                dashboard,
                overwrite: true,
            })
            .send()
            .await?
            .error_for_status()?;
        info!(status = %response.status(), "created dashboard");
        Ok(())
    }

    async fn delete_dashboard(&self, title: &str) -> anyhow::Result<()> {
        let path = format!("api/dashboards/db/{}", slugify(title));
        let response = self
            .request(reqwest::Method::DELETE, &path)?
            .send()
            .await?
            .error_for_status()?;
        info!(status = %response.status(), "deleted dashboard");
        Ok(())
    }
}

#[async_trait]
impl ApiClient for Client {
    async fn health(&self) -> anyhow::Result<()> {
        // The "home dashboard" API doubles as a health and auth check.
        self.request(reqwest::Method::GET, "api/dashboards/home")?
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// Grafana addresses dashboards by a slug derived from the title.
fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

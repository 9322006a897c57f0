//! HTTP client for the daemon's control API.

use anyhow::{Context, Result, anyhow, bail};
use helm_core::health::ServiceStatus;
use serde_json::json;

/// Client bound to one daemon.
pub struct DaemonClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

/// Outcome of a control operation, distinguishing the benign conflicts
/// the CLI exits 0 on.
pub enum ControlOutcome {
    /// Operation applied; final status row.
    Applied(ServiceStatus),
    /// The service was already running (start only).
    AlreadyRunning,
}

impl DaemonClient {
    /// Create a client for the daemon at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// `GET /services` — catalog names and details.
    pub async fn list_services(&self) -> Result<serde_json::Value> {
        let response = self.request(reqwest::Method::GET, "/services").send().await?;
        parse_json(response).await
    }

    /// `GET /services/status` — all status rows.
    pub async fn all_status(
        &self,
    ) -> Result<std::collections::BTreeMap<String, ServiceStatus>> {
        let response = self
            .request(reqwest::Method::GET, "/services/status")
            .send()
            .await?;
        parse_json(response).await
    }

    /// `POST /services/{name}/start|stop|restart`.
    pub async fn control(
        &self,
        name: &str,
        action: &str,
        mode: Option<&str>,
    ) -> Result<ControlOutcome> {
        let mut builder =
            self.request(reqwest::Method::POST, &format!("/services/{name}/{action}"));
        if let Some(mode) = mode {
            builder = builder.json(&json!({ "mode": mode }));
        }
        let response = builder.send().await?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(ControlOutcome::AlreadyRunning);
        }
        Ok(ControlOutcome::Applied(parse_json(response).await?))
    }

    /// `GET /logs?service=...&limit=...`.
    pub async fn logs(&self, service: &str, limit: u32) -> Result<serde_json::Value> {
        let response = self
            .request(reqwest::Method::GET, "/logs")
            .query(&[("service", service), ("limit", &limit.to_string())])
            .send()
            .await?;
        parse_json(response).await
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let kind = body
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("error");
        let message = body
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("request failed");
        if status == reqwest::StatusCode::UNAUTHORIZED {
            bail!("{kind}: {message} (set HELM_TOKEN to a valid token)");
        }
        bail!("{kind}: {message}");
    }
    response
        .json()
        .await
        .map_err(|e| anyhow!("malformed response from daemon: {e}"))
}

//! Target discovery over the debugging port's HTTP endpoints.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DevToolsError, Result};

/// One entry of `GET /json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Absent while another client is attached to the target.
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }

    pub fn is_service_worker(&self) -> bool {
        self.target_type == "service_worker"
    }
}

/// First service worker whose script URL ends with `script_name`.
pub fn find_service_worker(targets: Vec<TargetInfo>, script_name: &str) -> Option<TargetInfo> {
    targets
        .into_iter()
        .find(|t| t.is_service_worker() && t.url.ends_with(script_name))
}

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    base: String,
    http_client: reqwest::Client,
}

impl DiscoveryClient {
    /// `address` is `http://host:port` or a bare `host:port`.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base_url(address),
            http_client,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>> {
        let url = format!("{}/json", self.base);
        tracing::debug!(url = %url, "listing debugging targets");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| DevToolsError::connection(&url, e))?;
        Self::unwrap_json(&url, response).await
    }

    pub async fn page_targets(&self) -> Result<Vec<TargetInfo>> {
        Ok(self
            .list_targets()
            .await?
            .into_iter()
            .filter(TargetInfo::is_page)
            .collect())
    }

    pub async fn first_page_target(&self) -> Result<TargetInfo> {
        self.page_targets()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DevToolsError::TargetNotFound(format!("no page target at {}", self.base))
            })
    }

    pub async fn service_worker(&self, script_name: &str) -> Result<TargetInfo> {
        let targets = self.list_targets().await?;
        find_service_worker(targets, script_name)
            .ok_or_else(|| DevToolsError::TargetNotFound(script_name.to_string()))
    }

    /// Opens a new tab and returns its target.
    pub async fn new_tab(&self) -> Result<TargetInfo> {
        let url = format!("{}/json/new", self.base);
        let response = self
            .http_client
            .put(&url)
            .send()
            .await
            .map_err(|e| DevToolsError::connection(&url, e))?;
        Self::unwrap_json(&url, response).await
    }

    async fn unwrap_json<T: serde::de::DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(DevToolsError::connection(url, format!("HTTP error: {status}")));
        }
        Ok(response.json().await?)
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

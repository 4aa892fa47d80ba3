use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::flows::runner::WorkUnit;

pub const NAME: &str = "HttpRequest";

#[derive(Debug, Deserialize)]
struct Params {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Calls an HTTP endpoint; any non-2xx response fails the run.
pub struct HttpRequest {
    client: Arc<reqwest::Client>,
    url: String,
    method: Method,
    body: Option<Value>,
    timeout: Duration,
}

impl HttpRequest {
    pub fn from_config(config: &Value, client: Arc<reqwest::Client>) -> Result<Self> {
        if !config.is_object() {
            bail!("{NAME} requires a 'url' parameter");
        }
        let params: Params =
            serde_json::from_value(config.clone()).context("invalid HttpRequest parameters")?;
        let method = Method::from_bytes(params.method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method '{}'", params.method))?;

        Ok(Self {
            client,
            url: params.url,
            method,
            body: params.body,
            timeout: Duration::from_secs(params.timeout_secs),
        })
    }
}

#[async_trait]
impl WorkUnit for HttpRequest {
    async fn run(&self) -> Result<()> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .timeout(self.timeout);
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", self.method, self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("{} {} returned {status}: {body}", self.method, self.url);
        }

        tracing::info!(unit = NAME, method = %self.method, url = %self.url, "Request succeeded");
        Ok(())
    }
}

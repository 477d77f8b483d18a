//! Remote subscription ledger client
//!
//! Non-2xx responses are returned, not raised: callers decide what a status
//! means. Transport failures and timeouts surface as [`BillingError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use subsync_shared::LedgerConfig;

use crate::error::{BillingError, BillingResult};

pub const ACCESS_TOKEN_HEADER: &str = "X-Recharge-Access-Token";

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    /// Parsed JSON body; non-JSON bodies are kept as a string, empty ones as null
    pub body: Value,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait RemoteLedgerClient: Send + Sync {
    async fn get(&self, path: &str) -> BillingResult<RemoteResponse>;

    async fn post(&self, path: &str, body: &Value) -> BillingResult<RemoteResponse>;

    async fn put(&self, path: &str, body: &Value) -> BillingResult<RemoteResponse>;
}

/// reqwest-backed client authenticated with the shop's access token
#[derive(Clone)]
pub struct HttpLedgerClient {
    http: Client,
    base_url: String,
    access_token: String,
}

impl HttpLedgerClient {
    pub fn new(config: &LedgerConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> BillingResult<RemoteResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::debug!(method = %method, path = %path, status = status, "Remote ledger call");
        Ok(RemoteResponse { status, body })
    }
}

#[async_trait]
impl RemoteLedgerClient for HttpLedgerClient {
    async fn get(&self, path: &str) -> BillingResult<RemoteResponse> {
        self.send(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> BillingResult<RemoteResponse> {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> BillingResult<RemoteResponse> {
        self.send(Method::PUT, path, Some(body)).await
    }
}

/// Run a remote call with an upper bound on its duration
pub async fn with_timeout<F>(limit: Duration, call: F) -> BillingResult<RemoteResponse>
where
    F: std::future::Future<Output = BillingResult<RemoteResponse>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BillingError::Timeout),
    }
}

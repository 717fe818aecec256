//! Remote policy sources.
//!
//! Consulted only when a policy is not held locally.

use crate::config::RemoteConfig;
use crate::error::{PolicyError, Result};
use crate::policy::Policy;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::fmt::Debug;
use tracing::debug;

/// A source of policies held elsewhere.
#[async_trait]
pub trait PolicySource: Send + Sync + Debug {
    /// Fetches one policy. `Ok(None)` means the source does not know the id.
    async fn fetch(&self, id: &str) -> Result<Option<Policy>>;

    /// Lists every policy the source holds.
    async fn list(&self) -> Result<Vec<Policy>>;
}

/// Fetches policies over HTTP.
///
/// - `GET {base_url}/policies/{id}` returns `{"policy": {...}}`, or 404
/// - `GET {base_url}/policies` returns `{"policies": [...]}`
///
/// The id is sent as a single percent-encoded path segment.
#[derive(Debug, Clone)]
pub struct HttpPolicySource {
    client: reqwest::Client,
    base: Url,
    base_url: String,
    timeout_ms: u64,
}

impl HttpPolicySource {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fuse-policy/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .build()
            .map_err(|e| PolicyError::ConfigError(format!("unable to create HTTP client: {}", e)))?;

        Self::with_client(client, config)
    }

    /// Uses a preconfigured client. Its own timeout should match `config`.
    pub fn with_client(client: reqwest::Client, config: &RemoteConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| PolicyError::ConfigError(format!("invalid remote base URL '{}': {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(PolicyError::ConfigError(format!(
                "remote base URL '{}' cannot carry a path",
                base_url
            )));
        }

        Ok(Self {
            client,
            base,
            base_url,
            timeout_ms: config.timeout_ms,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, url: Url) -> Result<Option<Value>> {
        debug!(url = %url, "Fetching from remote policy source");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PolicyError::RemoteError(format!("GET {} returned {}", url, status)));
        }

        let body = response.json::<Value>().await.map_err(|e| self.request_error(e))?;
        Ok(Some(body))
    }

    fn request_error(&self, err: reqwest::Error) -> PolicyError {
        if err.is_timeout() {
            PolicyError::RemoteTimeout {
                timeout_ms: self.timeout_ms,
            }
        } else {
            PolicyError::RemoteError(err.to_string())
        }
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self, id: &str) -> Result<Option<Policy>> {
        // dot segments would address a different resource
        if matches!(id, "" | "." | "..") {
            debug!(id = %id, "Policy id cannot name a remote policy");
            return Ok(None);
        }

        match self.get(self.endpoint(&["policies", id])).await? {
            Some(body) => policy_from_body(body).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Policy>> {
        match self.get(self.endpoint(&["policies"])).await? {
            Some(body) => policies_from_body(body),
            None => Ok(Vec::new()),
        }
    }
}

/// Decodes a single-policy response, either wrapped in `policy` or bare.
pub fn policy_from_body(mut body: Value) -> Result<Policy> {
    let policy = match body.get_mut("policy").map(Value::take) {
        Some(inner) => inner,
        None => body,
    };
    Policy::from_value(policy)
}

/// Decodes a listing response, either wrapped in `policies` or a bare array.
pub fn policies_from_body(mut body: Value) -> Result<Vec<Policy>> {
    let list = match body.get_mut("policies").map(Value::take) {
        Some(inner) => inner,
        None => body,
    };
    match list {
        Value::Array(items) => items.into_iter().map(Policy::from_value).collect(),
        other => Err(PolicyError::RemoteError(format!(
            "expected a list of policies, found {}",
            crate::canonicalization::canonicalize(&other)
        ))),
    }
}

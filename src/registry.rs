//! Coordination store client
//!
//! Talks the etcd-v2-style key API: the per-application instance counter
//! lives under `/nextinstance/<app>`, and a liveness key under
//! `/services/instances/<app>/<version>@<instance>` appears once the
//! deployed container registers itself.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Store client errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("coordination store unreachable: {0}")]
    UnreachableStore(#[source] reqwest::Error),

    #[error("malformed store response: {0}")]
    MalformedResponse(String),

    #[error("store API error: {status} - {message}")]
    Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Coordination store operations needed by the allocator and the
/// readiness wait. Trait seam so tests inject an in-memory store.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Read the instance counter for an application. `None` if the key
    /// does not exist yet.
    async fn get_counter(&self, app_name: &str) -> Result<Option<i64>>;

    /// Create the counter if absent. Returns `false` if another writer
    /// created it first.
    async fn create_counter(&self, app_name: &str, value: i64) -> Result<bool>;

    /// Compare-and-swap the counter keyed on the previously read value.
    /// Returns `false` if the store rejected the precondition.
    async fn cas_counter(&self, app_name: &str, new: i64, prev: i64) -> Result<bool>;

    /// Resolve once the liveness key for the given instance appears.
    /// Callers bound this with their own deadline; transient store
    /// errors are retried internally.
    async fn await_instance(&self, app_name: &str, version: &str, instance_id: &str)
        -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct KeyNode {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    node: Option<KeyNode>,
    #[serde(rename = "errorCode")]
    error_code: Option<i64>,
}

/// HTTP-backed store client.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpRegistry {
    /// Create a client for `host` (`<hostname>:<port>`).
    ///
    /// No global client timeout: the liveness watch long-polls. Plain
    /// key operations get a per-request timeout instead.
    pub fn new(host: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(RegistryError::UnreachableStore)?;

        Ok(Self {
            client,
            base_url: format!("http://{}", host.trim_end_matches('/')),
            request_timeout: Duration::from_secs(5),
        })
    }

    fn counter_url(&self, app_name: &str) -> String {
        format!("{}/v2/keys/nextinstance/{}", self.base_url, app_name)
    }

    fn instance_url(&self, app_name: &str, version: &str, instance_id: &str) -> String {
        format!(
            "{}/v2/keys/services/instances/{}/{}@{}",
            self.base_url, app_name, version, instance_id
        )
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    #[instrument(skip(self))]
    async fn get_counter(&self, app_name: &str) -> Result<Option<i64>> {
        let response = self
            .client
            .get(self.counter_url(app_name))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(RegistryError::UnreachableStore)?;

        let status = response.status();
        let body: KeyResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::MalformedResponse(e.to_string()))?;

        // The store reports a missing key as an errorCode payload.
        if body.error_code.is_some() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let value = body
            .node
            .and_then(|n| n.value)
            .ok_or_else(|| RegistryError::MalformedResponse("missing node value".to_string()))?;

        value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| RegistryError::MalformedResponse(format!("non-numeric counter: {value}")))
    }

    #[instrument(skip(self))]
    async fn create_counter(&self, app_name: &str, value: i64) -> Result<bool> {
        let response = self
            .client
            .put(self.counter_url(app_name))
            .timeout(self.request_timeout)
            .form(&[("value", value.to_string()), ("prevExist", "false".to_string())])
            .send()
            .await
            .map_err(RegistryError::UnreachableStore)?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::PRECONDITION_FAILED {
            Ok(false)
        } else {
            Err(RegistryError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    #[instrument(skip(self))]
    async fn cas_counter(&self, app_name: &str, new: i64, prev: i64) -> Result<bool> {
        let response = self
            .client
            .put(self.counter_url(app_name))
            .timeout(self.request_timeout)
            .form(&[("value", new.to_string()), ("prevValue", prev.to_string())])
            .send()
            .await
            .map_err(RegistryError::UnreachableStore)?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::PRECONDITION_FAILED {
            Ok(false)
        } else {
            Err(RegistryError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    #[instrument(skip(self))]
    async fn await_instance(
        &self,
        app_name: &str,
        version: &str,
        instance_id: &str,
    ) -> Result<()> {
        let url = self.instance_url(app_name, version, instance_id);

        loop {
            let result = self
                .client
                .get(&url)
                .query(&[("wait", "true")])
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "Instance liveness key observed");
                    return Ok(());
                }
                Ok(response) => {
                    // Missing key: keep long-polling until it appears.
                    debug!(status = %response.status(), "Liveness key not present yet");
                }
                Err(e) => {
                    warn!(error = %e, "Liveness watch request failed, retrying");
                }
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

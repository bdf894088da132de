//! Cluster scheduler client
//!
//! HTTP client for the fleet-style scheduler API: unit-state listing,
//! unit-definition snapshot and submission, and the two-step retire
//! (desired state to inactive, then delete).

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::units::{UnitFile, UnitState, UnitStatesResponse};

/// Scheduler client errors
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("scheduler unreachable: {0}")]
    UnreachableScheduler(#[source] reqwest::Error),

    #[error("malformed scheduler response: {0}")]
    MalformedResponse(#[source] reqwest::Error),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("scheduler API error: {status} - {message}")]
    Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Outcome of one unit-definition submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Scheduler accepted the unit (201).
    Created,
    /// Scheduler reported a duplicate submission (204). Usually a sign
    /// of a pre-existing unit file for this version.
    Duplicate,
    /// Any other non-success response.
    Rejected(u16),
}

/// Scheduler operations needed by the rebalance run. Trait seam so
/// tests inject an in-memory scheduler.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Query unit states, optionally filtered to one unit name.
    /// No retry at this layer; retry policy belongs to callers.
    async fn query_states(&self, unit_name: Option<&str>) -> Result<Vec<UnitState>>;

    /// Snapshot the definition body of an existing unit.
    async fn get_unit(&self, name: &str) -> Result<UnitFile>;

    /// Submit a unit definition under the given fully-qualified name.
    async fn submit_unit(&self, name: &str, unit_file: &UnitFile) -> Result<SubmitOutcome>;

    /// Retire a unit: set its desired state to inactive, then delete it.
    /// The stop step first gives systemd a chance to run its stop hooks.
    async fn retire_unit(&self, name: &str) -> Result<()>;
}

/// HTTP-backed scheduler client.
pub struct HttpFleetClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFleetClient {
    /// Create a client for `host` (`<hostname>:<port>`).
    pub fn new(host: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(FleetError::UnreachableScheduler)?;

        Ok(Self {
            client,
            base_url: format!("http://{}/fleet/v1", host.trim_end_matches('/')),
        })
    }

    fn unit_url(&self, name: &str) -> String {
        format!("{}/units/{}", self.base_url, name)
    }
}

#[async_trait]
impl SchedulerClient for HttpFleetClient {
    #[instrument(skip(self))]
    async fn query_states(&self, unit_name: Option<&str>) -> Result<Vec<UnitState>> {
        let mut request = self.client.get(format!("{}/state", self.base_url));
        if let Some(name) = unit_name {
            request = request.query(&[("unitName", name)]);
        }

        let response = request
            .send()
            .await
            .map_err(FleetError::UnreachableScheduler)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let listing: UnitStatesResponse = response
            .json()
            .await
            .map_err(FleetError::MalformedResponse)?;

        debug!(count = listing.states.len(), "Fetched unit states");

        Ok(listing.states)
    }

    #[instrument(skip(self))]
    async fn get_unit(&self, name: &str) -> Result<UnitFile> {
        let response = self
            .client
            .get(self.unit_url(name))
            .send()
            .await
            .map_err(FleetError::UnreachableScheduler)?;

        let status = response.status();
        if status.is_success() {
            // Keep the body untouched; it is resubmitted byte for byte.
            response
                .text()
                .await
                .map(UnitFile)
                .map_err(FleetError::MalformedResponse)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(FleetError::UnitNotFound(name.to_string()))
        } else {
            Err(FleetError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    #[instrument(skip(self, unit_file))]
    async fn submit_unit(&self, name: &str, unit_file: &UnitFile) -> Result<SubmitOutcome> {
        let response = self
            .client
            .put(self.unit_url(name))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(unit_file.0.clone())
            .send()
            .await
            .map_err(FleetError::UnreachableScheduler)?;

        let status = response.status();
        let outcome = if status == reqwest::StatusCode::CREATED {
            SubmitOutcome::Created
        } else if status == reqwest::StatusCode::NO_CONTENT {
            SubmitOutcome::Duplicate
        } else {
            SubmitOutcome::Rejected(status.as_u16())
        };

        debug!(unit = name, ?outcome, "Submitted unit definition");

        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn retire_unit(&self, name: &str) -> Result<()> {
        let url = self.unit_url(name);

        info!(unit = name, "Stopping unit");
        let response = self
            .client
            .put(&url)
            .json(&json!({ "desiredState": "inactive" }))
            .send()
            .await
            .map_err(FleetError::UnreachableScheduler)?;

        if !response.status().is_success() {
            return Err(FleetError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        info!(unit = name, "Destroying unit");
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(FleetError::UnreachableScheduler)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(FleetError::UnitNotFound(name.to_string()))
        } else {
            Err(FleetError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

//! Deployment orchestrator
//!
//! Per-unit state machine: allocate an instance number, submit the unit
//! definition with bounded retry, then wait for the new instance to
//! report healthy under a cancellable budget. A failed unit never aborts
//! the batch; the driver logs it and moves on.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::allocator::{AllocatorError, InstanceAllocator};
use crate::fleet_client::{SchedulerClient, SubmitOutcome};
use crate::registry::{Registry, RegistryError};
use crate::units::{decompose_unit_name, CanonicalUnit, UnitFile};

/// Deployment errors, all scoped to a single unit.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("instance allocation failed: {0}")]
    Allocation(#[from] AllocatorError),

    #[error("submission of {unit} failed after {attempts} attempts")]
    SubmissionFailed { unit: String, attempts: u32 },

    #[error("unit {unit} entered sub-state {sub_state}")]
    UnitFailed { unit: String, sub_state: String },

    #[error("timed out waiting for {unit} to become healthy: {report}")]
    ReadinessTimeout { unit: String, report: TimeoutReport },

    #[error("liveness watch for {unit} failed: {source}")]
    LivenessWatch {
        unit: String,
        #[source]
        source: RegistryError,
    },
}

/// Lifecycle of one deployment attempt. Transitions are one-directional;
/// `Healthy`, `TimedOut` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Submitted,
    Healthy,
    TimedOut,
    Failed,
}

/// Record of one unit's pass through the state machine.
#[derive(Debug)]
pub struct DeploymentAttempt {
    pub app_name: String,
    pub version: String,
    /// Issued instance id; `None` when allocation itself failed.
    pub instance_id: Option<String>,
    pub outcome: Outcome,
    pub failure: Option<DeployError>,
}

impl DeploymentAttempt {
    pub fn is_healthy(&self) -> bool {
        self.outcome == Outcome::Healthy
    }

    fn failed(unit: &CanonicalUnit, instance_id: Option<String>, error: DeployError) -> Self {
        let outcome = match &error {
            DeployError::ReadinessTimeout { .. } => Outcome::TimedOut,
            _ => Outcome::Failed,
        };
        Self {
            app_name: unit.app_name.clone(),
            version: unit.version.clone(),
            instance_id,
            outcome,
            failure: Some(error),
        }
    }
}

/// Diagnostic captured when the wait budget elapses.
#[derive(Debug)]
pub enum TimeoutReport {
    /// The unit was listed by the scheduler; these are its last states.
    LastKnownStates {
        active_state: String,
        load_state: String,
        sub_state: String,
    },
    /// The unit never appeared in the listing at all.
    NotListed {
        machine_count: usize,
        deployed_instances: usize,
        /// Every machine already runs an instance of this application;
        /// one must be destroyed before a new one can be deployed.
        capacity_exhausted: bool,
    },
}

impl fmt::Display for TimeoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReport::LastKnownStates {
                active_state,
                load_state,
                sub_state,
            } => write!(
                f,
                "last known states: active={active_state} load={load_state} sub={sub_state}"
            ),
            TimeoutReport::NotListed {
                machine_count,
                deployed_instances,
                capacity_exhausted,
            } => {
                write!(
                    f,
                    "not in scheduler listing ({deployed_instances} instances deployed across {machine_count} machines)"
                )?;
                if *capacity_exhausted {
                    write!(
                        f,
                        "; no free slot: at least one unit must be destroyed before a new one can be deployed"
                    )?;
                }
                Ok(())
            }
        }
    }
}

enum WaitVerdict {
    Healthy,
    UnitFailed { sub_state: String },
    TimedOut(TimeoutReport),
    WatchFailed(RegistryError),
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Total submission attempts before giving up on a unit.
    pub submit_attempts: u32,
    /// Fixed delay between submission attempts.
    pub submit_backoff: Duration,
    /// Overall readiness wait budget per unit.
    pub wait_budget: Duration,
    /// Interval of the sub-state poller.
    pub poll_interval: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            submit_attempts: 5,
            submit_backoff: Duration::from_secs(1),
            wait_budget: Duration::from_secs(600),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Deployment orchestrator
pub struct Deployer {
    fleet: Arc<dyn SchedulerClient>,
    registry: Arc<dyn Registry>,
    config: DeployerConfig,
}

impl Deployer {
    pub fn new(
        fleet: Arc<dyn SchedulerClient>,
        registry: Arc<dyn Registry>,
        config: DeployerConfig,
    ) -> Self {
        Self {
            fleet,
            registry,
            config,
        }
    }

    /// Run the full state machine for one selected unit.
    ///
    /// Always returns an attempt record; failures are captured in it
    /// rather than propagated, so the caller can continue the batch.
    #[instrument(skip(self, unit_file), fields(app = %unit.app_name, version = %unit.version))]
    pub async fn deploy(&self, unit: &CanonicalUnit, unit_file: &UnitFile) -> DeploymentAttempt {
        // Submitting: claim an instance number first. A lost CAS race is
        // retried exactly once from a fresh read.
        let allocator = InstanceAllocator::new(self.registry.as_ref());
        let allocation = match allocator.allocate(&unit.app_name).await {
            Ok(allocation) => allocation,
            Err(AllocatorError::ConcurrentAllocation { .. }) => {
                warn!(app = %unit.app_name, "Lost allocation race, retrying once");
                match allocator.allocate(&unit.app_name).await {
                    Ok(allocation) => allocation,
                    Err(e) => return DeploymentAttempt::failed(unit, None, e.into()),
                }
            }
            Err(e) => return DeploymentAttempt::failed(unit, None, e.into()),
        };

        let instance_id = allocation.instance_id();
        let unit_name = unit.instance_unit_name(&instance_id);

        info!(unit = %unit_name, "Deploying replacement instance");

        if let Err(e) = self.submit_with_retry(&unit_name, unit_file).await {
            return DeploymentAttempt::failed(unit, Some(instance_id), e);
        }

        // WaitingHealthy
        info!(
            unit = %unit_name,
            budget_secs = self.config.wait_budget.as_secs(),
            "Waiting for instance to come up"
        );

        match self.wait_healthy(unit, &instance_id).await {
            WaitVerdict::Healthy => {
                info!(unit = %unit_name, "Deployment successful");
                DeploymentAttempt {
                    app_name: unit.app_name.clone(),
                    version: unit.version.clone(),
                    instance_id: Some(instance_id),
                    outcome: Outcome::Healthy,
                    failure: None,
                }
            }
            WaitVerdict::UnitFailed { sub_state } => DeploymentAttempt::failed(
                unit,
                Some(instance_id),
                DeployError::UnitFailed {
                    unit: unit_name,
                    sub_state,
                },
            ),
            WaitVerdict::TimedOut(report) => DeploymentAttempt::failed(
                unit,
                Some(instance_id),
                DeployError::ReadinessTimeout {
                    unit: unit_name,
                    report,
                },
            ),
            WaitVerdict::WatchFailed(source) => DeploymentAttempt::failed(
                unit,
                Some(instance_id),
                DeployError::LivenessWatch {
                    unit: unit_name,
                    source,
                },
            ),
        }
    }

    /// Submit the unit definition, retrying on any non-created response
    /// with a fixed backoff. A duplicate-submission response is a
    /// distinct warning but still counts against the budget.
    async fn submit_with_retry(
        &self,
        unit_name: &str,
        unit_file: &UnitFile,
    ) -> Result<(), DeployError> {
        for attempt in 1..=self.config.submit_attempts {
            match self.fleet.submit_unit(unit_name, unit_file).await {
                Ok(SubmitOutcome::Created) => {
                    info!(unit = unit_name, attempt, "Scheduler accepted the unit file");
                    return Ok(());
                }
                Ok(SubmitOutcome::Duplicate) => {
                    warn!(
                        unit = unit_name,
                        attempt,
                        "Duplicate unit file submitted; likely a pre-existing unit file for this version"
                    );
                }
                Ok(SubmitOutcome::Rejected(status)) => {
                    warn!(unit = unit_name, attempt, status, "Scheduler rejected the unit file");
                }
                Err(e) => {
                    warn!(unit = unit_name, attempt, error = %e, "Error communicating with the scheduler");
                }
            }

            if attempt < self.config.submit_attempts {
                tokio::time::sleep(self.config.submit_backoff).await;
            }
        }

        Err(DeployError::SubmissionFailed {
            unit: unit_name.to_string(),
            attempts: self.config.submit_attempts,
        })
    }

    /// Cancellable timed wait for the instance to become healthy.
    ///
    /// A dedicated poller task publishes the latest observed sub-state
    /// through a watch channel (it is the only writer for this unit);
    /// the waiter resolves on the first of: failure sub-state, liveness
    /// key observed, or the wait budget elapsing. Dropping the receiver
    /// stops the poller.
    async fn wait_healthy(&self, unit: &CanonicalUnit, instance_id: &str) -> WaitVerdict {
        let (state_tx, mut state_rx) = watch::channel::<Option<String>>(None);

        let poller = {
            let fleet = Arc::clone(&self.fleet);
            let filter = unit.instance_filter(instance_id);
            let interval = self.config.poll_interval;

            tokio::spawn(async move {
                loop {
                    if state_tx.is_closed() {
                        break;
                    }
                    match fleet.query_states(Some(&filter)).await {
                        Ok(states) => {
                            if let Some(state) = states.into_iter().next() {
                                if state_tx.send(Some(state.sub_state)).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "Sub-state poll failed"),
                    }
                    tokio::time::sleep(interval).await;
                }
            })
        };

        let deadline = tokio::time::sleep(self.config.wait_budget);
        tokio::pin!(deadline);

        let liveness = self
            .registry
            .await_instance(&unit.app_name, &unit.version, instance_id);
        tokio::pin!(liveness);

        let mut last_sub_state: Option<String> = None;

        let verdict = loop {
            tokio::select! {
                _ = &mut deadline => {
                    let last = last_sub_state.take();
                    break WaitVerdict::TimedOut(self.timeout_report(unit, instance_id, last).await);
                }
                result = &mut liveness => {
                    match result {
                        Ok(()) => break WaitVerdict::Healthy,
                        Err(e) => break WaitVerdict::WatchFailed(e),
                    }
                }
                changed = state_rx.changed() => {
                    // The poller holds the sender for as long as this
                    // receiver is alive, so `changed` cannot fail here.
                    if changed.is_ok() {
                        if let Some(sub_state) = state_rx.borrow_and_update().clone() {
                            debug!(sub_state = %sub_state, "Observed unit sub-state");
                            if sub_state == "failed" {
                                break WaitVerdict::UnitFailed { sub_state };
                            }
                            last_sub_state = Some(sub_state);
                        }
                    }
                }
            }
        };

        // Closing the channel signals the poller to stop.
        drop(state_rx);
        poller.abort();

        verdict
    }

    /// Build the diagnostic dump for an elapsed wait budget.
    async fn timeout_report(
        &self,
        unit: &CanonicalUnit,
        instance_id: &str,
        last_sub_state: Option<String>,
    ) -> TimeoutReport {
        let filter = unit.instance_filter(instance_id);

        if let Ok(states) = self.fleet.query_states(Some(&filter)).await {
            if let Some(state) = states.into_iter().next() {
                return TimeoutReport::LastKnownStates {
                    active_state: state.active_state,
                    load_state: state.load_state,
                    sub_state: state.sub_state,
                };
            }
        }

        // The unit never showed up in the listing. Compare fleet
        // capacity against the instances already deployed for this
        // application to surface the "no free slot" condition.
        match self.fleet.query_states(None).await {
            Ok(all) => {
                let machine_count = all
                    .iter()
                    .map(|s| s.machine_id.as_str())
                    .collect::<HashSet<_>>()
                    .len();
                let deployed_instances = all
                    .iter()
                    .filter(|s| {
                        decompose_unit_name(&s.name)
                            .map(|u| u.app_name == unit.app_name)
                            .unwrap_or(false)
                    })
                    .count();

                TimeoutReport::NotListed {
                    machine_count,
                    deployed_instances,
                    capacity_exhausted: machine_count > 0 && machine_count == deployed_instances,
                }
            }
            Err(e) => {
                warn!(error = %e, last_sub_state = ?last_sub_state, "Could not gather timeout diagnostics");
                TimeoutReport::NotListed {
                    machine_count: 0,
                    deployed_instances: 0,
                    capacity_exhausted: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployer_config_default() {
        let config = DeployerConfig::default();
        assert_eq!(config.submit_attempts, 5);
        assert_eq!(config.submit_backoff, Duration::from_secs(1));
        assert_eq!(config.wait_budget, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_timeout_report_display_last_states() {
        let report = TimeoutReport::LastKnownStates {
            active_state: "activating".to_string(),
            load_state: "loaded".to_string(),
            sub_state: "start-pre".to_string(),
        };
        let text = report.to_string();
        assert!(text.contains("active=activating"));
        assert!(text.contains("sub=start-pre"));
    }

    #[test]
    fn test_timeout_report_display_capacity_exhausted() {
        let report = TimeoutReport::NotListed {
            machine_count: 3,
            deployed_instances: 3,
            capacity_exhausted: true,
        };
        let text = report.to_string();
        assert!(text.contains("3 instances deployed across 3 machines"));
        assert!(text.contains("no free slot"));
    }

    #[test]
    fn test_failed_attempt_outcome_mapping() {
        let unit = crate::units::decompose_unit_name("orders-api-1.4.2@10.service").unwrap();

        let timed_out = DeploymentAttempt::failed(
            &unit,
            Some("11".to_string()),
            DeployError::ReadinessTimeout {
                unit: "orders-api-1.4.2@11.service".to_string(),
                report: TimeoutReport::NotListed {
                    machine_count: 0,
                    deployed_instances: 0,
                    capacity_exhausted: false,
                },
            },
        );
        assert_eq!(timed_out.outcome, Outcome::TimedOut);
        assert!(!timed_out.is_healthy());

        let failed = DeploymentAttempt::failed(
            &unit,
            Some("11".to_string()),
            DeployError::SubmissionFailed {
                unit: "orders-api-1.4.2@11.service".to_string(),
                attempts: 5,
            },
        );
        assert_eq!(failed.outcome, Outcome::Failed);
    }
}

//! Rebalancer configuration
//!
//! Assembled from command line flags (with environment fallbacks) in
//! `main`; the driver and orchestrator only see this struct.

use std::time::Duration;

use crate::deployer::DeployerConfig;

/// Rebalancer configuration
#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    /// Scheduler host, `<hostname>:<port>`.
    pub fleet_host: String,

    /// Coordination store host, `<hostname>:<port>`.
    pub registry_host: String,

    /// Move units off this machine instead of the derived busiest one.
    pub machine_id: Option<String>,

    /// Readiness wait budget per unit in seconds.
    pub wait_budget_secs: u64,

    /// Total submission attempts per unit.
    pub submit_attempts: u32,

    /// Compute and report the plan without mutating anything.
    pub dry_run: bool,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            fleet_host: "localhost:49153".to_string(),
            registry_host: "localhost:4001".to_string(),
            machine_id: None,
            wait_budget_secs: 600,
            submit_attempts: 5,
            dry_run: false,
        }
    }
}

impl RebalancerConfig {
    /// Get the wait budget as a Duration
    pub fn wait_budget(&self) -> Duration {
        Duration::from_secs(self.wait_budget_secs)
    }

    /// Orchestrator configuration derived from this run's settings.
    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            submit_attempts: self.submit_attempts,
            wait_budget: self.wait_budget(),
            ..DeployerConfig::default()
        }
    }
}

//! Rebalance driver
//!
//! Top-level sequencing of one run: query state, compute the plan,
//! snapshot unit files for the retiring instances, then deploy and
//! retire strictly sequentially. A per-unit failure is logged and the
//! remaining units are still processed; only state collection and plan
//! computation abort the run.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::config::RebalancerConfig;
use crate::deployer::Deployer;
use crate::fleet_client::SchedulerClient;
use crate::planner::{Planner, RebalancePlan};
use crate::registry::Registry;
use crate::units::{decompose_unit_name, UnitFile};

/// Counters for one run, reported at exit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub planned: usize,
    pub deployed: usize,
    pub failed: usize,
    pub retired: usize,
    pub dry_run: bool,
}

impl RunSummary {
    /// A run succeeds when every planned unit deployed (dry-run and
    /// zero-move plans trivially succeed).
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn summary(&self) -> String {
        if self.dry_run {
            format!("dry run: {} units would move", self.planned)
        } else {
            format!(
                "{} planned, {} deployed, {} failed, {} retired",
                self.planned, self.deployed, self.failed, self.retired
            )
        }
    }
}

/// Rebalance driver
pub struct Driver {
    fleet: Arc<dyn SchedulerClient>,
    registry: Arc<dyn Registry>,
    config: RebalancerConfig,
}

impl Driver {
    pub fn new(
        fleet: Arc<dyn SchedulerClient>,
        registry: Arc<dyn Registry>,
        config: RebalancerConfig,
    ) -> Self {
        Self {
            fleet,
            registry,
            config,
        }
    }

    /// Execute one rebalance run.
    ///
    /// Every invocation starts from a fresh scheduler query; no state is
    /// retained across runs.
    #[instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<RunSummary> {
        let states = self.fleet.query_states(None).await?;
        let plan = Planner::new(self.config.machine_id.clone()).plan(&states)?;

        info!(summary = %plan.summary(), "Rebalance plan");

        let mut summary = RunSummary {
            planned: plan.units_to_redeploy.len(),
            dry_run: self.config.dry_run,
            ..RunSummary::default()
        };

        if self.config.dry_run {
            info!("Dry run mode, nothing will be mutated");
            return Ok(summary);
        }

        if plan.is_noop() {
            info!("Nothing to move");
            return Ok(summary);
        }

        // Snapshot the definition bodies up front: the redeploy reuses
        // the same body with only the instance identifier changed, and
        // the old unit is gone by the time its replacement is healthy.
        let unit_files = self.snapshot_unit_files(&plan).await;

        let deployer = Deployer::new(
            Arc::clone(&self.fleet),
            Arc::clone(&self.registry),
            self.config.deployer_config(),
        );

        let mut retired: HashSet<String> = HashSet::new();

        // Strictly sequential: no two deployments in flight at once, so
        // sibling destroys cannot race the instance-number allocator.
        for (index, unit) in plan.units_to_redeploy.iter().enumerate() {
            let unit_file = match &unit_files[index] {
                Some(file) => file,
                None => {
                    // Snapshot failure was already logged.
                    summary.failed += 1;
                    continue;
                }
            };

            let attempt = deployer.deploy(unit, unit_file).await;

            if !attempt.is_healthy() {
                summary.failed += 1;
                match &attempt.failure {
                    Some(e) => error!(
                        app = %attempt.app_name,
                        outcome = ?attempt.outcome,
                        error = %e,
                        "Unit deployment failed, continuing with the next unit"
                    ),
                    None => error!(app = %attempt.app_name, "Unit deployment failed"),
                }
                continue;
            }

            summary.deployed += 1;

            // Retire every old instance of the same application that
            // this run planned to move.
            for retire_name in &plan.units_to_retire {
                if retired.contains(retire_name) {
                    continue;
                }
                let same_app = decompose_unit_name(retire_name)
                    .map(|u| u.app_name == unit.app_name)
                    .unwrap_or(false);
                if !same_app {
                    continue;
                }

                match self.fleet.retire_unit(retire_name).await {
                    Ok(()) => {
                        info!(unit = %retire_name, "Old instance retired");
                        retired.insert(retire_name.clone());
                        summary.retired += 1;
                    }
                    Err(e) => {
                        warn!(unit = %retire_name, error = %e, "Failed to retire old instance");
                    }
                }
            }
        }

        info!(summary = %summary.summary(), "Rebalance run complete");

        Ok(summary)
    }

    /// Fetch the definition body for every unit marked for retirement.
    /// A failed snapshot disables that unit's redeploy but not the run.
    async fn snapshot_unit_files(&self, plan: &RebalancePlan) -> Vec<Option<UnitFile>> {
        let mut files = Vec::with_capacity(plan.units_to_retire.len());

        for name in &plan.units_to_retire {
            match self.fleet.get_unit(name).await {
                Ok(file) => files.push(Some(file)),
                Err(e) => {
                    error!(unit = %name, error = %e, "Could not snapshot unit file, skipping unit");
                    files.push(None);
                }
            }
        }

        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_summary_success() {
        let ok = RunSummary {
            planned: 3,
            deployed: 3,
            retired: 3,
            ..RunSummary::default()
        };
        assert!(ok.success());

        let partial = RunSummary {
            planned: 3,
            deployed: 2,
            failed: 1,
            retired: 2,
            ..RunSummary::default()
        };
        assert!(!partial.success());
    }

    #[test]
    fn test_run_summary_text() {
        let dry = RunSummary {
            planned: 2,
            dry_run: true,
            ..RunSummary::default()
        };
        assert_eq!(dry.summary(), "dry run: 2 units would move");

        let live = RunSummary {
            planned: 2,
            deployed: 1,
            failed: 1,
            retired: 1,
            dry_run: false,
        };
        assert!(live.summary().contains("1 failed"));
    }
}

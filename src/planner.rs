//! Rebalance planner
//!
//! Derives the target distribution from a unit-state listing: which
//! machine is the busiest, how many units it must shed to approach the
//! fleet average, and which concrete units will move.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::units::{select_candidates, CanonicalUnit, UnitState};

/// Planner errors
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("no machines observed in the unit listing")]
    NoMachines,

    #[error("machine {0} not present in the unit listing")]
    UnknownMachine(String),
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// The computed rebalance plan for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalancePlan {
    pub busiest_machine_id: String,
    pub total_unit_count: usize,
    pub machine_count: usize,
    pub units_on_busiest_machine: usize,
    pub move_count: usize,
    /// Canonicalized redeploy targets, parallel to `units_to_retire`.
    pub units_to_redeploy: Vec<CanonicalUnit>,
    /// Raw names of the old instances to retire once the replacement
    /// is healthy, parallel to `units_to_redeploy`.
    pub units_to_retire: Vec<String>,
}

impl RebalancePlan {
    pub fn is_noop(&self) -> bool {
        self.units_to_redeploy.is_empty()
    }

    /// Summary of the plan
    pub fn summary(&self) -> String {
        format!(
            "{} units on {} machines, {} on busiest machine {}, moving {} ({} selected)",
            self.total_unit_count,
            self.machine_count,
            self.units_on_busiest_machine,
            self.busiest_machine_id,
            self.move_count,
            self.units_to_redeploy.len()
        )
    }
}

/// Rebalance planner
pub struct Planner {
    /// Move units off this machine instead of the derived busiest one.
    machine_override: Option<String>,
}

impl Planner {
    pub fn new(machine_override: Option<String>) -> Self {
        Self { machine_override }
    }

    /// Compute the rebalance plan for a listing.
    ///
    /// Deterministic for a given listing: the busiest machine is the one
    /// with the strictly highest unit count, ties broken by the
    /// lexicographically smallest machine id.
    pub fn plan(&self, states: &[UnitState]) -> Result<RebalancePlan> {
        let mut per_machine: BTreeMap<&str, usize> = BTreeMap::new();
        for state in states {
            *per_machine.entry(state.machine_id.as_str()).or_default() += 1;
        }

        let machine_count = per_machine.len();
        if machine_count == 0 {
            return Err(PlanError::NoMachines);
        }

        let (busiest_machine_id, units_on_busiest) = match &self.machine_override {
            Some(id) => {
                let count = *per_machine
                    .get(id.as_str())
                    .ok_or_else(|| PlanError::UnknownMachine(id.clone()))?;
                (id.clone(), count)
            }
            // Highest count wins; on a tie the lexicographically
            // smallest machine id does.
            None => per_machine
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(id, count)| (id.to_string(), *count))
                .ok_or(PlanError::NoMachines)?,
        };

        let total_unit_count = states.len();
        let move_count = move_count(total_unit_count, machine_count, units_on_busiest);

        debug!(
            machine = %busiest_machine_id,
            on_machine = units_on_busiest,
            move_count,
            "Computed imbalance"
        );

        let (units_to_redeploy, units_to_retire) =
            select_candidates(states, &busiest_machine_id, move_count);

        let plan = RebalancePlan {
            busiest_machine_id,
            total_unit_count,
            machine_count,
            units_on_busiest_machine: units_on_busiest,
            move_count,
            units_to_redeploy,
            units_to_retire,
        };

        info!(summary = %plan.summary(), "Rebalance plan computed");

        Ok(plan)
    }
}

/// Units the busiest machine must shed to approach the fleet average:
/// `ceil(on_busiest - (total - machines) / machines)`, clamped to zero.
///
/// For non-negative operands the ceiling collapses to integer floor
/// division on the subtrahend.
fn move_count(total: usize, machines: usize, on_busiest: usize) -> usize {
    let average_rest = total.saturating_sub(machines) / machines;
    on_busiest.saturating_sub(average_rest)
}

//! Fleet Rebalancer Library
//!
//! Rebalances containerized unit instances across a scheduler-managed
//! fleet and performs a deploy-then-retire roll of the moved instances:
//! - Imbalance calculation (how many units the busiest machine sheds)
//! - Unit selection (versioned instance units only, never globals)
//! - Instance-number allocation via compare-and-swap in the store
//! - Deploy / wait-healthy / destroy state machine per moved unit

pub mod allocator;
pub mod config;
pub mod deployer;
pub mod driver;
pub mod fleet_client;
pub mod planner;
pub mod registry;
pub mod units;

// Re-export main types
pub use allocator::{AllocatorError, InstanceAllocation, InstanceAllocator};
pub use config::RebalancerConfig;
pub use deployer::{DeployError, Deployer, DeployerConfig, DeploymentAttempt, Outcome, TimeoutReport};
pub use driver::{Driver, RunSummary};
pub use fleet_client::{FleetError, HttpFleetClient, SchedulerClient, SubmitOutcome};
pub use planner::{PlanError, Planner, RebalancePlan};
pub use registry::{HttpRegistry, Registry, RegistryError};
pub use units::{CanonicalUnit, UnitFile, UnitState};

//! End-to-end rebalance scenarios over in-memory mock clients.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_rebalancer::allocator::{AllocatorError, InstanceAllocator};
use fleet_rebalancer::deployer::{DeployError, Deployer, DeployerConfig, Outcome, TimeoutReport};
use fleet_rebalancer::fleet_client::{SchedulerClient, SubmitOutcome};
use fleet_rebalancer::registry::Registry;
use fleet_rebalancer::units::{decompose_unit_name, UnitFile, UnitState};
use fleet_rebalancer::{Driver, RebalancerConfig};

/// Canned unit definition body. Key order is deliberately
/// non-alphabetical so any re-serialization of the body would show up
/// in the submission assertions.
const UNIT_BODY: &str =
    r#"{"options":[{"section":"Unit","name":"Description","value":"orders"}],"desiredState":"launched"}"#;

fn unit(name: &str, machine: &str) -> UnitState {
    UnitState {
        name: name.to_string(),
        machine_id: machine.to_string(),
        active_state: "active".to_string(),
        load_state: "loaded".to_string(),
        sub_state: "running".to_string(),
    }
}

/// Listing with 3 machines and unit counts {5, 3, 2}; the busiest
/// machine holds 5 versioned units.
fn three_machine_listing() -> Vec<UnitState> {
    let mut states = Vec::new();
    for i in 0..5 {
        states.push(unit(&format!("orders-api-1.4.2@{}.service", 10 + i), "m1"));
    }
    for i in 0..3 {
        states.push(unit(&format!("billing-2.0.0@{}.service", 10 + i), "m2"));
    }
    for i in 0..2 {
        states.push(unit(&format!("search-0.9.1@{}.service", 10 + i), "m3"));
    }
    states
}

// =============================================================================
// MOCK CLIENTS
// =============================================================================

#[derive(Clone, Copy)]
enum SubmitBehavior {
    AlwaysCreated,
    AlwaysDuplicate,
}

struct MockFleet {
    states: Vec<UnitState>,
    submit_behavior: SubmitBehavior,
    /// When true, a filtered state query for a freshly submitted unit
    /// reports it in sub-state `failed`.
    new_units_fail: bool,
    submits: Mutex<Vec<String>>,
    bodies: Mutex<Vec<String>>,
    retires: Mutex<Vec<String>>,
}

impl MockFleet {
    fn new(states: Vec<UnitState>, submit_behavior: SubmitBehavior) -> Self {
        Self {
            states,
            submit_behavior,
            new_units_fail: false,
            submits: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
            retires: Mutex::new(Vec::new()),
        }
    }

    fn failing_new_units(mut self) -> Self {
        self.new_units_fail = true;
        self
    }

    fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    fn submitted_bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    fn retired(&self) -> Vec<String> {
        self.retires.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerClient for MockFleet {
    async fn query_states(
        &self,
        unit_name: Option<&str>,
    ) -> fleet_rebalancer::fleet_client::Result<Vec<UnitState>> {
        match unit_name {
            None => Ok(self.states.clone()),
            Some(filter) => {
                let mut matched: Vec<UnitState> = self
                    .states
                    .iter()
                    .filter(|s| s.name.starts_with(filter))
                    .cloned()
                    .collect();

                if matched.is_empty() && self.new_units_fail {
                    let submits = self.submits.lock().unwrap();
                    if let Some(name) = submits.iter().find(|n| n.starts_with(filter)) {
                        matched.push(UnitState {
                            name: name.clone(),
                            machine_id: "m1".to_string(),
                            active_state: "failed".to_string(),
                            load_state: "loaded".to_string(),
                            sub_state: "failed".to_string(),
                        });
                    }
                }

                Ok(matched)
            }
        }
    }

    async fn get_unit(&self, _name: &str) -> fleet_rebalancer::fleet_client::Result<UnitFile> {
        Ok(UnitFile(UNIT_BODY.to_string()))
    }

    async fn submit_unit(
        &self,
        name: &str,
        unit_file: &UnitFile,
    ) -> fleet_rebalancer::fleet_client::Result<SubmitOutcome> {
        self.submits.lock().unwrap().push(name.to_string());
        self.bodies.lock().unwrap().push(unit_file.0.clone());
        match self.submit_behavior {
            SubmitBehavior::AlwaysCreated => Ok(SubmitOutcome::Created),
            SubmitBehavior::AlwaysDuplicate => Ok(SubmitOutcome::Duplicate),
        }
    }

    async fn retire_unit(&self, name: &str) -> fleet_rebalancer::fleet_client::Result<()> {
        self.retires.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

struct MockRegistry {
    counters: Mutex<HashMap<String, i64>>,
    /// When false the liveness key never appears and waits run out
    /// their budget.
    instances_come_up: bool,
    creates: Mutex<Vec<String>>,
}

impl MockRegistry {
    fn new(instances_come_up: bool) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            instances_come_up,
            creates: Mutex::new(Vec::new()),
        }
    }

    fn mutation_count(&self) -> usize {
        self.creates.lock().unwrap().len() + self.counters.lock().unwrap().len()
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get_counter(
        &self,
        app_name: &str,
    ) -> fleet_rebalancer::registry::Result<Option<i64>> {
        Ok(self.counters.lock().unwrap().get(app_name).copied())
    }

    async fn create_counter(
        &self,
        app_name: &str,
        value: i64,
    ) -> fleet_rebalancer::registry::Result<bool> {
        self.creates.lock().unwrap().push(app_name.to_string());
        let mut counters = self.counters.lock().unwrap();
        if counters.contains_key(app_name) {
            return Ok(false);
        }
        counters.insert(app_name.to_string(), value);
        Ok(true)
    }

    async fn cas_counter(
        &self,
        app_name: &str,
        new: i64,
        prev: i64,
    ) -> fleet_rebalancer::registry::Result<bool> {
        let mut counters = self.counters.lock().unwrap();
        match counters.get(app_name) {
            Some(current) if *current == prev => {
                counters.insert(app_name.to_string(), new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn await_instance(
        &self,
        _app_name: &str,
        _version: &str,
        _instance_id: &str,
    ) -> fleet_rebalancer::registry::Result<()> {
        if self.instances_come_up {
            return Ok(());
        }
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

fn config(dry_run: bool, wait_budget_secs: u64) -> RebalancerConfig {
    RebalancerConfig {
        dry_run,
        wait_budget_secs,
        ..RebalancerConfig::default()
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// Scenario A: 3 machines with counts {5, 3, 2}; the plan moves
/// ceil(5 - (10 - 3) / 3) = 3 units, and dry-run mutates nothing.
#[tokio::test]
async fn test_dry_run_plans_three_moves_and_mutates_nothing() {
    let fleet = Arc::new(MockFleet::new(
        three_machine_listing(),
        SubmitBehavior::AlwaysCreated,
    ));
    let registry = Arc::new(MockRegistry::new(true));

    let driver = Driver::new(fleet.clone(), registry.clone(), config(true, 600));
    let summary = driver.run().await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.planned, 3);
    assert_eq!(summary.deployed, 0);
    assert_eq!(summary.retired, 0);
    assert!(summary.success());

    assert_eq!(fleet.submit_count(), 0);
    assert!(fleet.retired().is_empty());
    assert_eq!(registry.mutation_count(), 0);
}

/// Healthy path: every replacement comes up, every old instance is
/// retired, and instance numbers come from the store counter.
#[tokio::test]
async fn test_full_run_deploys_and_retires() {
    let fleet = Arc::new(MockFleet::new(
        three_machine_listing(),
        SubmitBehavior::AlwaysCreated,
    ));
    let registry = Arc::new(MockRegistry::new(true));

    let driver = Driver::new(fleet.clone(), registry.clone(), config(false, 600));
    let summary = driver.run().await.unwrap();

    assert_eq!(summary.planned, 3);
    assert_eq!(summary.deployed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.retired, 3);
    assert!(summary.success());

    // All moved units are orders-api instances off the busiest machine;
    // the counter starts at 10 and increments per allocation.
    let submits = fleet.submits.lock().unwrap().clone();
    assert_eq!(
        submits,
        vec![
            "orders-api-1.4.2@10.service",
            "orders-api-1.4.2@11.service",
            "orders-api-1.4.2@12.service",
        ]
    );

    let retired = fleet.retired();
    assert_eq!(retired.len(), 3);
    assert!(retired.iter().all(|name| name.starts_with("orders-api-")));

    // The definition body passes through byte for byte, key order and all.
    let bodies = fleet.submitted_bodies();
    assert_eq!(bodies.len(), 3);
    assert!(bodies.iter().all(|body| body == UNIT_BODY));
}

/// Scenario B: a wait whose budget is 5 seconds and whose liveness key
/// never appears resolves as a timeout, and the old instance is NOT
/// retired.
#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_leaves_old_instance() {
    let mut states = vec![
        unit("orders-api-1.4.2@10.service", "m1"),
        unit("orders-api-1.4.2@11.service", "m1"),
    ];
    states.push(unit("billing-2.0.0@10.service", "m2"));

    let fleet = Arc::new(MockFleet::new(states, SubmitBehavior::AlwaysCreated));
    let registry = Arc::new(MockRegistry::new(false));

    let driver = Driver::new(fleet.clone(), registry.clone(), config(false, 5));
    let summary = driver.run().await.unwrap();

    assert_eq!(summary.deployed, 0);
    assert_eq!(summary.failed, summary.planned);
    assert_eq!(summary.retired, 0);
    assert!(!summary.success());
    assert!(fleet.retired().is_empty());
}

/// A replacement that lands in sub-state `failed` aborts the wait at
/// once instead of running out the budget, and nothing is retired.
#[tokio::test(start_paused = true)]
async fn test_failed_sub_state_aborts_wait() {
    let states = vec![
        unit("orders-api-1.4.2@20.service", "m1"),
        unit("billing-2.0.0@10.service", "m2"),
    ];
    let fleet = Arc::new(
        MockFleet::new(states, SubmitBehavior::AlwaysCreated).failing_new_units(),
    );
    let registry = Arc::new(MockRegistry::new(false));

    let deployer = Deployer::new(fleet.clone(), registry, DeployerConfig::default());
    let target = decompose_unit_name("orders-api-1.4.2@20.service").unwrap();

    let started = tokio::time::Instant::now();
    let attempt = deployer.deploy(&target, &UnitFile(UNIT_BODY.to_string())).await;

    assert_eq!(attempt.outcome, Outcome::Failed);
    assert!(matches!(
        attempt.failure,
        Some(DeployError::UnitFailed { ref sub_state, .. }) if sub_state == "failed"
    ));
    // Resolved on the first sub-state observation, nowhere near the
    // 600 second default budget.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(fleet.retired().is_empty());
}

/// A replacement that never shows up in the listing times out with the
/// no-free-slot diagnostic when every machine already runs an instance
/// of the application.
#[tokio::test(start_paused = true)]
async fn test_timeout_reports_exhausted_capacity() {
    let states = vec![
        unit("orders-api-1.4.2@20.service", "m1"),
        unit("orders-api-1.4.2@21.service", "m2"),
    ];
    let fleet = Arc::new(MockFleet::new(states, SubmitBehavior::AlwaysCreated));
    let registry = Arc::new(MockRegistry::new(false));

    let deployer = Deployer::new(
        fleet,
        registry,
        DeployerConfig {
            wait_budget: Duration::from_secs(5),
            ..DeployerConfig::default()
        },
    );
    let target = decompose_unit_name("orders-api-1.4.2@20.service").unwrap();

    let attempt = deployer.deploy(&target, &UnitFile(UNIT_BODY.to_string())).await;

    assert_eq!(attempt.outcome, Outcome::TimedOut);
    match attempt.failure {
        Some(DeployError::ReadinessTimeout {
            report:
                TimeoutReport::NotListed {
                    machine_count,
                    deployed_instances,
                    capacity_exhausted,
                },
            ..
        }) => {
            assert_eq!(machine_count, 2);
            assert_eq!(deployed_instances, 2);
            assert!(capacity_exhausted);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

/// Scenario C: a submission that reports a duplicate on every attempt
/// exhausts all 5 attempts, fails the unit, and never destroys anything.
#[tokio::test(start_paused = true)]
async fn test_duplicate_submission_exhausts_retries() {
    let states = vec![
        unit("orders-api-1.4.2@10.service", "m1"),
        unit("billing-2.0.0@10.service", "m2"),
    ];

    let fleet = Arc::new(MockFleet::new(states, SubmitBehavior::AlwaysDuplicate));
    let registry = Arc::new(MockRegistry::new(true));

    let driver = Driver::new(fleet.clone(), registry.clone(), config(false, 600));
    let summary = driver.run().await.unwrap();

    assert_eq!(summary.planned, 1);
    assert_eq!(summary.deployed, 0);
    assert_eq!(summary.failed, 1);
    assert!(!summary.success());

    // 5 attempts for the single planned unit, no destroy issued.
    assert_eq!(fleet.submit_count(), 5);
    assert!(fleet.retired().is_empty());
}

/// Registry whose reads are frozen at one snapshot value and whose CAS
/// accepts exactly one commit: the deterministic rendering of two
/// allocators racing on the same previous value.
struct RacingRegistry {
    cas_accepted: AtomicBool,
}

#[async_trait]
impl Registry for RacingRegistry {
    async fn get_counter(
        &self,
        _app_name: &str,
    ) -> fleet_rebalancer::registry::Result<Option<i64>> {
        Ok(Some(20))
    }

    async fn create_counter(
        &self,
        _app_name: &str,
        _value: i64,
    ) -> fleet_rebalancer::registry::Result<bool> {
        Ok(false)
    }

    async fn cas_counter(
        &self,
        _app_name: &str,
        _new: i64,
        _prev: i64,
    ) -> fleet_rebalancer::registry::Result<bool> {
        Ok(!self.cas_accepted.swap(true, Ordering::SeqCst))
    }

    async fn await_instance(
        &self,
        _app_name: &str,
        _version: &str,
        _instance_id: &str,
    ) -> fleet_rebalancer::registry::Result<()> {
        Ok(())
    }
}

/// Two allocations racing on the same previous value: exactly one
/// succeeds, the other surfaces the concurrent-allocation error.
#[tokio::test]
async fn test_allocation_race_has_exactly_one_winner() {
    let registry = RacingRegistry {
        cas_accepted: AtomicBool::new(false),
    };
    let allocator = InstanceAllocator::new(&registry);

    let first = allocator.allocate("orders-api").await;
    let second = allocator.allocate("orders-api").await;

    let winner = first.unwrap();
    assert_eq!(winner.previous_value, 20);
    assert_eq!(winner.issued_value, 21);

    assert!(matches!(
        second,
        Err(AllocatorError::ConcurrentAllocation { .. })
    ));
}

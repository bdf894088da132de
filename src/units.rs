//! Unit state model and candidate selection
//!
//! Decomposes scheduler-reported unit names of the form
//! `<appName>-<version>[-SNAPSHOT]@<instanceID>.service` and selects
//! the units to move off the busiest machine. Global units (no `@`
//! instance delimiter) run on every machine and are never candidates.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Snapshot of one unit as reported by the scheduler state endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UnitState {
    pub name: String,
    #[serde(rename = "machineID")]
    pub machine_id: String,
    #[serde(rename = "systemdActiveState", default)]
    pub active_state: String,
    #[serde(rename = "systemdLoadState", default)]
    pub load_state: String,
    #[serde(rename = "systemdSubState", default)]
    pub sub_state: String,
}

/// Wire envelope for the state listing.
#[derive(Debug, Default, Deserialize)]
pub struct UnitStatesResponse {
    #[serde(default)]
    pub states: Vec<UnitState>,
}

/// Opaque unit definition body.
///
/// The scheduler hands this back as a JSON document; the raw bytes are
/// kept untouched and resubmitted verbatim for the replacement instance.
/// Only the unit name (and with it the instance identifier) changes
/// between the old and the new submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile(pub String);

/// A versioned unit decomposed into its deployable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUnit {
    pub app_name: String,
    pub version: String,
    /// The raw scheduler unit name this was derived from.
    pub source_unit_name: String,
}

impl CanonicalUnit {
    /// Fully-qualified unit name for a given instance number,
    /// e.g. `orders-api-1.4.2@11.service`.
    pub fn instance_unit_name(&self, instance_id: &str) -> String {
        format!("{}-{}@{}.service", self.app_name, self.version, instance_id)
    }

    /// The `unitName` filter value the scheduler expects for one instance.
    pub fn instance_filter(&self, instance_id: &str) -> String {
        format!("{}-{}@{}", self.app_name, self.version, instance_id)
    }
}

fn unit_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<app>[A-Za-z][A-Za-z0-9_-]*?)-(?P<version>[0-9][A-Za-z0-9.]*(?:-SNAPSHOT)?)@(?P<instance>[0-9]+)\.service$",
        )
        .expect("unit name pattern compiles")
    })
}

/// Decompose a unit name into its canonical parts.
///
/// Returns `None` for global units (no instance delimiter) and for any
/// name that does not follow the `<app>-<version>@<instance>` shape.
pub fn decompose_unit_name(name: &str) -> Option<CanonicalUnit> {
    // Cheap reject before the regex: global units carry no instance id.
    if !name.contains('@') {
        return None;
    }

    let caps = unit_name_pattern().captures(name)?;
    Some(CanonicalUnit {
        app_name: caps["app"].to_string(),
        version: caps["version"].to_string(),
        source_unit_name: name.to_string(),
    })
}

/// Select up to `move_count` candidate units from `machine_id`, in the
/// scheduler-reported order.
///
/// Emits two parallel sequences: the canonicalized redeploy targets and
/// the raw unit names to retire. Fewer than `move_count` passing units is
/// not an error; the sequences are simply shorter.
pub fn select_candidates(
    states: &[UnitState],
    machine_id: &str,
    move_count: usize,
) -> (Vec<CanonicalUnit>, Vec<String>) {
    let mut redeploy = Vec::new();
    let mut retire = Vec::new();

    for state in states.iter().filter(|s| s.machine_id == machine_id) {
        if redeploy.len() >= move_count {
            break;
        }
        if let Some(unit) = decompose_unit_name(&state.name) {
            retire.push(state.name.clone());
            redeploy.push(unit);
        }
    }

    (redeploy, retire)
}

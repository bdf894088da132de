//! Instance number allocator
//!
//! Issues the next free instance number per application from the
//! coordination store. Numbers are two-digit by design: an absent
//! counter initializes to 10, and the sequence wraps back to 10 instead
//! of reaching 99. No lock is taken; the store's compare-and-swap is the
//! sole serialization point, so a lost race surfaces as an error the
//! caller may retry from a fresh read.

use thiserror::Error;
use tracing::{debug, info};

use crate::registry::{Registry, RegistryError};

/// First instance number ever issued, and the wrap target.
pub const INSTANCE_FLOOR: i64 = 10;
/// The sequence never reaches this value; `>= 99` wraps to the floor.
pub const INSTANCE_CEILING: i64 = 99;

/// Allocator errors
#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("concurrent allocation for {app_name}: another allocator won the race")]
    ConcurrentAllocation { app_name: String },

    #[error("store error: {0}")]
    Store(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

/// One successful claim of the "next instance number" counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAllocation {
    pub app_name: String,
    /// Counter value read before the commit; 0 if no counter existed.
    pub previous_value: i64,
    pub issued_value: i64,
}

impl InstanceAllocation {
    /// The instance id as it appears in unit names and store keys.
    pub fn instance_id(&self) -> String {
        self.issued_value.to_string()
    }
}

/// Instance number allocator over the coordination store.
pub struct InstanceAllocator<'r> {
    registry: &'r dyn Registry,
}

impl<'r> InstanceAllocator<'r> {
    pub fn new(registry: &'r dyn Registry) -> Self {
        Self { registry }
    }

    /// Allocate the next instance number for an application.
    ///
    /// Fails with `ConcurrentAllocation` when the compare-and-swap (or
    /// the create of an absent key) is rejected; the caller may retry
    /// the whole allocation from a fresh read.
    pub async fn allocate(&self, app_name: &str) -> Result<InstanceAllocation> {
        match self.registry.get_counter(app_name).await? {
            None => {
                debug!(app = app_name, "No instance counter, initializing");
                if !self
                    .registry
                    .create_counter(app_name, INSTANCE_FLOOR)
                    .await?
                {
                    return Err(AllocatorError::ConcurrentAllocation {
                        app_name: app_name.to_string(),
                    });
                }

                info!(app = app_name, issued = INSTANCE_FLOOR, "Initialized instance counter");

                Ok(InstanceAllocation {
                    app_name: app_name.to_string(),
                    previous_value: 0,
                    issued_value: INSTANCE_FLOOR,
                })
            }
            Some(current) => {
                let next = if current + 1 >= INSTANCE_CEILING {
                    INSTANCE_FLOOR
                } else {
                    current + 1
                };

                if !self.registry.cas_counter(app_name, next, current).await? {
                    return Err(AllocatorError::ConcurrentAllocation {
                        app_name: app_name.to_string(),
                    });
                }

                debug!(app = app_name, previous = current, issued = next, "Allocated instance number");

                Ok(InstanceAllocation {
                    app_name: app_name.to_string(),
                    previous_value: current,
                    issued_value: next,
                })
            }
        }
    }
}

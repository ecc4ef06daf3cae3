use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod simple;

/// Identifies a junction of the road network. Junction ids are the only identity that survives
/// between two partitioning passes, as the graph is rebuilt from them every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JunctionId(pub u64);

/// Mark JunctionId as enabled for the nohash_hasher::NoHashHasher
impl nohash_hasher::IsEnabled for JunctionId {}

impl Display for JunctionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepError {
    #[error("entity {entity} failed to step at {now}: {reason}")]
    Failed {
        entity: String,
        now: u32,
        reason: String,
    },
}

impl StepError {
    pub fn failed(entity: impl Into<String>, now: u32, reason: impl Into<String>) -> Self {
        StepError::Failed {
            entity: entity.into(),
            now,
            reason: reason.into(),
        }
    }
}

/// Everything the scheduler hands to a partition task. Implementors are owned by exactly one task
/// for the duration of a tick, so `step` may freely mutate the entity.
pub trait Steppable: Send {
    fn step(&mut self, now: u32) -> Result<(), StepError>;
}

pub trait Road: Steppable {
    fn from_junction(&self) -> JunctionId;
    fn to_junction(&self) -> JunctionId;
    fn vehicle_count(&self) -> u32;
    fn shadow_vehicle_count(&self) -> u32;
    fn future_routing_vehicle_count(&self) -> u32;
}

pub trait Zone: Steppable {
    /// Prospective demand of the zone. Drives both the bootstrap assignment and the demand weighted
    /// graph vertices.
    fn demand(&self) -> f64;
    fn is_hub(&self) -> bool;
    fn junction(&self) -> Option<JunctionId>;
}

pub trait ChargingStation: Steppable {
    fn num_chargers(&self) -> u32;
    /// Vehicles waiting for a free charger.
    fn queue_length(&self) -> u32;
}

pub trait Signal: Steppable {}

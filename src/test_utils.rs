use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::simulation::entities::{JunctionId, Road, StepError, Steppable, Zone};
use crate::simulation::network::{Junction, RoadNetwork};
use crate::simulation::scenario::Scenario;

/// Road which counts its steps into a shared counter, so that tests can check how often it was
/// stepped after the scenario was handed to the scheduler.
pub struct CountingRoad {
    from: JunctionId,
    to: JunctionId,
    vehicles: u32,
    steps: Arc<AtomicUsize>,
}

impl CountingRoad {
    pub fn new(from: u64, to: u64, vehicles: u32) -> (Self, Arc<AtomicUsize>) {
        let steps = Arc::new(AtomicUsize::new(0));
        let road = CountingRoad {
            from: JunctionId(from),
            to: JunctionId(to),
            vehicles,
            steps: steps.clone(),
        };
        (road, steps)
    }
}

impl Steppable for CountingRoad {
    fn step(&mut self, _now: u32) -> Result<(), StepError> {
        self.steps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Road for CountingRoad {
    fn from_junction(&self) -> JunctionId {
        self.from
    }

    fn to_junction(&self) -> JunctionId {
        self.to
    }

    fn vehicle_count(&self) -> u32 {
        self.vehicles
    }

    fn shadow_vehicle_count(&self) -> u32 {
        0
    }

    fn future_routing_vehicle_count(&self) -> u32 {
        0
    }
}

/// Road which fails from tick `fail_at` on. Panics instead of returning an error if `panic` is set.
pub struct FailingRoad {
    from: JunctionId,
    to: JunctionId,
    fail_at: u32,
    panic: bool,
}

impl FailingRoad {
    pub fn new(from: u64, to: u64, fail_at: u32) -> Self {
        FailingRoad {
            from: JunctionId(from),
            to: JunctionId(to),
            fail_at,
            panic: false,
        }
    }

    pub fn panicking(from: u64, to: u64, fail_at: u32) -> Self {
        FailingRoad {
            panic: true,
            ..FailingRoad::new(from, to, fail_at)
        }
    }
}

impl Steppable for FailingRoad {
    fn step(&mut self, now: u32) -> Result<(), StepError> {
        if now < self.fail_at {
            return Ok(());
        }
        if self.panic {
            panic!("road {} -> {} panicked at {now}", self.from, self.to);
        }
        Err(StepError::failed(
            format!("road {} -> {}", self.from, self.to),
            now,
            "broken",
        ))
    }
}

impl Road for FailingRoad {
    fn from_junction(&self) -> JunctionId {
        self.from
    }

    fn to_junction(&self) -> JunctionId {
        self.to
    }

    fn vehicle_count(&self) -> u32 {
        1
    }

    fn shadow_vehicle_count(&self) -> u32 {
        0
    }

    fn future_routing_vehicle_count(&self) -> u32 {
        0
    }
}

/// Zone which counts its steps.
pub struct CountingZone {
    demand: f64,
    steps: Arc<AtomicUsize>,
}

impl CountingZone {
    pub fn new(demand: f64) -> (Self, Arc<AtomicUsize>) {
        let steps = Arc::new(AtomicUsize::new(0));
        (
            CountingZone {
                demand,
                steps: steps.clone(),
            },
            steps,
        )
    }
}

impl Steppable for CountingZone {
    fn step(&mut self, _now: u32) -> Result<(), StepError> {
        self.steps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Zone for CountingZone {
    fn demand(&self) -> f64 {
        self.demand
    }

    fn is_hub(&self) -> bool {
        false
    }

    fn junction(&self) -> Option<JunctionId> {
        None
    }
}

/// Junctions 0..n on a line without any roads.
pub fn line_network(num_junctions: u64) -> RoadNetwork {
    let mut network = RoadNetwork::new();
    for id in 0..num_junctions {
        network.add_junction(Junction::new(JunctionId(id), id as f32 * 100., 0.));
    }
    network
}

/// Ring of `n` junctions where every road is a counting road. Returns the counters in road order.
pub fn counting_ring(n: u64, vehicles: u32) -> (Scenario, Vec<Arc<AtomicUsize>>) {
    let mut network = line_network(n);
    let mut counters = Vec::new();
    for id in 0..n {
        let (road, steps) = CountingRoad::new(id, (id + 1) % n, vehicles);
        network.add_road(Box::new(road));
        counters.push(steps);
    }
    (Scenario::new(network), counters)
}

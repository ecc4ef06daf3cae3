//! Small reference entities. They carry just enough state to produce changing traffic counts, so
//! that the adaptive partitioning has something to react to.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::simulation::entities::{
    ChargingStation, JunctionId, Road, Signal, StepError, Steppable, Zone,
};

#[derive(Debug)]
pub struct QueueRoad {
    pub from: JunctionId,
    pub to: JunctionId,
    vehicles: u32,
    shadow_vehicles: u32,
    future_routing_vehicles: u32,
    storage_capacity: u32,
    outflow_capacity: u32,
    max_arrivals: u32,
    rnd: StdRng,
}

impl QueueRoad {
    pub fn new(from: JunctionId, to: JunctionId, storage_capacity: u32, seed: u64) -> Self {
        QueueRoad {
            from,
            to,
            vehicles: 0,
            shadow_vehicles: 0,
            future_routing_vehicles: 0,
            storage_capacity,
            outflow_capacity: (storage_capacity / 4).max(1),
            max_arrivals: (storage_capacity / 3).max(1),
            rnd: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_vehicles(mut self, vehicles: u32) -> Self {
        self.vehicles = vehicles.min(self.storage_capacity);
        self
    }

    pub fn with_routing_counts(mut self, shadow: u32, future_routing: u32) -> Self {
        self.shadow_vehicles = shadow;
        self.future_routing_vehicles = future_routing;
        self
    }
}

impl Steppable for QueueRoad {
    fn step(&mut self, _now: u32) -> Result<(), StepError> {
        let released = self.vehicles.min(self.outflow_capacity);
        self.vehicles -= released;

        // vehicles announced as shadow vehicles in the last step enter now. The new shadow
        // vehicles are the next arrivals.
        let arrivals = self.shadow_vehicles;
        self.vehicles = (self.vehicles + arrivals).min(self.storage_capacity);
        self.shadow_vehicles = self.rnd.random_range(0..=self.max_arrivals);
        self.future_routing_vehicles = (self.future_routing_vehicles + released) / 2;
        Ok(())
    }
}

impl Road for QueueRoad {
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
        self.shadow_vehicles
    }

    fn future_routing_vehicle_count(&self) -> u32 {
        self.future_routing_vehicles
    }
}

#[derive(Debug)]
pub struct DemandZone {
    pub junction: Option<JunctionId>,
    demand: f64,
    hub: bool,
    waiting: f64,
    served: u64,
}

impl DemandZone {
    pub fn new(junction: Option<JunctionId>, demand: f64, hub: bool) -> Self {
        DemandZone {
            junction,
            demand,
            hub,
            waiting: 0.,
            served: 0,
        }
    }

    pub fn served(&self) -> u64 {
        self.served
    }
}

impl Steppable for DemandZone {
    fn step(&mut self, _now: u32) -> Result<(), StepError> {
        self.waiting += self.demand;
        let served = self.waiting.floor();
        self.waiting -= served;
        self.served += served as u64;
        Ok(())
    }
}

impl Zone for DemandZone {
    fn demand(&self) -> f64 {
        self.demand
    }

    fn is_hub(&self) -> bool {
        self.hub
    }

    fn junction(&self) -> Option<JunctionId> {
        self.junction
    }
}

#[derive(Debug)]
pub struct ChargerStation {
    chargers: u32,
    queue: u32,
    charged: u64,
}

impl ChargerStation {
    pub fn new(chargers: u32) -> Self {
        ChargerStation {
            chargers,
            queue: 0,
            charged: 0,
        }
    }

    pub fn enqueue(&mut self, vehicles: u32) {
        self.queue += vehicles;
    }

    pub fn charged(&self) -> u64 {
        self.charged
    }
}

impl Steppable for ChargerStation {
    fn step(&mut self, _now: u32) -> Result<(), StepError> {
        let charging = self.queue.min(self.chargers);
        self.queue -= charging;
        self.charged += charging as u64;
        Ok(())
    }
}

impl ChargingStation for ChargerStation {
    fn num_chargers(&self) -> u32 {
        self.chargers
    }

    fn queue_length(&self) -> u32 {
        self.queue
    }
}

#[derive(Debug)]
pub struct FixedTimeSignal {
    cycle: u32,
    green_time: u32,
    green: bool,
}

impl FixedTimeSignal {
    pub fn new(cycle: u32, green_time: u32) -> Self {
        FixedTimeSignal {
            cycle: cycle.max(1),
            green_time,
            green: true,
        }
    }

    pub fn is_green(&self) -> bool {
        self.green
    }
}

impl Steppable for FixedTimeSignal {
    fn step(&mut self, now: u32) -> Result<(), StepError> {
        self.green = now % self.cycle < self.green_time;
        Ok(())
    }
}

impl Signal for FixedTimeSignal {}

#[cfg(test)]
mod tests {
    use crate::simulation::entities::simple::{
        ChargerStation, DemandZone, FixedTimeSignal, QueueRoad,
    };
    use crate::simulation::entities::{JunctionId, Road, Steppable};

    #[test]
    fn queue_road_releases_and_stays_within_storage() {
        let mut road = QueueRoad::new(JunctionId(0), JunctionId(1), 20, 42).with_vehicles(20);
        assert_eq!(20, road.vehicle_count());

        for now in 0..100 {
            road.step(now).unwrap();
            assert!(road.vehicle_count() <= 20);
        }
    }

    #[test]
    fn queue_road_is_deterministic_for_a_seed() {
        let mut a = QueueRoad::new(JunctionId(0), JunctionId(1), 40, 7);
        let mut b = QueueRoad::new(JunctionId(0), JunctionId(1), 40, 7);
        for now in 0..10 {
            a.step(now).unwrap();
            b.step(now).unwrap();
        }
        assert_eq!(a.vehicle_count(), b.vehicle_count());
        assert_eq!(a.shadow_vehicle_count(), b.shadow_vehicle_count());
    }

    #[test]
    fn zone_serves_accumulated_demand() {
        let mut zone = DemandZone::new(None, 0.5, false);
        for now in 0..4 {
            zone.step(now).unwrap();
        }
        assert_eq!(2, zone.served());
    }

    #[test]
    fn charger_serves_at_most_its_capacity() {
        let mut station = ChargerStation::new(2);
        station.enqueue(5);
        station.step(0).unwrap();
        assert_eq!(2, station.charged());
        station.step(1).unwrap();
        station.step(2).unwrap();
        assert_eq!(5, station.charged());
    }

    #[test]
    fn signal_follows_cycle() {
        let mut signal = FixedTimeSignal::new(10, 4);
        signal.step(3).unwrap();
        assert!(signal.is_green());
        signal.step(4).unwrap();
        assert!(!signal.is_green());
        signal.step(10).unwrap();
        assert!(signal.is_green());
    }
}

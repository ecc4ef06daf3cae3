use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::simulation::config::GridScenario;
use crate::simulation::entities::simple::{ChargerStation, DemandZone, FixedTimeSignal, QueueRoad};
use crate::simulation::entities::{ChargingStation, JunctionId, Signal, Zone};
use crate::simulation::network::{Junction, RoadNetwork};

/// Grid spacing in meters
const GRID_SPACING: f32 = 100.;
const SIGNAL_CYCLE: u32 = 60;
/// Initial charger queues hold up to this many vehicles per charger
const CHARGER_QUEUE_FACTOR: u32 = 4;

/// Everything the scheduler steps: the road network and the entities living next to it.
#[derive(Default)]
pub struct Scenario {
    pub network: RoadNetwork,
    pub zones: Vec<Box<dyn Zone>>,
    pub charging_stations: Vec<Box<dyn ChargingStation>>,
    pub signals: Vec<Box<dyn Signal>>,
}

impl Scenario {
    pub fn new(network: RoadNetwork) -> Self {
        Scenario {
            network,
            ..Scenario::default()
        }
    }

    /// Synthetic city of `rows x columns` junctions connected by two way roads. Vehicle counts,
    /// zone demand and charger counts are drawn from a generator seeded with `config.seed`.
    pub fn grid(config: &GridScenario) -> Self {
        let mut rnd = StdRng::seed_from_u64(config.seed);
        let rows = config.rows as u64;
        let columns = config.columns as u64;
        let id = |r: u64, c: u64| JunctionId(r * columns + c);

        let mut network = RoadNetwork::new();
        for r in 0..rows {
            for c in 0..columns {
                network.add_junction(Junction::new(
                    id(r, c),
                    c as f32 * GRID_SPACING,
                    r as f32 * GRID_SPACING,
                ));
            }
        }

        let storage_capacity = config.max_vehicles_per_road.max(1) * 2;
        for r in 0..rows {
            for c in 0..columns {
                let mut neighbors = Vec::with_capacity(2);
                if c + 1 < columns {
                    neighbors.push(id(r, c + 1));
                }
                if r + 1 < rows {
                    neighbors.push(id(r + 1, c));
                }
                for neighbor in neighbors {
                    for (from, to) in [(id(r, c), neighbor), (neighbor, id(r, c))] {
                        let vehicles = rnd.random_range(0..=config.max_vehicles_per_road);
                        let road = QueueRoad::new(from, to, storage_capacity, rnd.random())
                            .with_vehicles(vehicles);
                        network.add_road(Box::new(road));
                    }
                }
            }
        }

        let num_junctions = rows * columns;
        let mut scenario = Scenario::new(network);
        if num_junctions > 0 {
            for i in 0..config.zones {
                let junction = JunctionId(rnd.random_range(0..num_junctions));
                let demand = rnd.random_range(0.1..5.0);
                scenario.zones.push(Box::new(DemandZone::new(
                    Some(junction),
                    demand,
                    i % 5 == 0,
                )));
            }
        }
        for _ in 0..config.charging_stations {
            let chargers = rnd.random_range(1..=8);
            let mut station = ChargerStation::new(chargers);
            station.enqueue(rnd.random_range(chargers..=CHARGER_QUEUE_FACTOR * chargers));
            scenario.charging_stations.push(Box::new(station));
        }
        for i in 0..config.signals {
            let green_time = SIGNAL_CYCLE / 2 + (i % 3) * 5;
            scenario
                .signals
                .push(Box::new(FixedTimeSignal::new(SIGNAL_CYCLE, green_time)));
        }

        info!(
            "Created grid scenario with {} junctions, {} roads, {} zones, {} charging stations and {} signals.",
            scenario.network.junctions.len(),
            scenario.network.roads.len(),
            scenario.zones.len(),
            scenario.charging_stations.len(),
            scenario.signals.len()
        );
        scenario
    }
}

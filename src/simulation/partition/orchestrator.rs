use tracing::{debug, info, instrument};

use crate::simulation::config::{
    BoundaryPolicy, Config, MetisOptions, PartitionMethod, Repartitioning,
};
use crate::simulation::network::RoadNetwork;
use crate::simulation::partition::converter::{GraphConverter, RoadClass, RoadPartitioning};
use crate::simulation::partition::graph::Weight;
use crate::simulation::partition::{partition, PartitionError};
use crate::simulation::scenario::Scenario;

/// Weight of a hub zone relative to an ordinary zone with the same demand.
const HUB_ZONE_FACTOR: f64 = 10.;

/// Assignment of the entities which are not part of the road graph. Computed once on bootstrap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackgroundAssignment {
    pub zones: Vec<Vec<usize>>,
    pub charging_stations: Vec<Vec<usize>>,
    pub signals: Vec<Vec<usize>>,
    pub loads: Vec<f64>,
}

impl BackgroundAssignment {
    fn empty(num_parts: usize) -> Self {
        BackgroundAssignment {
            zones: vec![Vec::new(); num_parts],
            charging_stations: vec![Vec::new(); num_parts],
            signals: vec![Vec::new(); num_parts],
            loads: vec![0.; num_parts],
        }
    }

    /// Greedy minimum load assignment. Each entity goes to the partition with the least
    /// accumulated weight of its entity type, ties to the lower partition.
    pub fn compute(scenario: &Scenario, num_parts: usize) -> Self {
        let mut result = BackgroundAssignment::empty(num_parts);

        let zone_weights = scenario.zones.iter().map(|z| {
            let factor = if z.is_hub() { HUB_ZONE_FACTOR } else { 1. };
            z.demand() * factor
        });
        result.zones = assign_min_load(zone_weights, &mut result.loads);

        let charger_weights = scenario
            .charging_stations
            .iter()
            .map(|c| c.num_chargers() as f64);
        result.charging_stations = assign_min_load(charger_weights, &mut result.loads);

        let signal_weights = scenario.signals.iter().map(|_| 1.);
        result.signals = assign_min_load(signal_weights, &mut result.loads);

        result
    }
}

fn assign_min_load(weights: impl Iterator<Item = f64>, loads: &mut [f64]) -> Vec<Vec<usize>> {
    let mut type_loads = vec![0.; loads.len()];
    let mut result = vec![Vec::new(); loads.len()];
    for (entity, weight) in weights.enumerate() {
        let mut target = 0;
        for p in 1..type_loads.len() {
            if type_loads[p] < type_loads[target] {
                target = p;
            }
        }
        type_loads[target] += weight;
        loads[target] += weight;
        result[target].push(entity);
    }
    result
}

/// The result of one partitioning pass. Replaced as a whole by the next pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionPlan {
    pub roads: RoadPartitioning,
    pub min_cut: Weight,
}

/// Owns the partitioning life cycle: bootstrap, the decision when to re-partition and the current
/// plan which the scheduler consumes every tick.
#[derive(Debug, Clone)]
pub struct PartitionState {
    num_parts: usize,
    method: PartitionMethod,
    repartitioning: Repartitioning,
    plan: PartitionPlan,
    background: BackgroundAssignment,
    partition_duration: u32,
    bootstrapped: bool,
    num_runs: usize,
}

impl PartitionState {
    pub fn new(num_parts: usize, method: PartitionMethod, repartitioning: Repartitioning) -> Self {
        let num_parts = num_parts.max(1);
        PartitionState {
            num_parts,
            method,
            repartitioning,
            plan: PartitionPlan::default(),
            background: BackgroundAssignment::empty(num_parts),
            partition_duration: 0,
            bootstrapped: false,
            num_runs: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let partitioning = config.partitioning();
        PartitionState::new(
            partitioning.num_parts as usize,
            partitioning.method,
            config.repartitioning(),
        )
    }

    /// Bootstraps on the first call. Afterwards, the trigger policy is consulted on every multiple
    /// of the refresh interval. Returns whether a partitioning pass ran.
    pub fn trigger_partition_if_due(
        &mut self,
        now: u32,
        scenario: &Scenario,
    ) -> Result<bool, PartitionError> {
        if !self.bootstrapped {
            self.first_run(scenario)?;
            return Ok(true);
        }
        if now % self.repartitioning.refresh_interval.max(1) == 0 {
            return self.check_run(scenario);
        }
        Ok(false)
    }

    /// Assigns zones, charging stations and signals and partitions the road graph with demand
    /// weighted vertices.
    #[instrument(level = "trace", skip_all)]
    pub fn first_run(&mut self, scenario: &Scenario) -> Result<(), PartitionError> {
        self.background = BackgroundAssignment::compute(scenario, self.num_parts);
        self.partition_roads(scenario, true)?;
        self.bootstrapped = true;
        Ok(())
    }

    /// Re-partitions the road graph with unit vertex weights and traffic dependent edge weights.
    #[instrument(level = "trace", skip_all)]
    pub fn run(&mut self, scenario: &Scenario) -> Result<(), PartitionError> {
        self.partition_roads(scenario, false)
    }

    /// Below the maximum refresh interval a pass only runs if the network carries at least the
    /// threshold of vehicles. Otherwise the elapsed duration grows by one refresh interval. Beyond
    /// the maximum the pass is forced.
    pub fn check_run(&mut self, scenario: &Scenario) -> Result<bool, PartitionError> {
        if self.partition_duration <= self.repartitioning.max_refresh_interval {
            let vehicles = scenario.network.total_vehicles();
            if vehicles >= self.repartitioning.vehicle_threshold {
                self.run(scenario)?;
                Ok(true)
            } else {
                self.partition_duration += self.repartitioning.refresh_interval;
                debug!(
                    "Skipped re-partitioning with {vehicles} vehicles. {} ticks since last pass.",
                    self.partition_duration
                );
                Ok(false)
            }
        } else {
            self.run(scenario)?;
            Ok(true)
        }
    }

    fn partition_roads(&mut self, scenario: &Scenario, weighted: bool) -> Result<(), PartitionError> {
        let plan = match &self.method {
            PartitionMethod::Metis(options) => {
                let converter = GraphConverter::from_options(options);
                let mut converted = converter.build_graph(&scenario.network, &scenario.zones, weighted);
                converted.graph = partition(
                    std::mem::take(&mut converted.graph),
                    self.num_parts,
                    options,
                    None,
                )?;
                let mut roads =
                    converter.project_back(&converted, self.num_parts, options.boundary_policy)?;
                rebalance(&mut roads, &self.background.loads, options);
                PartitionPlan {
                    roads,
                    min_cut: converted.graph.min_cut(),
                }
            }
            PartitionMethod::None => PartitionPlan {
                roads: round_robin(scenario.network.roads.len(), self.num_parts),
                min_cut: 0,
            },
        };

        self.plan = plan;
        self.partition_duration = self.repartitioning.refresh_interval;
        self.num_runs += 1;
        self.log_partition_stats(&scenario.network);
        Ok(())
    }

    fn log_partition_stats(&self, network: &RoadNetwork) {
        info!(
            "Partitioning pass {} finished with cut {}. Road loads: {:?}, background loads: {:?}",
            self.num_runs,
            self.plan.min_cut,
            self.plan.roads.loads,
            self.background.loads
        );
        for (p, roads) in self.plan.roads.execution_roads.iter().enumerate() {
            let (vehicles, shadow, future) = vehicle_totals(network, roads);
            debug!(
                "Partition {p}: {} roads, load {}, vehicles {vehicles}, shadow vehicles {shadow}, future routing vehicles {future}",
                roads.len(),
                self.plan.roads.loads[p],
            );
        }
        let (vehicles, shadow, future) = vehicle_totals(network, &self.plan.roads.boundary_roads);
        debug!(
            "Boundary: {} roads, vehicles {vehicles}, shadow vehicles {shadow}, future routing vehicles {future}",
            self.plan.roads.boundary_roads.len()
        );
    }

    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn background(&self) -> &BackgroundAssignment {
        &self.background
    }

    /// Roads stepped by the task of `partition`.
    pub fn interior_roads(&self, partition: usize) -> &[usize] {
        self.plan
            .roads
            .execution_roads
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn boundary_roads(&self) -> &[usize] {
        &self.plan.roads.boundary_roads
    }

    pub fn partition_loads(&self) -> &[Weight] {
        &self.plan.roads.loads
    }

    /// Boundary roads which are stepped by none of the partition tasks.
    pub fn serial_boundary_roads(&self) -> &[usize] {
        if self.boundary_policy() == BoundaryPolicy::SeparatePhase {
            self.boundary_roads()
        } else {
            &[]
        }
    }

    pub fn boundary_policy(&self) -> BoundaryPolicy {
        match &self.method {
            PartitionMethod::Metis(options) => options.boundary_policy,
            PartitionMethod::None => BoundaryPolicy::AssignToPartition,
        }
    }

    pub fn partition_duration(&self) -> u32 {
        self.partition_duration
    }

    pub fn num_runs(&self) -> usize {
        self.num_runs
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }
}

fn vehicle_totals(network: &RoadNetwork, roads: &[usize]) -> (u64, u64, u64) {
    roads.iter().fold((0, 0, 0), |(v, s, f), r| {
        let road = network.road(*r);
        (
            v + road.vehicle_count() as u64,
            s + road.shadow_vehicle_count() as u64,
            f + road.future_routing_vehicle_count() as u64,
        )
    })
}

/// Deals the roads round robin without looking at the network. No road is a boundary road.
fn round_robin(num_roads: usize, num_parts: usize) -> RoadPartitioning {
    let mut result = RoadPartitioning {
        execution_roads: vec![Vec::new(); num_parts],
        loads: vec![0; num_parts],
        road_weights: vec![1; num_roads],
        ..RoadPartitioning::default()
    };
    for road in 0..num_roads {
        let part = road % num_parts;
        result.execution_roads[part].push(road);
        result.loads[part] += 1;
        result.classes.push(RoadClass::Interior(part as u32));
    }
    result
}

/// Moves roads from the most loaded partition to partitions whose total load (roads plus
/// background) is below half of the average. Only partitions with more than
/// `rebalance_min_roads` roads give roads away. If the giving partition is dominated by
/// background load, all its roads move, otherwise the last half of its road list.
fn rebalance(roads: &mut RoadPartitioning, background: &[f64], options: &MetisOptions) {
    let num_parts = roads.num_parts();
    let total_load = |roads: &RoadPartitioning, p: usize| {
        roads.loads[p] as f64 + background.get(p).copied().unwrap_or(0.)
    };
    let total: f64 = (0..num_parts).map(|p| total_load(roads, p)).sum();
    let threshold = total / num_parts as f64 / 2.;

    for _ in 0..options.rebalance_iterations {
        let mut moved = false;
        for k in 0..num_parts {
            if total_load(roads, k) >= threshold {
                continue;
            }
            let donor = (0..num_parts)
                .filter(|j| {
                    *j != k && roads.execution_roads[*j].len() > options.rebalance_min_roads as usize
                })
                .max_by(|a, b| total_load(roads, *a).total_cmp(&total_load(roads, *b)));
            let Some(j) = donor else {
                continue;
            };

            let background_j = background.get(j).copied().unwrap_or(0.);
            let split = if background_j > roads.loads[j] as f64 / 2. {
                0
            } else {
                roads.execution_roads[j].len() / 2
            };
            let moving = roads.execution_roads[j].split_off(split);
            let weight: Weight = moving.iter().map(|r| roads.road_weights[*r]).sum();
            roads.loads[j] -= weight;
            roads.loads[k] += weight;
            for road in &moving {
                match &mut roads.classes[*road] {
                    RoadClass::Boundary { assigned, .. } => *assigned = k as u32,
                    RoadClass::Leftover(p) | RoadClass::Interior(p) => *p = k as u32,
                }
            }
            debug!(
                "Rebalancing moved {} roads with load {weight} from partition {j} to {k}",
                moving.len()
            );
            roads.execution_roads[k].extend(moving);
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use crate::simulation::config::{
        BoundaryPolicy, GridScenario, MetisOptions, PartitionMethod, Repartitioning,
    };
    use crate::simulation::entities::simple::{ChargerStation, DemandZone, QueueRoad};
    use crate::simulation::entities::JunctionId;
    use crate::simulation::network::{Junction, RoadNetwork};
    use crate::simulation::partition::converter::{RoadClass, RoadPartitioning};
    use crate::simulation::partition::orchestrator::{
        rebalance, BackgroundAssignment, PartitionState,
    };
    use crate::simulation::scenario::Scenario;

    fn ring(vehicles: u32) -> Scenario {
        let mut network = RoadNetwork::new();
        for id in 0..4 {
            network.add_junction(Junction::new(JunctionId(id), id as f32, 0.));
        }
        for id in 0..4 {
            network.add_road(Box::new(
                QueueRoad::new(JunctionId(id), JunctionId((id + 1) % 4), 100, id)
                    .with_vehicles(vehicles),
            ));
        }
        Scenario::new(network)
    }

    fn repartitioning(threshold: u64) -> Repartitioning {
        Repartitioning {
            refresh_interval: 10,
            max_refresh_interval: 50,
            vehicle_threshold: threshold,
        }
    }

    fn metis() -> PartitionMethod {
        PartitionMethod::Metis(MetisOptions::default())
    }

    fn grid() -> Scenario {
        Scenario::grid(&GridScenario {
            rows: 12,
            columns: 12,
            max_vehicles_per_road: 10,
            zones: 8,
            charging_stations: 4,
            signals: 10,
            seed: 4711,
        })
    }

    #[test]
    fn ring_is_split_in_halves() {
        let scenario = ring(5);
        let mut state = PartitionState::new(2, metis(), repartitioning(0));
        state.first_run(&scenario).unwrap();

        assert_eq!(2, state.boundary_roads().len());
        let interior = state
            .plan()
            .roads
            .classes
            .iter()
            .filter(|c| matches!(c, RoadClass::Interior(_)))
            .count();
        assert_eq!(2, interior);
        assert!(state
            .plan()
            .roads
            .classes
            .contains(&RoadClass::Interior(0)));
        assert!(state
            .plan()
            .roads
            .classes
            .contains(&RoadClass::Interior(1)));
        let stepped = state.interior_roads(0).len() + state.interior_roads(1).len();
        assert_eq!(4, stepped);
        assert_eq!(0, state.plan().roads.loads.iter().sum::<i64>() % 6);
    }

    #[test]
    fn check_run_below_threshold_only_increments_duration() {
        let scenario = ring(5);
        let mut state = PartitionState::new(2, metis(), repartitioning(1000));
        state.first_run(&scenario).unwrap();
        let plan = state.plan().clone();
        assert_eq!(10, state.partition_duration());

        assert!(!state.check_run(&scenario).unwrap());
        assert_eq!(20, state.partition_duration());
        assert_eq!(&plan, state.plan());
        assert_eq!(1, state.num_runs());
    }

    #[test]
    fn check_run_above_threshold_repartitions() {
        let scenario = ring(5);
        let mut state = PartitionState::new(2, metis(), repartitioning(20));
        state.first_run(&scenario).unwrap();
        assert!(state.check_run(&scenario).unwrap());
        assert_eq!(2, state.num_runs());
        assert_eq!(10, state.partition_duration());
    }

    #[test]
    fn check_run_is_forced_after_max_interval() {
        let scenario = ring(0);
        let mut state = PartitionState::new(2, metis(), repartitioning(1000));
        state.first_run(&scenario).unwrap();
        // 10 -> 20 -> 30 -> 40 -> 50 -> 60
        for _ in 0..5 {
            assert!(!state.check_run(&scenario).unwrap());
        }
        assert_eq!(60, state.partition_duration());
        assert!(state.check_run(&scenario).unwrap());
        assert_eq!(10, state.partition_duration());
    }

    #[test]
    fn trigger_bootstraps_first_and_then_follows_refresh_interval() {
        let scenario = ring(5);
        let mut state = PartitionState::new(2, metis(), repartitioning(0));
        assert!(state.trigger_partition_if_due(3, &scenario).unwrap());
        assert!(state.is_bootstrapped());
        assert!(!state.trigger_partition_if_due(4, &scenario).unwrap());
        assert!(state.trigger_partition_if_due(10, &scenario).unwrap());
        assert_eq!(2, state.num_runs());
    }

    #[test]
    fn every_road_is_stepped_exactly_once() {
        let scenario = grid();
        for policy in [BoundaryPolicy::AssignToPartition, BoundaryPolicy::SeparatePhase] {
            let method =
                PartitionMethod::Metis(MetisOptions::default().set_boundary_policy(policy));
            let mut state = PartitionState::new(4, method, repartitioning(0));
            state.first_run(&scenario).unwrap();

            let mut stepped = vec![0; scenario.network.roads.len()];
            for p in 0..4 {
                for road in state.interior_roads(p) {
                    stepped[*road] += 1;
                }
            }
            for road in state.serial_boundary_roads() {
                stepped[*road] += 1;
            }
            assert!(stepped.iter().all(|count| *count == 1), "{policy:?}");
        }
    }

    #[test]
    fn loads_match_road_weights() {
        let scenario = grid();
        let mut state = PartitionState::new(3, metis(), repartitioning(0));
        state.first_run(&scenario).unwrap();
        state.run(&scenario).unwrap();

        let roads = &state.plan().roads;
        for p in 0..3 {
            let expected: i64 = state
                .interior_roads(p)
                .iter()
                .map(|r| roads.road_weights[*r])
                .sum();
            assert_eq!(expected, state.partition_loads()[p]);
        }
    }

    #[test]
    fn more_partitions_than_junctions() {
        let scenario = ring(1);
        let mut state = PartitionState::new(8, metis(), repartitioning(0));
        state.first_run(&scenario).unwrap();
        let stepped: usize = (0..8).map(|p| state.interior_roads(p).len()).sum();
        assert_eq!(4, stepped);
        assert!((0..8).any(|p| state.interior_roads(p).is_empty()));
    }

    #[test]
    fn round_robin_without_graph() {
        let scenario = ring(1);
        let mut state = PartitionState::new(3, PartitionMethod::None, repartitioning(0));
        state.first_run(&scenario).unwrap();
        assert_eq!(&[0, 3], state.interior_roads(0));
        assert_eq!(&[1], state.interior_roads(1));
        assert_eq!(&[2], state.interior_roads(2));
        assert!(state.boundary_roads().is_empty());
        assert_eq!(&[2, 1, 1], state.partition_loads());
    }

    #[test]
    fn background_uses_minimum_load_per_type() {
        let mut scenario = ring(0);
        scenario.zones = vec![
            Box::new(DemandZone::new(None, 5., false)),
            Box::new(DemandZone::new(None, 1., true)),
            Box::new(DemandZone::new(None, 2., false)),
        ];
        scenario.charging_stations = vec![
            Box::new(ChargerStation::new(4)),
            Box::new(ChargerStation::new(1)),
        ];

        let background = BackgroundAssignment::compute(&scenario, 2);
        // zone 0 -> 0 (5), zone 1 -> 1 (10), zone 2 -> 0 (7)
        assert_eq!(vec![vec![0, 2], vec![1]], background.zones);
        // chargers are balanced independently of the zones
        assert_eq!(vec![vec![0], vec![1]], background.charging_stations);
        assert_approx_eq!(11., background.loads[0]);
        assert_approx_eq!(11., background.loads[1]);
    }

    #[test]
    fn rebalance_moves_last_half_to_starving_partition() {
        let mut roads = RoadPartitioning {
            execution_roads: vec![(0..20).collect(), vec![20]],
            boundary_roads: vec![],
            loads: vec![20, 1],
            road_weights: vec![1; 21],
            classes: vec![RoadClass::Interior(0); 21],
        };
        rebalance(&mut roads, &[0., 0.], &MetisOptions::default());

        assert_eq!((0..10).collect::<Vec<usize>>(), roads.execution_roads[0]);
        assert_eq!(11, roads.execution_roads[1].len());
        assert_eq!(vec![10, 11], roads.loads);
        // classes follow the partition which steps the road
        for (part, execution) in roads.execution_roads.iter().enumerate() {
            for road in execution {
                assert_eq!(RoadClass::Interior(part as u32), roads.classes[*road]);
            }
        }
    }

    #[test]
    fn rebalance_moves_everything_from_background_heavy_partition() {
        let mut roads = RoadPartitioning {
            execution_roads: vec![(0..12).collect(), vec![]],
            boundary_roads: vec![],
            loads: vec![12, 0],
            road_weights: vec![1; 12],
            classes: vec![RoadClass::Interior(0); 12],
        };
        rebalance(&mut roads, &[10., 0.], &MetisOptions::default());

        assert!(roads.execution_roads[0].is_empty());
        assert_eq!(12, roads.execution_roads[1].len());
        assert_eq!(vec![0, 12], roads.loads);
    }

    #[test]
    fn small_partitions_are_not_rebalanced() {
        let mut roads = RoadPartitioning {
            execution_roads: vec![(0..10).collect(), vec![]],
            boundary_roads: vec![],
            loads: vec![10, 0],
            road_weights: vec![1; 10],
            classes: vec![RoadClass::Interior(0); 10],
        };
        let before = roads.clone();
        rebalance(&mut roads, &[0., 0.], &MetisOptions::default());
        assert_eq!(before, roads);
    }
}

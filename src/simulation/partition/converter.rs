use tracing::{instrument, warn};

use crate::simulation::config::{BoundaryPolicy, MetisOptions};
use crate::simulation::entities::{Road, Zone};
use crate::simulation::network::RoadNetwork;
use crate::simulation::partition::graph::{MetisGraph, Weight};
use crate::simulation::partition::PartitionError;

/// A road which could be mapped onto an edge of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRoad {
    pub road: usize,
    pub from: usize,
    pub to: usize,
    pub weight: Weight,
}

/// Snapshot of the road network as weighted graph, together with the mapping from roads to edges.
#[derive(Debug, Clone, Default)]
pub struct ConvertedGraph {
    pub graph: MetisGraph,
    /// Resolved roads in the order they were encountered.
    pub resolved: Vec<ResolvedRoad>,
    /// Roads which are not part of the graph.
    pub leftover: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoadClass {
    /// Both end points in one partition. Holds the partition stepping the road, which differs from
    /// the end points' partition once rebalancing moved the road.
    Interior(u32),
    /// End points in different partitions. `assigned` is the partition stepping the road if
    /// boundary roads are folded into the partitions.
    Boundary { from: u32, to: u32, assigned: u32 },
    Leftover(u32),
}

/// The road level view of a partitioned graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoadPartitioning {
    /// Roads stepped by each partition task, in storage order.
    pub execution_roads: Vec<Vec<usize>>,
    pub boundary_roads: Vec<usize>,
    /// Accumulated weight of the execution roads per partition.
    pub loads: Vec<Weight>,
    /// Weight of each road, indexed by road.
    pub road_weights: Vec<Weight>,
    /// Classification of each road, indexed by road.
    pub classes: Vec<RoadClass>,
}

impl RoadPartitioning {
    fn new(num_parts: usize, num_roads: usize) -> Self {
        RoadPartitioning {
            execution_roads: vec![Vec::new(); num_parts],
            boundary_roads: Vec::new(),
            loads: vec![0; num_parts],
            road_weights: vec![0; num_roads],
            classes: vec![RoadClass::Leftover(0); num_roads],
        }
    }

    pub fn num_parts(&self) -> usize {
        self.execution_roads.len()
    }
}

/// Converts the road network into a [MetisGraph] and maps partitioned graphs back onto roads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphConverter {
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl GraphConverter {
    pub fn new(alpha: f64, beta: f64, gamma: f64) -> Self {
        GraphConverter { alpha, beta, gamma }
    }

    pub fn from_options(options: &MetisOptions) -> Self {
        GraphConverter::new(options.alpha, options.beta, options.gamma)
    }

    /// `1 + alpha * vehicles + beta * shadow vehicles + gamma * future routing vehicles`
    pub fn edge_weight(&self, road: &dyn Road) -> Weight {
        let load = self.alpha * road.vehicle_count() as f64
            + self.beta * road.shadow_vehicle_count() as f64
            + self.gamma * road.future_routing_vehicle_count() as f64;
        1 + load.max(0.).round() as Weight
    }

    /// Builds the graph: one vertex per junction and one edge per connection of the routing
    /// topology. A connection backed by a road gets the traffic dependent edge weight, which is
    /// also added (minus 1) to the vertex weight of the downstream junction. Connections without a
    /// road get weight 1. If `weighted` is set, vertices carry the demand of the zones located at
    /// their junction.
    #[instrument(level = "trace", skip_all, fields(weighted = weighted))]
    pub fn build_graph(
        &self,
        network: &RoadNetwork,
        zones: &[Box<dyn Zone>],
        weighted: bool,
    ) -> ConvertedGraph {
        let mut graph = MetisGraph::with_capacity(network.junctions.len());
        let mut demand = vec![0.; network.junctions.len()];
        if weighted {
            for zone in zones {
                if let Some(v) = zone.junction().and_then(|j| network.junction_index(j)) {
                    demand[v] += zone.demand();
                }
            }
        }
        for d in demand {
            graph.add_node(1 + (self.alpha * d).max(0.).round() as Weight);
        }

        let mut is_resolved = vec![false; network.roads.len()];
        let mut resolved = Vec::new();
        let mut num_edges = 0;
        for connection in &network.connections {
            let (Some(from), Some(to)) = (
                network.junction_index(connection.from),
                network.junction_index(connection.to),
            ) else {
                continue;
            };

            let road = network.find_road_between_junction_ids(connection.from, connection.to);
            let weight = match road {
                // the road is already part of the graph through another connection
                Some(road) if is_resolved[road] => continue,
                Some(road) => {
                    let weight = self.edge_weight(network.road(road));
                    is_resolved[road] = true;
                    resolved.push(ResolvedRoad {
                        road,
                        from,
                        to,
                        weight,
                    });
                    weight
                }
                None => 1,
            };

            if graph.add_edge(from, to, weight) {
                num_edges += 1;
            }
            for v in [from, to] {
                let node = graph.node_mut(v);
                node.add_edge_weight(weight);
                node.inc_num_edges();
            }
            let downstream = graph.node_mut(to);
            downstream.set_weight(downstream.weight() + weight - 1);
        }
        graph.set_num_edges(num_edges);

        let leftover: Vec<usize> = is_resolved
            .iter()
            .enumerate()
            .filter(|(_, resolved)| !**resolved)
            .map(|(road, _)| road)
            .collect();
        if !leftover.is_empty() {
            warn!(
                "{} roads could not be resolved against the graph and are distributed round robin.",
                leftover.len()
            );
        }

        ConvertedGraph {
            graph,
            resolved,
            leftover,
        }
    }

    /// Maps the partition of `converted.graph` onto the roads. Roads with both end points in one
    /// partition are interior to it. Boundary roads go to the candidate partition with the lower
    /// load at the time they are encountered (ties to the lower id) and are additionally listed as
    /// boundary roads. Leftover roads are dealt round robin with weight 1.
    #[instrument(level = "trace", skip_all, fields(num_parts = num_parts))]
    pub fn project_back(
        &self,
        converted: &ConvertedGraph,
        num_parts: usize,
        policy: BoundaryPolicy,
    ) -> Result<RoadPartitioning, PartitionError> {
        let num_parts = num_parts.max(1);
        let graph = &converted.graph;
        let num_roads = converted.resolved.len() + converted.leftover.len();
        let mut result = RoadPartitioning::new(num_parts, num_roads);

        let partition_of = |v: usize| -> Result<u32, PartitionError> {
            match graph.node(v).partition() {
                Some(p) if (p as usize) < num_parts => Ok(p),
                _ => Err(PartitionError::Unassigned {
                    level: 0,
                    vertex: v,
                }),
            }
        };

        for road in &converted.resolved {
            let from = partition_of(road.from)?;
            let to = partition_of(road.to)?;
            result.road_weights[road.road] = road.weight;

            if from == to {
                result.execution_roads[from as usize].push(road.road);
                result.loads[from as usize] += road.weight;
                result.classes[road.road] = RoadClass::Interior(from);
                continue;
            }

            let (low, high) = (from.min(to), from.max(to));
            let assigned = if result.loads[high as usize] < result.loads[low as usize] {
                high
            } else {
                low
            };
            result.boundary_roads.push(road.road);
            result.classes[road.road] = RoadClass::Boundary { from, to, assigned };
            if policy == BoundaryPolicy::AssignToPartition {
                result.execution_roads[assigned as usize].push(road.road);
                result.loads[assigned as usize] += road.weight;
            }
        }

        for (i, road) in converted.leftover.iter().enumerate() {
            let part = i % num_parts;
            result.execution_roads[part].push(*road);
            result.loads[part] += 1;
            result.road_weights[*road] = 1;
            result.classes[*road] = RoadClass::Leftover(part as u32);
        }

        for roads in result.execution_roads.iter_mut() {
            roads.sort_unstable();
        }
        result.boundary_roads.sort_unstable();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::config::BoundaryPolicy;
    use crate::simulation::entities::simple::{DemandZone, QueueRoad};
    use crate::simulation::entities::{JunctionId, Zone};
    use crate::simulation::network::{Junction, RoadNetwork};
    use crate::simulation::partition::converter::{GraphConverter, RoadClass};

    /// Ring A-B-C-D-A with 2 vehicles on every road.
    fn ring() -> RoadNetwork {
        let mut network = RoadNetwork::new();
        for id in 0..4 {
            network.add_junction(Junction::new(JunctionId(id), id as f32, 0.));
        }
        for id in 0..4 {
            network.add_road(Box::new(
                QueueRoad::new(JunctionId(id), JunctionId((id + 1) % 4), 10, id).with_vehicles(2),
            ));
        }
        network
    }

    #[test]
    fn edge_weight_formula() {
        let converter = GraphConverter::new(2., 3., 0.5);
        let road = QueueRoad::new(JunctionId(0), JunctionId(1), 100, 0)
            .with_vehicles(4)
            .with_routing_counts(2, 3);
        // 1 + 2 * 4 + 3 * 2 + 0.5 * 3 = 16.5
        assert_eq!(17, converter.edge_weight(&road));
    }

    #[test]
    fn build_ring() {
        let converter = GraphConverter::new(1., 0., 0.);
        let converted = converter.build_graph(&ring(), &[], false);
        let graph = &converted.graph;

        assert_eq!(4, graph.len());
        assert_eq!(4, graph.num_edges());
        assert_eq!(4, converted.resolved.len());
        assert!(converted.leftover.is_empty());
        for v in 0..4 {
            // each junction is downstream of exactly one road with weight 3
            assert_eq!(3, graph.node(v).weight());
            assert_eq!(6, graph.node(v).edge_weight());
            assert_eq!(2, graph.node(v).num_edges());
        }
    }

    #[test]
    fn opposing_roads_are_merged_into_one_edge() {
        let mut network = RoadNetwork::new();
        network.add_junction(Junction::new(JunctionId(1), 0., 0.));
        network.add_junction(Junction::new(JunctionId(2), 1., 0.));
        network.add_road(Box::new(QueueRoad::new(JunctionId(1), JunctionId(2), 10, 0)));
        network.add_road(Box::new(QueueRoad::new(JunctionId(2), JunctionId(1), 10, 0)));

        let converted = GraphConverter::new(1., 1., 1.).build_graph(&network, &[], false);
        assert_eq!(1, converted.graph.num_edges());
        assert_eq!(&[(1, 2)], converted.graph.neighbors(0));
        assert_eq!(2, converted.resolved.len());
    }

    #[test]
    fn unresolved_roads_are_leftover() {
        let mut network = ring();
        // a road between junctions unknown to the network
        let detached = network.add_road(Box::new(QueueRoad::new(
            JunctionId(10),
            JunctionId(11),
            10,
            0,
        )));
        // a road without topology connection
        let hidden = network.add_detached_road(Box::new(QueueRoad::new(
            JunctionId(0),
            JunctionId(2),
            10,
            0,
        )));
        // a topology connection without a road still becomes an edge
        network.add_connection(JunctionId(1), JunctionId(3));

        let converted = GraphConverter::new(1., 1., 1.).build_graph(&network, &[], false);
        assert_eq!(vec![detached, hidden], converted.leftover);
        assert_eq!(5, converted.graph.num_edges());
        assert_eq!(&(3, 1), converted.graph.neighbors(1).last().unwrap());
    }

    #[test]
    fn weighted_vertices_carry_zone_demand() {
        let network = ring();
        let zones: Vec<Box<dyn Zone>> = vec![
            Box::new(DemandZone::new(Some(JunctionId(1)), 2.4, false)),
            Box::new(DemandZone::new(Some(JunctionId(1)), 1.0, true)),
            Box::new(DemandZone::new(None, 100., false)),
        ];
        let converter = GraphConverter::new(1., 0., 0.);
        let weighted = converter.build_graph(&network, &zones, true);
        let unweighted = converter.build_graph(&network, &zones, false);

        // 1 + round(3.4) + road contribution of 2
        assert_eq!(6, weighted.graph.node(1).weight());
        assert_eq!(3, unweighted.graph.node(1).weight());
        assert_eq!(3, weighted.graph.node(0).weight());
    }

    #[test]
    fn project_ring_of_two_halves() {
        let converter = GraphConverter::new(1., 0., 0.);
        let mut converted = converter.build_graph(&ring(), &[], false);
        converted.graph.set_assignment(&[0, 0, 1, 1]);

        let result = converter
            .project_back(&converted, 2, BoundaryPolicy::AssignToPartition)
            .unwrap();

        // road 0: 0->1 and road 2: 2->3 are interior, road 1: 1->2 and road 3: 3->0 are boundary
        assert_eq!(RoadClass::Interior(0), result.classes[0]);
        assert_eq!(RoadClass::Interior(1), result.classes[2]);
        assert_eq!(vec![1, 3], result.boundary_roads);
        // road 1 goes to the still empty partition 1, road 3 to partition 0 which is lighter then
        assert_eq!(
            RoadClass::Boundary {
                from: 0,
                to: 1,
                assigned: 1
            },
            result.classes[1]
        );
        assert_eq!(
            RoadClass::Boundary {
                from: 1,
                to: 0,
                assigned: 0
            },
            result.classes[3]
        );
        assert_eq!(vec![vec![0, 3], vec![1, 2]], result.execution_roads);
        assert_eq!(vec![6, 6], result.loads);
    }

    #[test]
    fn separate_phase_keeps_boundary_roads_out_of_partitions() {
        let converter = GraphConverter::new(1., 0., 0.);
        let mut converted = converter.build_graph(&ring(), &[], false);
        converted.graph.set_assignment(&[0, 0, 1, 1]);

        let result = converter
            .project_back(&converted, 2, BoundaryPolicy::SeparatePhase)
            .unwrap();
        assert_eq!(vec![vec![0], vec![2]], result.execution_roads);
        assert_eq!(vec![1, 3], result.boundary_roads);
        assert_eq!(vec![3, 3], result.loads);
    }

    #[test]
    fn leftovers_are_dealt_round_robin() {
        let mut network = ring();
        for id in 10..13 {
            network.add_road(Box::new(QueueRoad::new(
                JunctionId(id),
                JunctionId(id + 1),
                10,
                0,
            )));
        }
        let converter = GraphConverter::new(1., 0., 0.);
        let mut converted = converter.build_graph(&network, &[], false);
        converted.graph.set_assignment(&[0, 0, 0, 0]);

        let result = converter
            .project_back(&converted, 2, BoundaryPolicy::AssignToPartition)
            .unwrap();
        assert_eq!(vec![vec![0, 1, 2, 3, 4, 6], vec![5]], result.execution_roads);
        assert_eq!(vec![12 + 2, 1], result.loads);
        assert_eq!(RoadClass::Leftover(1), result.classes[5]);
    }

    #[test]
    fn projection_is_idempotent() {
        let converter = GraphConverter::new(1., 1., 1.);
        let mut converted = converter.build_graph(&ring(), &[], false);
        converted.graph.set_assignment(&[0, 1, 1, 0]);
        let first = converter
            .project_back(&converted, 2, BoundaryPolicy::AssignToPartition)
            .unwrap();
        let second = converter
            .project_back(&converted, 2, BoundaryPolicy::AssignToPartition)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unpartitioned_graph_is_an_error() {
        let converter = GraphConverter::new(1., 1., 1.);
        let converted = converter.build_graph(&ring(), &[], false);
        assert!(converter
            .project_back(&converted, 2, BoundaryPolicy::AssignToPartition)
            .is_err());
    }
}

use ahash::HashMap;
use nohash_hasher::IntMap;

use crate::simulation::entities::{JunctionId, Road};

#[derive(Debug, Clone, PartialEq)]
pub struct Junction {
    pub id: JunctionId,
    pub x: f32,
    pub y: f32,
}

impl Junction {
    pub fn new(id: JunctionId, x: f32, y: f32) -> Self {
        Junction { id, x, y }
    }
}

/// A directed connection of the routing topology. Usually each connection is backed by a road, but
/// the topology may also contain connections the road layer doesn't know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub from: JunctionId,
    pub to: JunctionId,
}

/// The live road network. Roads are stored by index, which is the identity the partitioning hands
/// out to the scheduler.
#[derive(Default)]
pub struct RoadNetwork {
    pub junctions: Vec<Junction>,
    pub connections: Vec<Connection>,
    pub roads: Vec<Box<dyn Road>>,
    road_lookup: HashMap<(JunctionId, JunctionId), usize>,
    junction_lookup: IntMap<JunctionId, usize>,
}

impl RoadNetwork {
    pub fn new() -> Self {
        RoadNetwork::default()
    }

    pub fn add_junction(&mut self, junction: Junction) {
        assert!(
            !self.junction_lookup.contains_key(&junction.id),
            "Junction {} already exists.",
            junction.id
        );
        self.junction_lookup
            .insert(junction.id, self.junctions.len());
        self.junctions.push(junction);
    }

    /// Adds a road together with the topology connection it backs. Returns the index of the road.
    pub fn add_road(&mut self, road: Box<dyn Road>) -> usize {
        let from = road.from_junction();
        let to = road.to_junction();
        self.connections.push(Connection { from, to });
        self.add_detached_road(road)
    }

    /// Adds a road without a topology connection. Such a road can't be reached by the graph
    /// conversion and will end up as leftover road.
    pub fn add_detached_road(&mut self, road: Box<dyn Road>) -> usize {
        let index = self.roads.len();
        self.road_lookup
            .entry((road.from_junction(), road.to_junction()))
            .or_insert(index);
        self.roads.push(road);
        index
    }

    /// Adds a topology connection which is not backed by a road.
    pub fn add_connection(&mut self, from: JunctionId, to: JunctionId) {
        self.connections.push(Connection { from, to });
    }

    pub fn find_road_between_junction_ids(&self, from: JunctionId, to: JunctionId) -> Option<usize> {
        self.road_lookup.get(&(from, to)).copied()
    }

    pub fn junction_index(&self, id: JunctionId) -> Option<usize> {
        self.junction_lookup.get(&id).copied()
    }

    pub fn road(&self, index: usize) -> &dyn Road {
        self.roads[index].as_ref()
    }

    pub fn road_mut(&mut self, index: usize) -> &mut dyn Road {
        self.roads[index].as_mut()
    }

    pub fn total_vehicles(&self) -> u64 {
        self.roads.iter().map(|r| r.vehicle_count() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::entities::simple::QueueRoad;
    use crate::simulation::entities::JunctionId;
    use crate::simulation::network::{Junction, RoadNetwork};

    #[test]
    fn find_road_between_junctions() {
        let mut network = RoadNetwork::new();
        network.add_junction(Junction::new(JunctionId(1), 0., 0.));
        network.add_junction(Junction::new(JunctionId(2), 100., 0.));
        let road = network.add_road(Box::new(QueueRoad::new(
            JunctionId(1),
            JunctionId(2),
            10,
            0,
        )));

        assert_eq!(
            Some(road),
            network.find_road_between_junction_ids(JunctionId(1), JunctionId(2))
        );
        // roads are directed
        assert_eq!(
            None,
            network.find_road_between_junction_ids(JunctionId(2), JunctionId(1))
        );
        assert_eq!(1, network.connections.len());
        assert_eq!(Some(1), network.junction_index(JunctionId(2)));
    }

    #[test]
    fn detached_road_has_no_connection() {
        let mut network = RoadNetwork::new();
        network.add_detached_road(Box::new(
            QueueRoad::new(JunctionId(1), JunctionId(2), 10, 0).with_vehicles(3),
        ));
        assert!(network.connections.is_empty());
        assert_eq!(3, network.total_vehicles());
    }

    #[test]
    #[should_panic]
    fn duplicate_junction() {
        let mut network = RoadNetwork::new();
        network.add_junction(Junction::new(JunctionId(1), 0., 0.));
        network.add_junction(Junction::new(JunctionId(1), 0., 0.));
    }
}

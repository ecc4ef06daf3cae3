/// Vertex and edge weights. Signed, so that gains can be expressed in the same type.
pub type Weight = i64;

/// A vertex of a [MetisGraph]. Vertices live in an arena and are referenced by their index.
#[derive(Debug, Clone, PartialEq)]
pub struct MetisNode {
    id: usize,
    weight: Weight,
    edge_weight: Weight,
    num_edges: usize,
    partition: Option<u32>,
    // vertices of the next finer graph this vertex was merged from. Empty on the original graph.
    finer: Vec<usize>,
}

impl MetisNode {
    pub fn new(id: usize, weight: Weight) -> Self {
        MetisNode {
            id,
            weight,
            edge_weight: 0,
            num_edges: 0,
            partition: None,
            finer: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn weight(&self) -> Weight {
        self.weight
    }

    pub fn set_weight(&mut self, weight: Weight) {
        self.weight = weight;
    }

    /// Sum of the weights of all incident edges.
    pub fn edge_weight(&self) -> Weight {
        self.edge_weight
    }

    pub fn add_edge_weight(&mut self, weight: Weight) {
        self.edge_weight += weight;
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn inc_num_edges(&mut self) {
        self.num_edges += 1;
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    pub fn set_partition(&mut self, partition: u32) {
        self.partition = Some(partition);
    }

    pub fn finer(&self) -> &[usize] {
        &self.finer
    }
}

/// Undirected weighted graph at one coarsening level. Edges are stored symmetrically as adjacency
/// lists of (neighbor, weight).
#[derive(Debug, Clone, Default)]
pub struct MetisGraph {
    nodes: Vec<MetisNode>,
    adjacency: Vec<Vec<(usize, Weight)>>,
    num_edges: usize,
    min_cut: Weight,
    // vertex -> vertex of the next coarser graph. Empty as long as this graph wasn't coarsened.
    coarser: Vec<usize>,
}

impl MetisGraph {
    pub fn new() -> Self {
        MetisGraph::default()
    }

    pub fn with_capacity(vertices: usize) -> Self {
        MetisGraph {
            nodes: Vec::with_capacity(vertices),
            adjacency: Vec::with_capacity(vertices),
            ..MetisGraph::default()
        }
    }

    pub fn add_node(&mut self, weight: Weight) -> usize {
        let id = self.nodes.len();
        self.nodes.push(MetisNode::new(id, weight));
        self.adjacency.push(Vec::new());
        id
    }

    pub(crate) fn add_coarse_node(&mut self, weight: Weight, finer: Vec<usize>) -> usize {
        let id = self.add_node(weight);
        self.nodes[id].finer = finer;
        id
    }

    /// Adds the undirected edge a <-> b. If the edge already exists, the weight is added to the
    /// existing edge. Self loops are not stored. Returns true if a new edge was created.
    pub fn add_edge(&mut self, a: usize, b: usize, weight: Weight) -> bool {
        if a == b {
            return false;
        }
        if let Some(entry) = self.adjacency[a].iter_mut().find(|(n, _)| *n == b) {
            entry.1 += weight;
            let back = self.adjacency[b]
                .iter_mut()
                .find(|(n, _)| *n == a)
                .expect("Adjacency lists must be symmetric.");
            back.1 += weight;
            false
        } else {
            self.adjacency[a].push((b, weight));
            self.adjacency[b].push((a, weight));
            true
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: usize) -> &MetisNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: usize) -> &mut MetisNode {
        &mut self.nodes[id]
    }

    pub fn nodes(&self) -> &[MetisNode] {
        &self.nodes
    }

    pub fn neighbors(&self, id: usize) -> &[(usize, Weight)] {
        &self.adjacency[id]
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn set_num_edges(&mut self, num_edges: usize) {
        self.num_edges = num_edges;
    }

    pub fn min_cut(&self) -> Weight {
        self.min_cut
    }

    pub fn set_min_cut(&mut self, min_cut: Weight) {
        self.min_cut = min_cut;
    }

    pub fn coarser(&self) -> &[usize] {
        &self.coarser
    }

    pub(crate) fn set_coarser(&mut self, coarser: Vec<usize>) {
        debug_assert_eq!(coarser.len(), self.len());
        self.coarser = coarser;
    }

    pub fn total_vertex_weight(&self) -> Weight {
        self.nodes.iter().map(|n| n.weight).sum()
    }

    pub fn max_vertex_weight(&self) -> Weight {
        self.nodes.iter().map(|n| n.weight).max().unwrap_or(0)
    }

    /// Partition of every vertex, or None if at least one vertex is unassigned.
    pub fn assignment(&self) -> Option<Vec<u32>> {
        self.nodes.iter().map(|n| n.partition).collect()
    }

    pub fn set_assignment(&mut self, assignment: &[u32]) {
        for (node, part) in self.nodes.iter_mut().zip(assignment) {
            node.partition = Some(*part);
        }
    }

    /// Total weight of edges whose end points are in different partitions. Unassigned vertices
    /// count as partition 0.
    pub fn compute_edge_cut(&self) -> Weight {
        let mut cut = 0;
        for (v, neighbors) in self.adjacency.iter().enumerate() {
            let own = self.nodes[v].partition.unwrap_or(0);
            for (u, w) in neighbors {
                if *u > v && self.nodes[*u].partition.unwrap_or(0) != own {
                    cut += w;
                }
            }
        }
        cut
    }

    pub fn partition_weights(&self, num_parts: usize) -> Vec<Weight> {
        let mut result = vec![0; num_parts];
        for node in &self.nodes {
            if let Some(p) = node.partition {
                if let Some(w) = result.get_mut(p as usize) {
                    *w += node.weight;
                }
            }
        }
        result
    }

    /// Checks that every vertex carries a partition in [0, num_parts)
    pub fn verify(&self, num_parts: usize) -> bool {
        self.nodes
            .iter()
            .all(|n| matches!(n.partition, Some(p) if (p as usize) < num_parts))
    }

    /// Creates the subgraph induced by `vertices`. The vertex at position i of `vertices` becomes
    /// vertex i of the subgraph. Edges leaving the vertex set are dropped.
    pub fn induced_subgraph(&self, vertices: &[usize]) -> MetisGraph {
        let mut local = vec![usize::MAX; self.len()];
        let mut result = MetisGraph::with_capacity(vertices.len());
        for (i, v) in vertices.iter().enumerate() {
            local[*v] = i;
            result.add_node(self.nodes[*v].weight);
        }

        let mut num_edges = 0;
        for (i, v) in vertices.iter().enumerate() {
            for (u, w) in &self.adjacency[*v] {
                let j = local[*u];
                if j == usize::MAX {
                    continue;
                }
                result.adjacency[i].push((j, *w));
                result.nodes[i].edge_weight += w;
                result.nodes[i].num_edges += 1;
                if j > i {
                    num_edges += 1;
                }
            }
        }
        result.num_edges = num_edges;
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::simulation::partition::graph::MetisGraph;

    fn path(len: usize) -> MetisGraph {
        let mut graph = MetisGraph::new();
        for _ in 0..len {
            graph.add_node(1);
        }
        for i in 1..len {
            graph.add_edge(i - 1, i, i as i64);
        }
        graph
    }

    #[test]
    fn add_edge_is_symmetric_and_merges() {
        let mut graph = path(2);
        assert!(!graph.add_edge(1, 0, 4));
        assert_eq!(&[(1, 5)], graph.neighbors(0));
        assert_eq!(&[(0, 5)], graph.neighbors(1));
        assert!(!graph.add_edge(1, 1, 3));
        assert_eq!(1, graph.neighbors(1).len());
    }

    #[test]
    fn edge_cut_and_partition_weights() {
        let mut graph = path(4);
        graph.set_assignment(&[0, 0, 1, 1]);
        // only the edge 1-2 with weight 2 is cut
        assert_eq!(2, graph.compute_edge_cut());
        assert_eq!(vec![2, 2], graph.partition_weights(2));
        assert!(graph.verify(2));
        assert!(!graph.verify(1));
    }

    #[test]
    fn unassigned_graph_does_not_verify() {
        let graph = path(3);
        assert!(!graph.verify(4));
        assert_eq!(None, graph.assignment());
    }

    #[test]
    fn induced_subgraph_drops_outer_edges() {
        let graph = path(5);
        let sub = graph.induced_subgraph(&[1, 2, 4]);
        assert_eq!(3, sub.len());
        assert_eq!(1, sub.num_edges());
        assert_eq!(&[(1, 2)], sub.neighbors(0));
        assert!(sub.neighbors(2).is_empty());
        assert_eq!(2, sub.node(1).edge_weight());
    }
}

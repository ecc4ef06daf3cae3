use tracing::{instrument, trace};

use crate::simulation::partition::graph::{MetisGraph, Weight};

/// Coarsening stops once a level shrinks by less than this fraction.
const COARSEN_FRACTION: f64 = 0.9;

/// Stack of progressively coarser graphs. `graphs[0]` is the graph the hierarchy was built from,
/// the last graph is the coarsest one. Every graph but the last carries a map to its coarser
/// successor, every graph but the first has the `finer` back references on its nodes.
#[derive(Debug, Clone)]
pub struct CoarseningHierarchy {
    graphs: Vec<MetisGraph>,
}

impl CoarseningHierarchy {
    pub fn new(original: MetisGraph) -> Self {
        CoarseningHierarchy {
            graphs: vec![original],
        }
    }

    pub fn levels(&self) -> usize {
        self.graphs.len()
    }

    pub fn original(&self) -> &MetisGraph {
        &self.graphs[0]
    }

    pub fn coarsest(&self) -> &MetisGraph {
        self.graphs.last().expect("Hierarchy always holds the original graph.")
    }

    pub fn coarsest_mut(&mut self) -> &mut MetisGraph {
        self.graphs
            .last_mut()
            .expect("Hierarchy always holds the original graph.")
    }

    pub fn graphs(&self) -> &[MetisGraph] {
        &self.graphs
    }

    pub(crate) fn graphs_mut(&mut self) -> &mut [MetisGraph] {
        &mut self.graphs
    }

    pub fn into_original(mut self) -> MetisGraph {
        self.graphs.truncate(1);
        self.graphs.remove(0)
    }
}

/// Heavy edge matching coarsener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coarsener {
    target_size: usize,
    max_vertex_weight: Weight,
}

impl Coarsener {
    pub fn new(target_size: usize, max_vertex_weight: Weight) -> Self {
        Coarsener {
            target_size,
            max_vertex_weight,
        }
    }

    /// Derives target size and maximum vertex weight from the graph and the number of requested
    /// partitions. The coarsest graph should keep around `20 * num_parts` vertices so that it can
    /// still be bisected meaningfully.
    pub fn for_graph(graph: &MetisGraph, num_parts: usize) -> Self {
        let num_parts = num_parts.max(2);
        let by_size = graph.len() as f64 / (40. * (num_parts as f64).ln());
        let target_size = (by_size as usize).max(20 * num_parts);
        let max_vertex_weight =
            (1.5 * graph.total_vertex_weight() as f64 / target_size as f64).ceil() as Weight;
        Coarsener::new(target_size, max_vertex_weight.max(1))
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn max_vertex_weight(&self) -> Weight {
        self.max_vertex_weight
    }

    #[instrument(level = "trace", skip_all, fields(vertices = graph.len()))]
    pub fn coarsen(&self, graph: MetisGraph) -> CoarseningHierarchy {
        let mut hierarchy = CoarseningHierarchy::new(graph);

        while hierarchy.coarsest().len() > self.target_size {
            let fine = hierarchy.coarsest_mut();
            let Some((coarser, matching)) = self.coarsen_once(fine) else {
                trace!("No legal match left. Stop coarsening.");
                break;
            };
            let shrunk_enough =
                (coarser.len() as f64) <= COARSEN_FRACTION * fine.len() as f64;
            fine.set_coarser(matching);
            trace!(
                "Coarsened level {} from {} to {} vertices",
                hierarchy.levels(),
                hierarchy.coarsest().len(),
                coarser.len()
            );
            hierarchy.graphs.push(coarser);
            if !shrunk_enough {
                break;
            }
        }
        hierarchy
    }

    /// Computes a heavy edge matching and contracts it. Returns None if not a single pair could be
    /// matched.
    fn coarsen_once(&self, fine: &MetisGraph) -> Option<(MetisGraph, Vec<usize>)> {
        let (matches, num_pairs) = self.heavy_edge_matching(fine);
        if num_pairs == 0 {
            return None;
        }

        let mut coarse_of = vec![usize::MAX; fine.len()];
        let mut coarse = MetisGraph::with_capacity(fine.len() - num_pairs);
        for v in 0..fine.len() {
            if coarse_of[v] != usize::MAX {
                continue;
            }
            let mate = matches[v];
            let (weight, finer) = if mate == v {
                (fine.node(v).weight(), vec![v])
            } else {
                (
                    fine.node(v).weight() + fine.node(mate).weight(),
                    vec![v, mate],
                )
            };
            let id = coarse.add_coarse_node(weight, finer);
            coarse_of[v] = id;
            coarse_of[mate] = id;
        }

        for v in 0..fine.len() {
            for (u, w) in fine.neighbors(v) {
                // each undirected edge is stored twice, take it only once
                if *u > v {
                    coarse.add_edge(coarse_of[v], coarse_of[*u], *w);
                }
            }
        }

        let mut num_edges = 0;
        for v in 0..coarse.len() {
            let incident: Vec<Weight> = coarse.neighbors(v).iter().map(|(_, w)| *w).collect();
            num_edges += incident.len();
            let node = coarse.node_mut(v);
            for w in incident {
                node.add_edge_weight(w);
                node.inc_num_edges();
            }
        }
        coarse.set_num_edges(num_edges / 2);

        Some((coarse, coarse_of))
    }

    /// Visits vertices in id order and matches each unmatched vertex with the unmatched neighbor
    /// connected by the heaviest edge. Ties go to the lower neighbor id. Vertices without a legal
    /// partner are matched with themselves.
    fn heavy_edge_matching(&self, graph: &MetisGraph) -> (Vec<usize>, usize) {
        let mut matches = vec![usize::MAX; graph.len()];
        let mut num_pairs = 0;

        for v in 0..graph.len() {
            if matches[v] != usize::MAX {
                continue;
            }
            let v_weight = graph.node(v).weight();
            let mut best: Option<(usize, Weight)> = None;

            if v_weight <= self.max_vertex_weight {
                for (u, w) in graph.neighbors(v) {
                    if matches[*u] != usize::MAX {
                        continue;
                    }
                    let u_weight = graph.node(*u).weight();
                    if u_weight > self.max_vertex_weight
                        || v_weight + u_weight > self.max_vertex_weight
                    {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((b, bw)) => *w > bw || (*w == bw && *u < b),
                    };
                    if better {
                        best = Some((*u, *w));
                    }
                }
            }

            match best {
                Some((u, _)) => {
                    matches[v] = u;
                    matches[u] = v;
                    num_pairs += 1;
                }
                None => matches[v] = v,
            }
        }
        (matches, num_pairs)
    }
}

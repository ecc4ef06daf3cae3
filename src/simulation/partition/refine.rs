use tracing::{instrument, trace};

use crate::simulation::partition::coarsen::CoarseningHierarchy;
use crate::simulation::partition::graph::{MetisGraph, Weight};
use crate::simulation::partition::{target_fractions, PartitionError};

/// Projects the partition of the coarsest graph back onto the original graph and runs greedy k-way
/// boundary refinement on every level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KWayRefiner {
    passes: usize,
    imbalance_factor: f64,
}

impl KWayRefiner {
    pub fn new(passes: usize, imbalance_factor: f64) -> Self {
        KWayRefiner {
            passes,
            imbalance_factor,
        }
    }

    /// Expects the coarsest graph of the hierarchy to be partitioned. Afterwards, every level
    /// including the original graph carries a refined partition and the original graph's min cut
    /// is updated.
    #[instrument(level = "trace", skip_all, fields(levels = hierarchy.levels(), num_parts = num_parts))]
    pub fn refine(
        &self,
        hierarchy: &mut CoarseningHierarchy,
        num_parts: usize,
        fractions: Option<&[f64]>,
    ) -> Result<(), PartitionError> {
        let num_parts = num_parts.max(1);
        let fractions = target_fractions(num_parts, fractions)?;
        let graphs = hierarchy.graphs_mut();
        let coarsest = graphs.len() - 1;

        let mut parts = graphs[coarsest]
            .assignment()
            .ok_or_else(|| PartitionError::unassigned(&graphs[coarsest], coarsest))?;

        for level in (0..graphs.len()).rev() {
            if level < coarsest {
                let coarse = parts;
                parts = graphs[level].coarser().iter().map(|c| coarse[*c]).collect();
            }
            let moves = self.refine_level(&graphs[level], &mut parts, num_parts, &fractions);
            graphs[level].set_assignment(&parts);
            trace!("Refined level {level} with {moves} moves");
        }

        let original = &mut graphs[0];
        original.set_min_cut(original.compute_edge_cut());
        Ok(())
    }

    /// Runs balance and refinement passes until a pass moves nothing. Returns the number of moves.
    fn refine_level(
        &self,
        graph: &MetisGraph,
        parts: &mut [u32],
        num_parts: usize,
        fractions: &[f64],
    ) -> usize {
        let total = graph.total_vertex_weight() as f64;
        let max_weights: Vec<f64> = fractions
            .iter()
            .map(|f| f * total * self.imbalance_factor)
            .collect();
        let mut weights = vec![0 as Weight; num_parts];
        for (v, p) in parts.iter().enumerate() {
            weights[*p as usize] += graph.node(v).weight();
        }

        let mut connectivity = Connectivity::new(num_parts);
        let mut total_moves = 0;
        for _ in 0..self.passes {
            let moves = balance_pass(graph, parts, &mut weights, &max_weights, &mut connectivity)
                + refine_pass(graph, parts, &mut weights, &max_weights, &mut connectivity);
            total_moves += moves;
            if moves == 0 {
                break;
            }
        }
        total_moves
    }
}

/// Moves vertices out of partitions which exceed their maximum weight. Neighboring partitions are
/// preferred, isolated vertices go to the lightest partition.
fn balance_pass(
    graph: &MetisGraph,
    parts: &mut [u32],
    weights: &mut [Weight],
    max_weights: &[f64],
    connectivity: &mut Connectivity,
) -> usize {
    let mut moves = 0;
    for v in 0..graph.len() {
        let own = parts[v] as usize;
        if weights[own] as f64 <= max_weights[own] {
            continue;
        }
        let w = graph.node(v).weight();
        connectivity.compute(graph, parts, v);

        let current: &[Weight] = weights;
        let fits = |p: usize| p != own && (current[p] + w) as f64 <= max_weights[p];
        let target = connectivity
            .touched()
            .filter(|p| fits(*p))
            .max_by(|a, b| {
                connectivity
                    .get(*a)
                    .cmp(&connectivity.get(*b))
                    .then(current[*b].cmp(&current[*a]))
            })
            .or_else(|| (0..current.len()).filter(|p| fits(*p)).min_by_key(|p| current[*p]));

        if let Some(target) = target {
            parts[v] = target as u32;
            weights[own] -= w;
            weights[target] += w;
            moves += 1;
        }
    }
    moves
}

/// Greedy boundary refinement. A vertex moves to the neighboring partition with the highest cut
/// gain, provided the target stays within its maximum weight. Moves with zero gain are taken only
/// if they improve the balance.
fn refine_pass(
    graph: &MetisGraph,
    parts: &mut [u32],
    weights: &mut [Weight],
    max_weights: &[f64],
    connectivity: &mut Connectivity,
) -> usize {
    let mut moves = 0;
    for v in 0..graph.len() {
        let own = parts[v] as usize;
        if graph
            .neighbors(v)
            .iter()
            .all(|(u, _)| parts[*u] as usize == own)
        {
            continue;
        }
        let w = graph.node(v).weight();
        connectivity.compute(graph, parts, v);
        let internal = connectivity.get(own);

        let mut best: Option<(usize, Weight)> = None;
        for p in connectivity.touched().filter(|p| *p != own) {
            if (weights[p] + w) as f64 > max_weights[p] {
                continue;
            }
            let gain = connectivity.get(p) - internal;
            let acceptable = gain > 0 || (gain == 0 && weights[p] + w < weights[own]);
            if !acceptable {
                continue;
            }
            let better = match best {
                None => true,
                Some((b, bg)) => gain > bg || (gain == bg && weights[p] < weights[b]),
            };
            if better {
                best = Some((p, gain));
            }
        }

        if let Some((target, _)) = best {
            parts[v] = target as u32;
            weights[own] -= w;
            weights[target] += w;
            moves += 1;
        }
    }
    moves
}

/// Edge weight from one vertex into each partition. Reused between vertices, only touched entries
/// are reset.
struct Connectivity {
    weights: Vec<Weight>,
    touched: Vec<usize>,
}

impl Connectivity {
    fn new(num_parts: usize) -> Self {
        Connectivity {
            weights: vec![0; num_parts],
            touched: Vec::new(),
        }
    }

    fn compute(&mut self, graph: &MetisGraph, parts: &[u32], v: usize) {
        for p in self.touched.drain(..) {
            self.weights[p] = 0;
        }
        for (u, w) in graph.neighbors(v) {
            let p = parts[*u] as usize;
            if self.weights[p] == 0 && !self.touched.contains(&p) {
                self.touched.push(p);
            }
            self.weights[p] += w;
        }
    }

    fn get(&self, part: usize) -> Weight {
        self.weights[part]
    }

    fn touched(&self) -> impl Iterator<Item = usize> + '_ {
        self.touched.iter().copied()
    }
}

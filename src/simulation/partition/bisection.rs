use std::cmp::Reverse;

use keyed_priority_queue::KeyedPriorityQueue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{instrument, trace};

use crate::simulation::partition::graph::{MetisGraph, Weight};
use crate::simulation::partition::{target_fractions, PartitionError};

/// Number of greedy graph growing trials per bisection. The best trial wins.
const GROWING_TRIALS: usize = 4;

// gains are ordered by value, ties go to the lower vertex id
type Gain = (Weight, Reverse<usize>);

/// Initial partitioning by recursive bisection. Each bisection grows one half greedily from a
/// random start vertex and improves the cut with a bounded number of Fiduccia-Mattheyses passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PMetis {
    passes: usize,
    imbalance_factor: f64,
    seed: u64,
}

impl PMetis {
    pub fn new(passes: usize, imbalance_factor: f64, seed: u64) -> Self {
        PMetis {
            passes,
            imbalance_factor,
            seed,
        }
    }

    /// Assigns a partition in [0, num_parts) to every vertex of `graph`. If `fractions` is None,
    /// each partition aims for an equal share of the total vertex weight.
    #[instrument(level = "trace", skip_all, fields(vertices = graph.len(), num_parts = num_parts))]
    pub fn partition(
        &self,
        graph: &mut MetisGraph,
        num_parts: usize,
        fractions: Option<&[f64]>,
    ) -> Result<(), PartitionError> {
        let num_parts = num_parts.max(1);
        let fractions = target_fractions(num_parts, fractions)?;
        let mut assignment = vec![0; graph.len()];
        let mut rnd = StdRng::seed_from_u64(self.seed);

        let vertices: Vec<usize> = (0..graph.len()).collect();
        self.recursive_bisection(graph, vertices, &fractions, 0, &mut assignment, &mut rnd);

        graph.set_assignment(&assignment);
        graph.set_min_cut(graph.compute_edge_cut());
        trace!("Initial partitioning with cut {}", graph.min_cut());
        Ok(())
    }

    fn recursive_bisection(
        &self,
        graph: &MetisGraph,
        vertices: Vec<usize>,
        fractions: &[f64],
        first_part: u32,
        assignment: &mut [u32],
        rnd: &mut StdRng,
    ) {
        if vertices.is_empty() {
            return;
        }
        if fractions.len() == 1 {
            for v in vertices {
                assignment[v] = first_part;
            }
            return;
        }

        let num_left = fractions.len() / 2;
        let total: f64 = fractions.iter().sum();
        let left_fraction = fractions[..num_left].iter().sum::<f64>() / total;

        let sub = graph.induced_subgraph(&vertices);
        let sides = self.bisect(&sub, left_fraction, rnd);

        let (left, right): (Vec<_>, Vec<_>) = vertices
            .iter()
            .zip(sides.iter())
            .partition(|(_, side)| **side == 0);
        let left: Vec<usize> = left.into_iter().map(|(v, _)| *v).collect();
        let right: Vec<usize> = right.into_iter().map(|(v, _)| *v).collect();

        self.recursive_bisection(
            graph,
            left,
            &fractions[..num_left],
            first_part,
            assignment,
            rnd,
        );
        self.recursive_bisection(
            graph,
            right,
            &fractions[num_left..],
            first_part + num_left as u32,
            assignment,
            rnd,
        );
    }

    /// Splits the graph in two. Side 0 aims for `left_fraction` of the total vertex weight.
    pub(crate) fn bisect(&self, graph: &MetisGraph, left_fraction: f64, rnd: &mut StdRng) -> Vec<u8> {
        let n = graph.len();
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![if left_fraction >= 0.5 { 0 } else { 1 }];
        }

        let total = graph.total_vertex_weight() as f64;
        let target = [left_fraction * total, (1. - left_fraction) * total];
        let degrees = weighted_degrees(graph);

        let mut best: Option<(Vec<u8>, (Weight, Weight))> = None;
        for _ in 0..GROWING_TRIALS.min(n) {
            let start = rnd.random_range(0..n);
            let mut sides = grow(graph, &degrees, start, target[0], rnd);
            self.fm_refine(graph, &degrees, &mut sides, target);
            self.balance(graph, &degrees, &mut sides, target);

            let quality = (
                self.violation(&side_weights(graph, &sides), target),
                cut(graph, &sides),
            );
            if best.as_ref().map_or(true, |(_, q)| quality < *q) {
                best = Some((sides, quality));
            }
        }
        best.map(|(sides, _)| sides).unwrap_or_else(|| vec![0; n])
    }

    fn max_weights(&self, target: [f64; 2]) -> [f64; 2] {
        [
            target[0] * self.imbalance_factor,
            target[1] * self.imbalance_factor,
        ]
    }

    /// Weight by which the sides exceed their allowed maximum.
    fn violation(&self, weights: &[Weight; 2], target: [f64; 2]) -> Weight {
        let max = self.max_weights(target);
        (0..2)
            .map(|s| (weights[s] as f64 - max[s]).max(0.).ceil() as Weight)
            .sum()
    }

    /// Fiduccia-Mattheyses 2-way refinement. Each pass moves every boundary vertex at most once and
    /// rolls back to the best prefix of moves. Stops early if a pass brings no improvement.
    fn fm_refine(&self, graph: &MetisGraph, degrees: &[Weight], sides: &mut [u8], target: [f64; 2]) {
        let n = graph.len();
        let max = self.max_weights(target);
        let move_limit = (n / 4).clamp(15, 100);

        for _ in 0..self.passes {
            let mut weights = side_weights(graph, sides);
            let mut internal = vec![0 as Weight; n];
            for v in 0..n {
                internal[v] = graph
                    .neighbors(v)
                    .iter()
                    .filter(|(u, _)| sides[*u] == sides[v])
                    .map(|(_, w)| *w)
                    .sum();
            }

            let mut queues: [KeyedPriorityQueue<usize, Gain>; 2] =
                [KeyedPriorityQueue::new(), KeyedPriorityQueue::new()];
            for v in 0..n {
                let external = degrees[v] - internal[v];
                if external > 0 {
                    queues[sides[v] as usize].push(v, (external - internal[v], Reverse(v)));
                }
            }

            let mut locked = vec![false; n];
            let mut moves = Vec::new();
            let mut current = (self.violation(&weights, target), cut(graph, sides));
            let mut best = current;
            let mut best_len = 0;

            loop {
                let heavier = if weights[0] as f64 / target[0].max(1.)
                    >= weights[1] as f64 / target[1].max(1.)
                {
                    0
                } else {
                    1
                };
                let from = if queues[heavier].is_empty() {
                    1 - heavier
                } else {
                    heavier
                };
                let Some((v, (gain, _))) = queues[from].pop() else {
                    break;
                };
                let to = 1 - from;
                let w = graph.node(v).weight();
                locked[v] = true;
                if (weights[to] + w) as f64 > max[to] && weights[to] + w > weights[from] {
                    continue;
                }

                sides[v] = to as u8;
                weights[from] -= w;
                weights[to] += w;
                internal[v] = degrees[v] - internal[v];
                moves.push(v);
                current = (self.violation(&weights, target), current.1 - gain);

                if current < best {
                    best = current;
                    best_len = moves.len();
                } else if moves.len() - best_len > move_limit {
                    break;
                }

                for (u, ew) in graph.neighbors(v) {
                    let u = *u;
                    if sides[u] as usize == to {
                        internal[u] += ew;
                    } else {
                        internal[u] -= ew;
                    }
                    if locked[u] {
                        continue;
                    }
                    let queue = &mut queues[sides[u] as usize];
                    let external = degrees[u] - internal[u];
                    if external > 0 {
                        queue.push(u, (external - internal[u], Reverse(u)));
                    } else {
                        queue.remove(&u);
                    }
                }
            }

            for v in moves[best_len..].iter().rev() {
                sides[*v] = 1 - sides[*v];
            }
            if best_len == 0 {
                break;
            }
        }
    }

    /// Moves vertices off an overweight side as long as this reduces the violation of the balance
    /// bound. Boundary vertices with the best gain go first.
    fn balance(&self, graph: &MetisGraph, degrees: &[Weight], sides: &mut [u8], target: [f64; 2]) {
        let mut weights = side_weights(graph, sides);
        loop {
            let violation = self.violation(&weights, target);
            if violation == 0 {
                return;
            }
            let max = self.max_weights(target);
            let from = if weights[0] as f64 - max[0] > weights[1] as f64 - max[1] {
                0
            } else {
                1
            };
            let to = 1 - from;

            let mut candidate: Option<(usize, Gain)> = None;
            for v in (0..graph.len()).filter(|v| sides[*v] as usize == from) {
                let w = graph.node(v).weight();
                let mut moved = weights;
                moved[from] -= w;
                moved[to] += w;
                if self.violation(&moved, target) >= violation {
                    continue;
                }
                let external: Weight = graph
                    .neighbors(v)
                    .iter()
                    .filter(|(u, _)| sides[*u] as usize == to)
                    .map(|(_, w)| *w)
                    .sum();
                let gain = (2 * external - degrees[v], Reverse(v));
                if candidate.map_or(true, |(_, g)| gain > g) {
                    candidate = Some((v, gain));
                }
            }

            let Some((v, _)) = candidate else {
                return;
            };
            let w = graph.node(v).weight();
            sides[v] = to as u8;
            weights[from] -= w;
            weights[to] += w;
        }
    }
}

/// Greedy graph growing. Starting from `start`, moves the vertex with the highest gain from side 1
/// to side 0 until side 0 reaches its target weight.
fn grow(
    graph: &MetisGraph,
    degrees: &[Weight],
    start: usize,
    target: f64,
    rnd: &mut StdRng,
) -> Vec<u8> {
    let n = graph.len();
    let mut sides = vec![1u8; n];
    let mut connected = vec![0 as Weight; n];
    let mut queue: KeyedPriorityQueue<usize, Gain> = KeyedPriorityQueue::new();
    let mut weight: Weight = 0;
    queue.push(start, (-degrees[start], Reverse(start)));

    while (weight as f64) < target {
        let v = match queue.pop() {
            Some((v, _)) => v,
            // the grown region is a whole component. Continue somewhere else.
            None => {
                let offset = rnd.random_range(0..n);
                match (0..n).map(|i| (i + offset) % n).find(|v| sides[*v] == 1) {
                    Some(v) => v,
                    None => break,
                }
            }
        };

        let w = graph.node(v).weight();
        let overshoot = (weight + w) as f64 - target;
        if weight > 0 && overshoot > target - weight as f64 {
            break;
        }
        sides[v] = 0;
        weight += w;

        for (u, ew) in graph.neighbors(v) {
            if sides[*u] == 1 {
                connected[*u] += ew;
                queue.push(*u, (2 * connected[*u] - degrees[*u], Reverse(*u)));
            }
        }
    }
    sides
}

fn weighted_degrees(graph: &MetisGraph) -> Vec<Weight> {
    (0..graph.len())
        .map(|v| graph.neighbors(v).iter().map(|(_, w)| *w).sum())
        .collect()
}

fn side_weights(graph: &MetisGraph, sides: &[u8]) -> [Weight; 2] {
    let mut weights = [0; 2];
    for (v, side) in sides.iter().enumerate() {
        weights[*side as usize] += graph.node(v).weight();
    }
    weights
}

fn cut(graph: &MetisGraph, sides: &[u8]) -> Weight {
    let mut cut = 0;
    for v in 0..graph.len() {
        for (u, w) in graph.neighbors(v) {
            if *u > v && sides[*u] != sides[v] {
                cut += w;
            }
        }
    }
    cut
}

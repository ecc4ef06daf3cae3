use thiserror::Error;
use tracing::{info, instrument};

use crate::simulation::config::MetisOptions;
use crate::simulation::partition::bisection::PMetis;
use crate::simulation::partition::coarsen::Coarsener;
use crate::simulation::partition::graph::MetisGraph;
use crate::simulation::partition::refine::KWayRefiner;

pub mod bisection;
pub mod coarsen;
pub mod converter;
pub mod graph;
pub mod orchestrator;
pub mod refine;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PartitionError {
    #[error("vertex {vertex} on coarsening level {level} has no valid partition")]
    Unassigned { level: usize, vertex: usize },
    #[error("expected {expected} target fractions, got {actual}")]
    FractionCount { expected: usize, actual: usize },
    #[error("target fractions must be positive and finite, got {0:?}")]
    InvalidFractions(Vec<f64>),
}

impl PartitionError {
    pub(crate) fn unassigned(graph: &MetisGraph, level: usize) -> Self {
        let vertex = graph
            .nodes()
            .iter()
            .position(|n| n.partition().is_none())
            .unwrap_or(0);
        PartitionError::Unassigned { level, vertex }
    }
}

/// Normalized target weight fraction per partition. Without explicit fractions every partition
/// gets an equal share.
pub(crate) fn target_fractions(
    num_parts: usize,
    fractions: Option<&[f64]>,
) -> Result<Vec<f64>, PartitionError> {
    let Some(fractions) = fractions else {
        return Ok(vec![1. / num_parts as f64; num_parts]);
    };
    if fractions.len() != num_parts {
        return Err(PartitionError::FractionCount {
            expected: num_parts,
            actual: fractions.len(),
        });
    }
    if fractions.iter().any(|f| !f.is_finite() || *f <= 0.) {
        return Err(PartitionError::InvalidFractions(fractions.to_vec()));
    }
    let sum: f64 = fractions.iter().sum();
    Ok(fractions.iter().map(|f| f / sum).collect())
}

/// Multilevel k-way partitioning: coarsen the graph, bisect the coarsest level recursively and
/// refine the partition while projecting it back onto the original graph. Every vertex of the
/// returned graph carries a partition in [0, num_parts). With `num_parts <= 1` everything goes
/// into partition 0.
#[instrument(level = "trace", skip_all, fields(vertices = graph.len(), num_parts = num_parts))]
pub fn partition(
    mut graph: MetisGraph,
    num_parts: usize,
    options: &MetisOptions,
    fractions: Option<&[f64]>,
) -> Result<MetisGraph, PartitionError> {
    if num_parts <= 1 {
        let zeros = vec![0; graph.len()];
        graph.set_assignment(&zeros);
        graph.set_min_cut(0);
        return Ok(graph);
    }

    let coarsener = Coarsener::for_graph(&graph, num_parts);
    let mut hierarchy = coarsener.coarsen(graph);
    info!(
        "Coarsened graph in {} levels from {} to {} vertices.",
        hierarchy.levels(),
        hierarchy.original().len(),
        hierarchy.coarsest().len()
    );

    PMetis::new(
        options.bisection_passes as usize,
        options.imbalance_factor,
        options.seed,
    )
    .partition(hierarchy.coarsest_mut(), num_parts, fractions)?;

    KWayRefiner::new(options.refinement_passes as usize, options.imbalance_factor).refine(
        &mut hierarchy,
        num_parts,
        fractions,
    )?;

    let graph = hierarchy.into_original();
    if !graph.verify(num_parts) {
        return Err(PartitionError::unassigned(&graph, 0));
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use crate::simulation::config::MetisOptions;
    use crate::simulation::partition::graph::MetisGraph;
    use crate::simulation::partition::{partition, target_fractions, PartitionError};

    fn grid(rows: usize, columns: usize) -> MetisGraph {
        let mut graph = MetisGraph::new();
        for _ in 0..rows * columns {
            graph.add_node(1);
        }
        for r in 0..rows {
            for c in 0..columns {
                let v = r * columns + c;
                if c + 1 < columns {
                    graph.add_edge(v, v + 1, 1);
                }
                if r + 1 < rows {
                    graph.add_edge(v, v + columns, 1);
                }
            }
        }
        graph
    }

    #[test]
    fn single_partition() {
        let graph = partition(grid(3, 3), 1, &MetisOptions::default(), None).unwrap();
        assert!(graph.verify(1));
        assert_eq!(0, graph.min_cut());
    }

    #[test]
    fn zero_partitions_are_treated_as_one() {
        let graph = partition(grid(3, 3), 0, &MetisOptions::default(), None).unwrap();
        assert!(graph.verify(1));
    }

    #[test]
    fn large_grid_is_partitioned_completely_and_balanced() {
        // 60 x 60 is large enough to be coarsened for 4 partitions
        let graph = partition(grid(60, 60), 4, &MetisOptions::default(), None).unwrap();
        assert!(graph.verify(4));

        let average = 3600. / 4.;
        for weight in graph.partition_weights(4) {
            let deviation = (weight as f64 - average).abs();
            assert!(deviation <= 1.03 * average, "weight {weight}");
            assert!((weight as f64) <= 1.03 * average + 1., "weight {weight}");
        }
        assert_eq!(graph.compute_edge_cut(), graph.min_cut());
        // a straight cut of a 60 x 60 grid into four stripes costs 180
        assert!(graph.min_cut() < 600, "cut {}", graph.min_cut());
    }

    #[test]
    fn more_partitions_than_vertices() {
        let graph = partition(grid(1, 3), 6, &MetisOptions::default(), None).unwrap();
        assert!(graph.verify(6));
        let empty = graph
            .partition_weights(6)
            .iter()
            .filter(|w| **w == 0)
            .count();
        assert!(empty >= 3);
    }

    #[test]
    fn fractions_are_normalized() {
        assert_eq!(vec![0.25, 0.75], target_fractions(2, Some(&[1., 3.])).unwrap());
        assert_eq!(vec![0.5, 0.5], target_fractions(2, None).unwrap());
        assert_eq!(
            Err(PartitionError::FractionCount {
                expected: 3,
                actual: 1
            }),
            target_fractions(3, Some(&[1.]))
        );
        assert!(target_fractions(2, Some(&[1., 0.])).is_err());
    }
}

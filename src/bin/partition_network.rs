use std::error::Error;

use clap::Parser;
use tracing::info;

use rust_part_sim::simulation::config::{
    BoundaryPolicy, GridScenario, MetisOptions, PartitionMethod, Repartitioning,
};
use rust_part_sim::simulation::logging::init_std_out_logging_thread_local;
use rust_part_sim::simulation::partition::orchestrator::PartitionState;
use rust_part_sim::simulation::scenario::Scenario;

/// Builds a synthetic grid city and runs a single bootstrap partitioning on it. Prints road
/// counts and loads per partition, the number of boundary roads and the edge cut.
fn main() -> Result<(), Box<dyn Error>> {
    let _guard = init_std_out_logging_thread_local();
    let args = InputArgs::parse();

    let grid = GridScenario {
        rows: args.rows,
        columns: args.columns,
        seed: args.seed,
        ..GridScenario::default()
    };
    let scenario = Scenario::grid(&grid);
    info!(
        "Partition grid of {}x{} junctions into {} parts.",
        args.rows, args.columns, args.num_parts
    );

    let options = MetisOptions::default()
        .set_seed(args.seed)
        .set_boundary_policy(args.boundary_policy);
    let mut state = PartitionState::new(
        args.num_parts as usize,
        PartitionMethod::Metis(options),
        Repartitioning::default(),
    );
    state.first_run(&scenario)?;

    for p in 0..state.num_parts() {
        println!(
            "partition {p}: {} roads, load {}",
            state.interior_roads(p).len(),
            state.partition_loads()[p]
        );
    }
    println!("boundary roads: {}", state.boundary_roads().len());
    println!("edge cut: {}", state.plan().min_cut);
    Ok(())
}

#[derive(Parser, Debug)]
struct InputArgs {
    #[arg(long, default_value_t = 10)]
    pub rows: u32,
    #[arg(long, default_value_t = 10)]
    pub columns: u32,
    #[arg(long)]
    pub num_parts: u32,
    #[arg(long, value_enum, default_value_t = BoundaryPolicy::AssignToPartition)]
    pub boundary_policy: BoundaryPolicy,
    #[arg(long, default_value_t = 4711)]
    pub seed: u64,
}

use std::error::Error;

use clap::Parser;
use tracing::info;

use rust_part_sim::simulation::config::{CommandLineArgs, Config};
use rust_part_sim::simulation::controller::Controller;
use rust_part_sim::simulation::logging::init_logging;

fn main() -> Result<(), Box<dyn Error>> {
    let args = CommandLineArgs::parse();
    let config = Config::from_file(&args)?;
    let _guards = init_logging(&config)?;
    info!("Started with args: {:?}", args);

    let mut controller = Controller::from_config(config)?;
    let summary = controller.run()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

use derive_builder::Builder;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::simulation::config::{Config, ConfigError};
use crate::simulation::partition::orchestrator::PartitionState;
use crate::simulation::partition::PartitionError;
use crate::simulation::scenario::Scenario;
use crate::simulation::scheduler::{SchedulerError, ThreadedScheduler};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Builder(#[from] ControllerBuilderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    pub ticks: u32,
    /// Partitioning passes after the bootstrap.
    pub repartitions: usize,
    /// Failed partition tasks and failed boundary roads over all ticks.
    pub failed_tasks: usize,
}

/// Drives the simulation loop: partition when due, step all partitions, report timings.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Controller {
    config: Config,
    scenario: Scenario,
    state: PartitionState,
    scheduler: ThreadedScheduler,
}

impl Controller {
    /// Validates the config and sets up the synthetic grid scenario it describes.
    pub fn from_config(config: Config) -> Result<Self, ControllerError> {
        config.validate()?;
        let scenario = Scenario::grid(&config.grid_scenario());
        let state = PartitionState::from_config(&config);
        let scheduler = ThreadedScheduler::from_config(&config)?;
        let controller = ControllerBuilder::default()
            .config(config)
            .scenario(scenario)
            .state(state)
            .scheduler(scheduler)
            .build()?;
        Ok(controller)
    }

    #[instrument(level = "info", skip(self))]
    pub fn run(&mut self) -> Result<RunSummary, ControllerError> {
        let simulation = self.config.simulation();
        let report_interval = self.config.repartitioning().refresh_interval.max(1);
        info!(
            "Starting simulation from {} to {} with {} partitions on {} threads.",
            simulation.start_time,
            simulation.end_time,
            self.state.num_parts(),
            self.scheduler.num_threads()
        );

        let mut summary = RunSummary::default();
        for now in simulation.start_time..=simulation.end_time {
            let bootstrapped = self.state.is_bootstrapped();
            if self.state.trigger_partition_if_due(now, &self.scenario)? && bootstrapped {
                summary.repartitions += 1;
            }

            let report = self
                .scheduler
                .step_all_partitions(now, &mut self.scenario, &self.state);
            summary.failed_tasks += report.failed_tasks() + report.boundary_failures.len();
            summary.ticks += 1;

            if now > simulation.start_time && now % report_interval == 0 {
                self.scheduler.report_time(now);
            }
        }
        self.scheduler.report_time(simulation.end_time);

        info!(
            "Simulation finished after {} ticks with {} re-partitionings and {} failed tasks.",
            summary.ticks, summary.repartitions, summary.failed_tasks
        );
        Ok(summary)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn state(&self) -> &PartitionState {
        &self.state
    }
}

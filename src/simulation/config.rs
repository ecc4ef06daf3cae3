use std::any::Any;
use std::cell::RefCell;
use std::fs::File;
use std::io::BufReader;

use ahash::HashMap;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CommandLineArgs {
    #[arg(long, short)]
    pub config_path: String,
    #[arg(long, short)]
    pub num_parts: Option<u32>,
}

impl CommandLineArgs {
    pub fn new_with_path(path: impl ToString) -> Self {
        CommandLineArgs {
            config_path: path.to_string(),
            num_parts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
pub struct Config {
    modules: RefCell<HashMap<String, Box<dyn ConfigModule>>>,
}

impl Config {
    pub fn from_file(args: &CommandLineArgs) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(&args.config_path).map_err(|source| {
            ConfigError::Io {
                path: args.config_path.clone(),
                source,
            }
        })?);
        let mut config: Config =
            serde_yaml::from_reader(reader).map_err(|source| ConfigError::Yaml {
                path: args.config_path.clone(),
                source,
            })?;

        // replace the number of partitions if we get one from the outside. This is interesting for
        // scaling experiments.
        if let Some(num_parts) = args.num_parts {
            config.set_partitioning(Partitioning {
                num_parts,
                method: config.partitioning().method,
            });
            let output = config.output();
            config.set_output(Output {
                output_dir: format!("{}-{num_parts}", output.output_dir),
                ..output
            });
        }
        Ok(config)
    }

    /// Checks the values the partitioning core relies on. The core itself clamps silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let partitioning = self.partitioning();
        if partitioning.num_parts == 0 {
            return Err(ConfigError::invalid(
                "partitioning.num_parts",
                "at least one partition is required",
            ));
        }
        if let PartitionMethod::Metis(options) = &partitioning.method {
            if options.imbalance_factor < 1. {
                return Err(ConfigError::invalid(
                    "partitioning.method.imbalance_factor",
                    format!("must be >= 1.0, was {}", options.imbalance_factor),
                ));
            }
            if [options.alpha, options.beta, options.gamma]
                .iter()
                .any(|c| *c < 0.)
            {
                return Err(ConfigError::invalid(
                    "partitioning.method",
                    "edge weight coefficients must not be negative",
                ));
            }
        }

        let repartitioning = self.repartitioning();
        if repartitioning.refresh_interval == 0 {
            return Err(ConfigError::invalid(
                "repartitioning.refresh_interval",
                "must be positive",
            ));
        }
        if repartitioning.max_refresh_interval < repartitioning.refresh_interval {
            return Err(ConfigError::invalid(
                "repartitioning.max_refresh_interval",
                "must not be smaller than refresh_interval",
            ));
        }

        let simulation = self.simulation();
        if simulation.end_time < simulation.start_time {
            return Err(ConfigError::invalid(
                "simulation.end_time",
                "must not be before start_time",
            ));
        }
        if simulation.zone_step_interval == 0
            || simulation.charging_station_step_interval == 0
            || simulation.signal_step_interval == 0
        {
            return Err(ConfigError::invalid(
                "simulation",
                "step intervals must be positive",
            ));
        }
        Ok(())
    }

    pub fn partitioning(&self) -> Partitioning {
        if let Some(partitioning) = self.module::<Partitioning>("partitioning") {
            partitioning
        } else {
            let default = Partitioning {
                num_parts: 1,
                method: PartitionMethod::Metis(MetisOptions::default()),
            };
            self.modules
                .borrow_mut()
                .insert("partitioning".to_string(), Box::new(default.clone()));
            default
        }
    }

    pub fn set_partitioning(&mut self, partitioning: Partitioning) {
        self.modules
            .get_mut()
            .insert("partitioning".to_string(), Box::new(partitioning));
    }

    pub fn repartitioning(&self) -> Repartitioning {
        if let Some(repartitioning) = self.module::<Repartitioning>("repartitioning") {
            repartitioning
        } else {
            let default = Repartitioning::default();
            self.modules
                .borrow_mut()
                .insert("repartitioning".to_string(), Box::new(default.clone()));
            default
        }
    }

    pub fn set_repartitioning(&mut self, repartitioning: Repartitioning) {
        self.modules
            .get_mut()
            .insert("repartitioning".to_string(), Box::new(repartitioning));
    }

    pub fn computational_setup(&self) -> ComputationalSetup {
        if let Some(setup) = self.module::<ComputationalSetup>("computational_setup") {
            setup
        } else {
            let default = ComputationalSetup::default();
            self.modules
                .borrow_mut()
                .insert("computational_setup".to_string(), Box::new(default));
            default
        }
    }

    pub fn set_computational_setup(&mut self, setup: ComputationalSetup) {
        self.modules
            .get_mut()
            .insert("computational_setup".to_string(), Box::new(setup));
    }

    pub fn simulation(&self) -> Simulation {
        if let Some(simulation) = self.module::<Simulation>("simulation") {
            simulation
        } else {
            let default = Simulation::default();
            self.modules
                .borrow_mut()
                .insert("simulation".to_string(), Box::new(default.clone()));
            default
        }
    }

    pub fn set_simulation(&mut self, simulation: Simulation) {
        self.modules
            .get_mut()
            .insert("simulation".to_string(), Box::new(simulation));
    }

    pub fn output(&self) -> Output {
        if let Some(output) = self.module::<Output>("output") {
            output
        } else {
            let default = Output {
                output_dir: "./".to_string(),
                profiling: Profiling::None,
                logging: Logging::Info,
            };
            self.modules
                .borrow_mut()
                .insert("output".to_string(), Box::new(default.clone()));
            default
        }
    }

    pub fn set_output(&mut self, output: Output) {
        self.modules
            .get_mut()
            .insert("output".to_string(), Box::new(output));
    }

    pub fn grid_scenario(&self) -> GridScenario {
        if let Some(grid) = self.module::<GridScenario>("grid_scenario") {
            grid
        } else {
            let default = GridScenario::default();
            self.modules
                .borrow_mut()
                .insert("grid_scenario".to_string(), Box::new(default.clone()));
            default
        }
    }

    pub fn set_grid_scenario(&mut self, grid: GridScenario) {
        self.modules
            .get_mut()
            .insert("grid_scenario".to_string(), Box::new(grid));
    }

    fn module<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.modules
            .borrow()
            .get(key)
            .and_then(|boxed| boxed.as_ref().as_any().downcast_ref::<T>().cloned())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Partitioning {
    pub num_parts: u32,
    pub method: PartitionMethod,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum PartitionMethod {
    Metis(MetisOptions),
    /// Roads are dealt round-robin, no graph is built.
    None,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct MetisOptions {
    /// Edge weight coefficient of the current vehicles on a road
    #[serde(default = "f64_value_1")]
    pub alpha: f64,
    /// Edge weight coefficient of the shadow vehicles
    #[serde(default = "f64_value_1")]
    pub beta: f64,
    /// Edge weight coefficient of the future routing vehicles
    #[serde(default = "f64_value_1")]
    pub gamma: f64,
    #[serde(default = "f64_value_1_03")]
    pub imbalance_factor: f64,
    #[serde(default = "u32_value_20")]
    pub bisection_passes: u32,
    #[serde(default = "u32_value_10")]
    pub refinement_passes: u32,
    #[serde(default = "u64_value_4711")]
    pub seed: u64,
    #[serde(default)]
    pub boundary_policy: BoundaryPolicy,
    #[serde(default = "u32_value_3")]
    pub rebalance_iterations: u32,
    #[serde(default = "u32_value_10")]
    pub rebalance_min_roads: u32,
}

impl Default for MetisOptions {
    fn default() -> Self {
        MetisOptions {
            alpha: 1.,
            beta: 1.,
            gamma: 1.,
            imbalance_factor: 1.03,
            bisection_passes: 20,
            refinement_passes: 10,
            seed: 4711,
            boundary_policy: BoundaryPolicy::default(),
            rebalance_iterations: 3,
            rebalance_min_roads: 10,
        }
    }
}

impl MetisOptions {
    pub fn set_coefficients(mut self, alpha: f64, beta: f64, gamma: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self.gamma = gamma;
        self
    }

    pub fn set_imbalance_factor(mut self, imbalance_factor: f64) -> Self {
        self.imbalance_factor = imbalance_factor;
        self
    }

    pub fn set_bisection_passes(mut self, passes: u32) -> Self {
        self.bisection_passes = passes;
        self
    }

    pub fn set_refinement_passes(mut self, passes: u32) -> Self {
        self.refinement_passes = passes;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_boundary_policy(mut self, policy: BoundaryPolicy) -> Self {
        self.boundary_policy = policy;
        self
    }

    pub fn set_rebalancing(mut self, iterations: u32, min_roads: u32) -> Self {
        self.rebalance_iterations = iterations;
        self.rebalance_min_roads = min_roads;
        self
    }
}

/// How roads with end points in different partitions are executed.
#[derive(PartialEq, Debug, ValueEnum, Clone, Copy, Serialize, Deserialize, Default)]
pub enum BoundaryPolicy {
    /// Boundary roads are stepped by the task of the less loaded of both partitions.
    #[default]
    AssignToPartition,
    /// Boundary roads are stepped serially after all partition tasks have finished.
    SeparatePhase,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Repartitioning {
    pub refresh_interval: u32,
    pub max_refresh_interval: u32,
    pub vehicle_threshold: u64,
}

impl Default for Repartitioning {
    fn default() -> Self {
        Repartitioning {
            refresh_interval: 600,
            max_refresh_interval: 3600,
            vehicle_threshold: 1000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq)]
pub struct ComputationalSetup {
    /// Size of the worker pool. 0 means one thread per partition.
    #[serde(default)]
    pub num_threads: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Simulation {
    pub start_time: u32,
    pub end_time: u32,
    #[serde(default = "u32_value_1")]
    pub zone_step_interval: u32,
    #[serde(default = "u32_value_1")]
    pub charging_station_step_interval: u32,
    #[serde(default = "u32_value_1")]
    pub signal_step_interval: u32,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            start_time: 0,
            end_time: 3600,
            zone_step_interval: 1,
            charging_station_step_interval: 1,
            signal_step_interval: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Output {
    pub output_dir: String,
    #[serde(default)]
    pub profiling: Profiling,
    #[serde(default)]
    pub logging: Logging,
}

/// Parameters of the synthetic grid city.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GridScenario {
    pub rows: u32,
    pub columns: u32,
    #[serde(default = "u32_value_20")]
    pub max_vehicles_per_road: u32,
    #[serde(default)]
    pub zones: u32,
    #[serde(default)]
    pub charging_stations: u32,
    #[serde(default)]
    pub signals: u32,
    #[serde(default = "u64_value_4711")]
    pub seed: u64,
}

impl Default for GridScenario {
    fn default() -> Self {
        GridScenario {
            rows: 10,
            columns: 10,
            max_vehicles_per_road: 20,
            zones: 10,
            charging_stations: 5,
            signals: 20,
            seed: 4711,
        }
    }
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub enum Profiling {
    #[default]
    None,
    CSV(ProfilingLevel),
}

/// Have this extra layer of log level enum, as tracing subscriber has no
/// off/none option by default. At least it can't be parsed
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub enum Logging {
    #[default]
    None,
    Info,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilingLevel {
    #[serde(default = "default_profiling_level")]
    pub level: String,
}

impl ProfilingLevel {
    /// Unknown levels fall back to INFO.
    pub fn create_tracing_level(&self) -> Level {
        match self.level.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            _ => Level::INFO,
        }
    }
}

#[typetag::serde(tag = "type")]
pub trait ConfigModule {
    fn as_any(&self) -> &dyn Any;
}

#[typetag::serde]
impl ConfigModule for Partitioning {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[typetag::serde]
impl ConfigModule for Repartitioning {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[typetag::serde]
impl ConfigModule for ComputationalSetup {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[typetag::serde]
impl ConfigModule for Simulation {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[typetag::serde]
impl ConfigModule for Output {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[typetag::serde]
impl ConfigModule for GridScenario {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn default_profiling_level() -> String {
    "INFO".to_string()
}

fn f64_value_1() -> f64 {
    1.
}

fn f64_value_1_03() -> f64 {
    1.03
}

fn u32_value_1() -> u32 {
    1
}

fn u32_value_3() -> u32 {
    3
}

fn u32_value_10() -> u32 {
    10
}

fn u32_value_20() -> u32 {
    20
}

fn u64_value_4711() -> u64 {
    4711
}

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use itertools::Itertools;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::simulation::config::Config;
use crate::simulation::entities::{ChargingStation, Road, Signal, StepError, Zone};
use crate::simulation::partition::orchestrator::PartitionState;
use crate::simulation::scenario::Scenario;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

/// Ticks on which the non road entities are stepped. Roads step every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepIntervals {
    pub zone: u32,
    pub charging_station: u32,
    pub signal: u32,
}

impl Default for StepIntervals {
    fn default() -> Self {
        StepIntervals {
            zone: 1,
            charging_station: 1,
            signal: 1,
        }
    }
}

impl StepIntervals {
    fn is_due(interval: u32, now: u32) -> bool {
        now % interval.max(1) == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Entities stepped before the failure. Their state is kept.
    pub stepped: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub partition: usize,
    pub elapsed: Duration,
    /// Number of stepped entities, or the failure which stopped the task.
    pub outcome: Result<usize, TaskFailure>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub now: u32,
    pub tasks: Vec<TaskReport>,
    pub boundary_stepped: usize,
    pub boundary_elapsed: Duration,
    pub boundary_failures: Vec<String>,
}

impl TickReport {
    pub fn failed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.is_err()).count()
    }

    pub fn stepped(&self) -> usize {
        let tasks: usize = self
            .tasks
            .iter()
            .map(|t| match &t.outcome {
                Ok(stepped) => *stepped,
                Err(failure) => failure.stepped,
            })
            .sum();
        tasks + self.boundary_stepped
    }
}

/// Per tick min, max and average task time, summed up since the last report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingStats {
    ticks: u32,
    min: Duration,
    max: Duration,
    avg: Duration,
    boundary: Duration,
}

/// Averages over the ticks of one reporting period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSummary {
    pub ticks: u32,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub boundary: Duration,
}

impl TimingStats {
    fn record(&mut self, tasks: &[TaskReport], boundary: Duration) {
        let times = tasks.iter().map(|t| t.elapsed);
        if let Some((min, max)) = times.clone().minmax().into_option() {
            self.min += min;
            self.max += max;
            self.avg += times.sum::<Duration>() / tasks.len() as u32;
        }
        self.boundary += boundary;
        self.ticks += 1;
    }

    pub fn summary(&self) -> Option<TimingSummary> {
        if self.ticks == 0 {
            return None;
        }
        Some(TimingSummary {
            ticks: self.ticks,
            min: self.min / self.ticks,
            max: self.max / self.ticks,
            avg: self.avg / self.ticks,
            boundary: self.boundary / self.ticks,
        })
    }
}

/// The entities one partition task owns for the duration of a tick.
struct PartitionTask<'s> {
    partition: usize,
    roads: Vec<&'s mut Box<dyn Road>>,
    zones: Vec<&'s mut Box<dyn Zone>>,
    charging_stations: Vec<&'s mut Box<dyn ChargingStation>>,
    signals: Vec<&'s mut Box<dyn Signal>>,
}

impl PartitionTask<'_> {
    fn run(mut self, now: u32, intervals: StepIntervals) -> TaskReport {
        let start = Instant::now();
        let mut stepped = 0;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.step_all(now, intervals, &mut stepped)
        }));
        let outcome = match result {
            Ok(Ok(())) => Ok(stepped),
            Ok(Err(e)) => Err(TaskFailure {
                stepped,
                reason: e.to_string(),
            }),
            Err(payload) => Err(TaskFailure {
                stepped,
                reason: panic_message(payload),
            }),
        };
        TaskReport {
            partition: self.partition,
            elapsed: start.elapsed(),
            outcome,
        }
    }

    fn step_all(
        &mut self,
        now: u32,
        intervals: StepIntervals,
        stepped: &mut usize,
    ) -> Result<(), StepError> {
        for road in self.roads.iter_mut() {
            road.step(now)?;
            *stepped += 1;
        }
        if StepIntervals::is_due(intervals.zone, now) {
            for zone in self.zones.iter_mut() {
                zone.step(now)?;
                *stepped += 1;
            }
        }
        if StepIntervals::is_due(intervals.charging_station, now) {
            for station in self.charging_stations.iter_mut() {
                station.step(now)?;
                *stepped += 1;
            }
        }
        if StepIntervals::is_due(intervals.signal, now) {
            for signal in self.signals.iter_mut() {
                signal.step(now)?;
                *stepped += 1;
            }
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Hands out mutable references to the entries listed in `indices`. Every entry is handed out at
/// most once, so the returned references of different calls are disjoint.
fn take_all<'s, T: ?Sized>(
    slots: &mut [Option<&'s mut Box<T>>],
    indices: &[usize],
) -> Vec<&'s mut Box<T>> {
    indices
        .iter()
        .filter_map(|i| slots.get_mut(*i).and_then(Option::take))
        .collect()
}

fn slots<T: ?Sized>(entities: &mut [Box<T>]) -> Vec<Option<&mut Box<T>>> {
    entities.iter_mut().map(Some).collect()
}

/// Steps all partitions of a tick in parallel on a fixed size worker pool and the boundary roads
/// which belong to no partition serially afterwards.
pub struct ThreadedScheduler {
    pool: ThreadPool,
    intervals: StepIntervals,
    stats: TimingStats,
}

impl ThreadedScheduler {
    pub fn new(num_threads: usize, intervals: StepIntervals) -> Result<Self, SchedulerError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("partition-worker-{i}"))
            .build()?;
        Ok(ThreadedScheduler {
            pool,
            intervals,
            stats: TimingStats::default(),
        })
    }

    /// Uses `computational_setup.num_threads` workers, or one worker per partition if that is 0.
    pub fn from_config(config: &Config) -> Result<Self, SchedulerError> {
        let configured = config.computational_setup().num_threads as usize;
        let num_threads = if configured == 0 {
            config.partitioning().num_parts as usize
        } else {
            configured
        };
        let simulation = config.simulation();
        let intervals = StepIntervals {
            zone: simulation.zone_step_interval,
            charging_station: simulation.charging_station_step_interval,
            signal: simulation.signal_step_interval,
        };
        ThreadedScheduler::new(num_threads, intervals)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn stats(&self) -> &TimingStats {
        &self.stats
    }

    /// Runs one task per partition and waits for all of them. Then the boundary roads which are
    /// not part of any partition are stepped on the calling thread. A failing task stops for this
    /// tick, the others are not affected. Nothing is retried.
    #[instrument(level = "trace", skip(self, scenario, state))]
    pub fn step_all_partitions(
        &mut self,
        now: u32,
        scenario: &mut Scenario,
        state: &PartitionState,
    ) -> TickReport {
        let background = state.background();
        let mut road_slots = slots(&mut scenario.network.roads);
        let mut zone_slots = slots(&mut scenario.zones);
        let mut station_slots = slots(&mut scenario.charging_stations);
        let mut signal_slots = slots(&mut scenario.signals);

        let tasks: Vec<PartitionTask> = (0..state.num_parts())
            .map(|p| PartitionTask {
                partition: p,
                roads: take_all(&mut road_slots, state.interior_roads(p)),
                zones: take_all(&mut zone_slots, entities_of(&background.zones, p)),
                charging_stations: take_all(
                    &mut station_slots,
                    entities_of(&background.charging_stations, p),
                ),
                signals: take_all(&mut signal_slots, entities_of(&background.signals, p)),
            })
            .collect();
        let boundary_roads = take_all(&mut road_slots, state.serial_boundary_roads());

        let intervals = self.intervals;
        let reports: Vec<TaskReport> = self.pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| task.run(now, intervals))
                .collect()
        });

        for report in &reports {
            if let Err(failure) = &report.outcome {
                warn!(
                    "Partition {} failed at {now} after {} entities: {}. Remaining entities are not stepped in this tick.",
                    report.partition, failure.stepped, failure.reason
                );
            }
        }

        // all partition tasks are finished. Now step what belongs to nobody.
        let boundary_start = Instant::now();
        let mut boundary_stepped = 0;
        let mut boundary_failures = Vec::new();
        for road in boundary_roads {
            let result = panic::catch_unwind(AssertUnwindSafe(|| road.step(now)));
            match result {
                Ok(Ok(())) => boundary_stepped += 1,
                Ok(Err(e)) => boundary_failures.push(e.to_string()),
                Err(payload) => boundary_failures.push(panic_message(payload)),
            }
        }
        let boundary_elapsed = boundary_start.elapsed();
        for failure in &boundary_failures {
            warn!("Boundary road failed at {now}: {failure}");
        }

        self.stats.record(&reports, boundary_elapsed);
        TickReport {
            now,
            tasks: reports,
            boundary_stepped,
            boundary_elapsed,
            boundary_failures,
        }
    }

    /// Logs the timing averages since the last report and resets them.
    pub fn report_time(&mut self, now: u32) -> Option<TimingSummary> {
        let summary = self.stats.summary();
        if let Some(s) = &summary {
            info!(
                "Tick {now}: partition task time over {} ticks min {:?}, max {:?}, avg {:?}, boundary {:?}",
                s.ticks, s.min, s.max, s.avg, s.boundary
            );
        }
        self.stats = TimingStats::default();
        summary
    }
}

fn entities_of(assignment: &[Vec<usize>], partition: usize) -> &[usize] {
    assignment
        .get(partition)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

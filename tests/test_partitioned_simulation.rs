use std::sync::atomic::Ordering;

use rust_part_sim::simulation::config::{
    BoundaryPolicy, CommandLineArgs, Config, MetisOptions, PartitionMethod, Repartitioning,
};
use rust_part_sim::simulation::controller::{Controller, ControllerError};
use rust_part_sim::simulation::partition::orchestrator::PartitionState;
use rust_part_sim::simulation::scheduler::{StepIntervals, ThreadedScheduler};
use rust_part_sim::test_utils::{counting_ring, CountingZone, FailingRoad};

#[test]
fn run_grid_config() {
    let args = CommandLineArgs::new_with_path("./tests/resources/grid-config.yml");
    let config = Config::from_file(&args).unwrap();
    let mut controller = Controller::from_config(config).unwrap();

    let summary = controller.run().unwrap();
    assert_eq!(61, summary.ticks);
    assert_eq!(0, summary.failed_tasks);

    let state = controller.state();
    assert_eq!(2, state.num_parts());
    let num_roads = controller.scenario().network.roads.len();
    let executed: usize = (0..2).map(|p| state.interior_roads(p).len()).sum();
    // separate phase: every road is either executed by a partition or stepped serially
    assert_eq!(num_roads, executed + state.serial_boundary_roads().len());
}

#[test]
fn run_round_robin_config() {
    let args = CommandLineArgs::new_with_path("./tests/resources/round-robin-config.yml");
    let config = Config::from_file(&args).unwrap();
    let mut controller = Controller::from_config(config).unwrap();

    let summary = controller.run().unwrap();
    assert_eq!(11, summary.ticks);
    assert!(controller.state().boundary_roads().is_empty());
}

#[test]
fn invalid_config_does_not_start() {
    let args = CommandLineArgs::new_with_path("./tests/resources/invalid-config.yml");
    let config = Config::from_file(&args).unwrap();
    assert!(matches!(
        Controller::from_config(config),
        Err(ControllerError::Config(_))
    ));
}

fn step_every_road_once(policy: BoundaryPolicy) {
    let (mut scenario, counters) = counting_ring(12, 3);
    let method = PartitionMethod::Metis(MetisOptions::default().set_boundary_policy(policy));
    let repartitioning = Repartitioning {
        refresh_interval: 2,
        max_refresh_interval: 4,
        vehicle_threshold: 0,
    };
    let mut state = PartitionState::new(3, method, repartitioning);
    let mut scheduler = ThreadedScheduler::new(3, StepIntervals::default()).unwrap();

    let ticks = 7;
    for now in 0..ticks {
        state.trigger_partition_if_due(now, &scenario).unwrap();
        let report = scheduler.step_all_partitions(now, &mut scenario, &state);
        assert_eq!(0, report.failed_tasks());
        assert_eq!(12, report.stepped());
    }
    for counter in counters {
        assert_eq!(ticks as usize, counter.load(Ordering::Relaxed));
    }
}

#[test]
fn every_road_steps_once_per_tick_when_assigned() {
    step_every_road_once(BoundaryPolicy::AssignToPartition);
}

#[test]
fn every_road_steps_once_per_tick_in_separate_phase() {
    step_every_road_once(BoundaryPolicy::SeparatePhase);
}

#[test]
fn failing_task_does_not_affect_others() {
    let (mut scenario, counters) = counting_ring(4, 1);
    // round robin with 2 parts: roads 0, 2 and 4 go to partition 0, roads 1 and 3 to partition 1
    scenario
        .network
        .add_detached_road(Box::new(FailingRoad::new(0, 2, 3)));
    let mut state = PartitionState::new(2, PartitionMethod::None, Repartitioning::default());
    state.first_run(&scenario).unwrap();
    let mut scheduler = ThreadedScheduler::new(2, StepIntervals::default()).unwrap();

    let report = scheduler.step_all_partitions(0, &mut scenario, &state);
    assert_eq!(0, report.failed_tasks());

    let report = scheduler.step_all_partitions(3, &mut scenario, &state);
    assert_eq!(1, report.failed_tasks());
    let failed = report.tasks.iter().find(|t| t.outcome.is_err()).unwrap();
    assert_eq!(0, failed.partition);
    let failure = failed.outcome.as_ref().unwrap_err();
    assert_eq!(2, failure.stepped);
    assert!(failure.reason.contains("broken"));

    // the state of stepped entities is kept, nothing is retried
    for counter in &counters {
        assert_eq!(2, counter.load(Ordering::Relaxed));
    }
}

#[test]
fn panicking_task_is_reported() {
    let (mut scenario, _counters) = counting_ring(4, 1);
    scenario
        .network
        .add_detached_road(Box::new(FailingRoad::panicking(0, 2, 0)));
    let mut state = PartitionState::new(2, PartitionMethod::None, Repartitioning::default());
    state.first_run(&scenario).unwrap();
    let mut scheduler = ThreadedScheduler::new(2, StepIntervals::default()).unwrap();

    let report = scheduler.step_all_partitions(0, &mut scenario, &state);
    assert_eq!(1, report.failed_tasks());
    let failure = report.tasks[0].outcome.as_ref().unwrap_err();
    assert!(failure.reason.contains("panicked"));
    assert!(report.tasks[1].outcome.is_ok());

    // the pool survives the panic
    let report = scheduler.step_all_partitions(1, &mut scenario, &state);
    assert_eq!(1, report.failed_tasks());
}

#[test]
fn zones_step_on_their_interval() {
    let (mut scenario, _counters) = counting_ring(4, 1);
    let (zone, zone_steps) = CountingZone::new(1.);
    scenario.zones.push(Box::new(zone));
    let mut state = PartitionState::new(2, PartitionMethod::None, Repartitioning::default());
    state.first_run(&scenario).unwrap();
    let intervals = StepIntervals {
        zone: 4,
        ..StepIntervals::default()
    };
    let mut scheduler = ThreadedScheduler::new(2, intervals).unwrap();

    for now in 0..10 {
        scheduler.step_all_partitions(now, &mut scenario, &state);
    }
    // 0, 4 and 8
    assert_eq!(3, zone_steps.load(Ordering::Relaxed));
}

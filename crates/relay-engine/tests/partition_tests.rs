//! Partitioned-run tests: lane coverage and ordering, priority-lane
//! preemption, externally-driven lanes, and scope isolation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_engine::collab::testing::{EventLog, ScriptedRunner, ScriptedTransport};
use relay_engine::{
    Command, DelayStep, EngineError, Observer, Run, RunOptions, RunPlan,
};
use relay_types::{
    CursorSnapshot, EventKind, Item, RequestSpec, ScriptResult, TrackedContext, VariableScope,
};

fn two_items() -> Vec<Item> {
    vec![
        Item::new("a", "alpha", RequestSpec::new("GET", "http://example.test/a")),
        Item::new("b", "bravo", RequestSpec::new("GET", "http://example.test/b")),
    ]
}

fn build(
    items: Vec<Item>,
    options: RunOptions,
) -> (Run, Arc<ScriptedRunner>, Arc<ScriptedTransport>) {
    let scripts = Arc::new(ScriptedRunner::new());
    let transport = Arc::new(ScriptedTransport::new());
    let run = Run::new(
        RunPlan {
            items,
            options,
            ..Default::default()
        },
        scripts.clone(),
        transport.clone(),
    );
    (run, scripts, transport)
}

#[tokio::test]
async fn lanes_cover_all_iterations_preserving_lane_order() {
    let (run, _, transport) = build(
        two_items(),
        RunOptions {
            iteration_count: 5,
            max_concurrency: 2,
            ..Default::default()
        },
    );
    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok(), "unexpected error: {:?}", done.error);

    let sent = transport.sent();
    assert_eq!(sent.len(), 10);

    let mut by_lane: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for job in &sent {
        let lane = job.coords.partition_index.expect("lane coordinate");
        by_lane
            .entry(lane)
            .or_default()
            .push((job.coords.iteration, job.coords.position));
    }
    // 5 iterations over 2 lanes: sizes [3, 2] at offsets [0, 3]; within a
    // lane, order is strict
    assert_eq!(by_lane.len(), 2);
    assert_eq!(
        by_lane[&0],
        vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]
    );
    assert_eq!(by_lane[&1], vec![(3, 0), (3, 1), (4, 0), (4, 1)]);
}

#[tokio::test]
async fn priority_work_drains_before_lanes_start() {
    let (run, _, _) = build(
        two_items(),
        RunOptions {
            iteration_count: 4,
            max_concurrency: 2,
            ..Default::default()
        },
    );
    let manager = run.partition_manager().expect("manager");
    manager
        .schedule(
            Command::Delay(DelayStep {
                duration: Duration::from_millis(10),
                then: None,
            }),
            true,
        )
        .expect("schedule priority work");

    let log = Arc::new(EventLog::new());
    let done = run.start(log.clone()).await;
    assert!(done.ok());

    let names = log.names();
    let last_wait = names
        .iter()
        .rposition(|name| *name == "waitStateChange")
        .expect("priority wait ran");
    let first_item = names
        .iter()
        .position(|name| *name == "beforeItem")
        .expect("items ran");
    assert!(last_wait < first_item, "priority work must finish first");
}

/// Observer that injects priority work when the first item completes.
struct PriorityInjector {
    log: Arc<EventLog>,
    run: Run,
    injected: AtomicBool,
}

impl Observer for PriorityInjector {
    fn before_item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, item: &Item) {
        self.log.before_item(error, cursor, item);
    }

    fn item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, item: &Item) {
        self.log.item(error, cursor, item);
        if !self.injected.swap(true, Ordering::SeqCst) {
            let manager = self.run.partition_manager().expect("manager");
            manager
                .schedule(
                    Command::Delay(DelayStep {
                        duration: Duration::from_millis(20),
                        then: None,
                    }),
                    true,
                )
                .expect("inject priority work");
        }
    }

    fn wait_state_change(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        waiting: bool,
        duration: Duration,
    ) {
        self.log.wait_state_change(error, cursor, waiting, duration);
    }
}

#[tokio::test]
async fn mid_run_priority_work_preempts_the_lane() {
    // one regular lane (concurrency capped by a single iteration) keeps
    // the interleaving deterministic
    let (run, _, _) = build(
        two_items(),
        RunOptions {
            iteration_count: 1,
            max_concurrency: 2,
            ..Default::default()
        },
    );
    let log = Arc::new(EventLog::new());
    let observer = Arc::new(PriorityInjector {
        log: log.clone(),
        run: run.clone(),
        injected: AtomicBool::new(false),
    });

    let done = run.start(observer).await;
    assert!(done.ok());

    let names = log.names();
    let wait_start = names
        .iter()
        .position(|name| *name == "waitStateChange")
        .expect("priority wait ran");
    // the lane defers while the priority lane drains: nothing runs
    // between the wait's two notifications
    assert_eq!(names[wait_start + 1], "waitStateChange");
    // and the second item only starts afterwards
    let second_item = names
        .iter()
        .enumerate()
        .filter(|(_, name)| **name == "beforeItem")
        .map(|(index, _)| index)
        .nth(1)
        .expect("second item ran");
    assert!(second_item > wait_start + 1);
}

/// Observer that pauses at the first item and resumes shortly after.
struct PauseAtFirstItem {
    log: Arc<EventLog>,
    run: Run,
    paused: AtomicBool,
}

impl Observer for PauseAtFirstItem {
    fn item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, item: &Item) {
        self.log.item(error, cursor, item);
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.run.handle().pause().expect("pause");
            let handle = self.run.handle();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                handle.resume().expect("resume");
            });
        }
    }

    fn pause(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.log.pause(error, cursor);
    }

    fn resume(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.log.resume(error, cursor);
    }
}

#[tokio::test]
async fn pause_blocks_every_lane_until_resume() {
    let (run, _, transport) = build(
        two_items(),
        RunOptions {
            iteration_count: 2,
            max_concurrency: 2,
            ..Default::default()
        },
    );
    let log = Arc::new(EventLog::new());
    let observer = Arc::new(PauseAtFirstItem {
        log: log.clone(),
        run: run.clone(),
        paused: AtomicBool::new(false),
    });

    let done = run.start(observer).await;
    assert!(done.ok(), "unexpected error: {:?}", done.error);
    assert_eq!(log.count("pause"), 1);
    assert_eq!(log.count("resume"), 1);
    // the pause only delayed the run; everything still executed
    assert_eq!(transport.sent().len(), 4);
}

#[tokio::test]
async fn externally_driven_lanes_run_on_demand() {
    let (run, _, transport) = build(
        two_items(),
        RunOptions {
            iteration_count: 3,
            externally_driven: true,
            ..Default::default()
        },
    );
    // start completes without kicking any lane off
    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());
    assert!(transport.sent().is_empty());

    let mut seed = VariableScope::new();
    seed.set("lane", json!("one"));
    let one = run.run_single_partition(1, Some(seed)).await;
    assert!(one.ok(), "unexpected error: {:?}", one.error);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|job| job.coords.iteration == 1));
    assert!(sent
        .iter()
        .all(|job| job.coords.partition_index == Some(1)));

    // lanes outside the iteration space do not exist
    let missing = run.run_single_partition(7, None).await;
    assert!(matches!(
        missing.error,
        Some(EngineError::UnknownPartition(7))
    ));

    // stopping clears a lane's pool; unknown lanes are rejected
    run.stop_single_partition(1).expect("stop");
    assert!(run.stop_single_partition(9).is_err());
}

#[tokio::test]
async fn lane_scopes_are_isolated_until_merged() {
    let (run, scripts, _) = build(
        vec![Item::new(
            "a",
            "alpha",
            RequestSpec::new("GET", "http://example.test/a"),
        )],
        RunOptions {
            iteration_count: 2,
            externally_driven: true,
            ..Default::default()
        },
    );
    let mut environment = VariableScope::new();
    environment.set("written", json!(true));
    scripts.enqueue(
        EventKind::Prerequest,
        Ok(vec![ScriptResult {
            error: None,
            context: TrackedContext {
                environment: Some(environment),
                ..Default::default()
            },
        }]),
    );

    assert!(run.run_single_partition(0, None).await.ok());
    assert!(run.run_single_partition(1, None).await.ok());

    // lane 1 never saw lane 0's write
    let jobs = scripts.jobs();
    let lane_one: Vec<_> = jobs
        .iter()
        .filter(|job| job.coords.partition_index == Some(1))
        .collect();
    assert!(!lane_one.is_empty());
    assert!(lane_one
        .iter()
        .all(|job| job.environment.get("written").is_none()));

    // run scopes see it only after the explicit merge
    assert!(run.scopes().environment.get("written").is_none());
    run.update_partition_variables(0).expect("merge");
    assert_eq!(run.scopes().environment.get("written"), Some(&json!(true)));
}

//! End-to-end waterfall tests: event ordering, jump routing, failure
//! policies, and inter-step delays, all against the scripted
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_engine::collab::testing::{
    jump_to, script_error, script_ok, EventLog, ScriptedRunner, ScriptedTransport,
};
use relay_engine::{DelayOptions, EngineError, Run, RunOptions, RunPlan};
use relay_types::{
    Assertion, EventKind, Item, NextDirective, RequestSpec, ScriptResult, TrackedContext,
    VariableScope,
};

fn item(id: &str, name: &str) -> Item {
    Item::new(id, name, RequestSpec::new("GET", format!("http://example.test/{id}")))
}

fn three_items() -> Vec<Item> {
    vec![item("a", "alpha"), item("b", "bravo"), item("c", "charlie")]
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
async fn three_items_two_iterations_event_order() {
    let (run, _, transport) = build(
        three_items(),
        RunOptions {
            iteration_count: 2,
            ..Default::default()
        },
    );
    let log = Arc::new(EventLog::new());
    let done = run.start(log.clone()).await;
    assert!(done.ok(), "unexpected error: {:?}", done.error);

    let per_item = [
        "beforeItem",
        "beforePrerequest",
        "prerequest",
        "beforeTest",
        "test",
        "item",
    ];
    let mut expected = vec!["start", "beforeIteration"];
    for _ in 0..3 {
        expected.extend(per_item);
    }
    expected.push("iteration");
    expected.push("beforeIteration");
    for _ in 0..3 {
        expected.extend(per_item);
    }
    expected.push("iteration");
    assert_eq!(log.names(), expected);

    // both iterations visit every item, in order
    let sent: Vec<(usize, usize)> = transport
        .sent()
        .iter()
        .map(|job| (job.coords.iteration, job.coords.position))
        .collect();
    assert_eq!(sent, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
}

#[tokio::test]
async fn jump_to_first_item_replays_from_start() {
    let (run, scripts, transport) = build(three_items(), RunOptions::default());
    scripts.enqueue(EventKind::Test, Ok(script_ok())); // a: linear
    scripts.enqueue(EventKind::Test, Ok(jump_to("alpha"))); // b: back to a

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok(), "unexpected error: {:?}", done.error);

    let positions: Vec<usize> = transport
        .sent()
        .iter()
        .map(|job| job.coords.position)
        .collect();
    assert_eq!(positions, vec![0, 1, 0, 1, 2]);
}

#[tokio::test]
async fn jump_forward_by_id_skips_items() {
    let (run, scripts, transport) = build(three_items(), RunOptions::default());
    scripts.enqueue(EventKind::Test, Ok(jump_to("c"))); // a: straight to c

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());

    let positions: Vec<usize> = transport
        .sent()
        .iter()
        .map(|job| job.coords.position)
        .collect();
    assert_eq!(positions, vec![0, 2]);
}

#[tokio::test]
async fn jump_by_positional_literal() {
    let (run, scripts, transport) = build(three_items(), RunOptions::default());
    scripts.enqueue(EventKind::Test, Ok(jump_to("2")));

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());

    let positions: Vec<usize> = transport
        .sent()
        .iter()
        .map(|job| job.coords.position)
        .collect();
    assert_eq!(positions, vec![0, 2]);
}

#[tokio::test]
async fn unresolved_jump_ends_the_iteration() {
    let (run, scripts, transport) = build(
        three_items(),
        RunOptions {
            iteration_count: 2,
            ..Default::default()
        },
    );
    scripts.enqueue(EventKind::Test, Ok(jump_to("missing")));

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());

    // iteration 0 stops after item a; iteration 1 runs in full
    let sent: Vec<(usize, usize)> = transport
        .sent()
        .iter()
        .map(|job| (job.coords.iteration, job.coords.position))
        .collect();
    assert_eq!(sent, vec![(0, 0), (1, 0), (1, 1), (1, 2)]);
}

#[tokio::test]
async fn explicit_continue_directive_stays_linear() {
    let (run, scripts, transport) = build(three_items(), RunOptions::default());
    scripts.enqueue(
        EventKind::Test,
        Ok(vec![ScriptResult {
            error: None,
            context: TrackedContext {
                next_request: NextDirective::Continue,
                ..Default::default()
            },
        }]),
    );

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());
    assert_eq!(transport.sent().len(), 3);
}

#[tokio::test]
async fn disable_set_next_ignores_directives() {
    let (run, scripts, transport) = build(
        three_items(),
        RunOptions {
            disable_set_next: true,
            ..Default::default()
        },
    );
    scripts.enqueue(EventKind::Test, Ok(jump_to("c")));

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());

    let positions: Vec<usize> = transport
        .sent()
        .iter()
        .map(|job| job.coords.position)
        .collect();
    assert_eq!(positions, vec![0, 1, 2]);
}

#[tokio::test]
async fn stop_on_error_halts_at_failing_prerequest() {
    let (run, scripts, transport) = build(
        three_items(),
        RunOptions {
            stop_on_error: true,
            ..Default::default()
        },
    );
    scripts.enqueue(EventKind::Prerequest, Ok(script_error("boom")));

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(matches!(
        done.error,
        Some(EngineError::Script {
            event: EventKind::Prerequest,
            ..
        })
    ));
    // the request stage never ran
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn stop_on_failure_promotes_failed_assertions() {
    let (run, scripts, transport) = build(
        three_items(),
        RunOptions {
            stop_on_failure: true,
            ..Default::default()
        },
    );
    scripts.enqueue(
        EventKind::Test,
        Ok(vec![ScriptResult {
            error: None,
            context: TrackedContext {
                assertions: vec![Assertion {
                    name: "status is 200".into(),
                    passed: false,
                    message: Some("got 500".into()),
                }],
                ..Default::default()
            },
        }]),
    );

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(matches!(done.error, Some(EngineError::AssertionFailed(_))));
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn abort_on_failure_aborts_instead_of_erroring() {
    let (run, scripts, transport) = build(
        three_items(),
        RunOptions {
            abort_on_failure: true,
            ..Default::default()
        },
    );
    scripts.enqueue(EventKind::Test, Ok(script_error("assert blew up")));

    let log = Arc::new(EventLog::new());
    let done = run.start(log.clone()).await;
    assert!(done.ok(), "abort converges clean: {:?}", done.error);
    assert_eq!(log.count("abort"), 1);
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn transport_error_without_policy_still_runs_tests() {
    let (run, scripts, transport) = build(three_items(), RunOptions::default());
    transport.enqueue(Err(EngineError::Transport("connection refused".into())));

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok(), "unexpected error: {:?}", done.error);

    // all three items attempted their request and both script stages
    assert_eq!(transport.sent().len(), 3);
    let test_jobs = scripts
        .jobs()
        .iter()
        .filter(|job| job.name == EventKind::Test)
        .count();
    assert_eq!(test_jobs, 3);
}

#[tokio::test]
async fn tracked_environment_flows_to_later_stages() {
    let (run, scripts, _) = build(three_items(), RunOptions::default());
    let mut environment = VariableScope::new();
    environment.set("token", json!("t-123"));
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

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());

    let jobs = scripts.jobs();
    // the write from item a's prerequest is visible to its own test stage
    // and to every later job in the lane
    let later = jobs
        .iter()
        .skip(1)
        .filter(|job| job.environment.get("token") == Some(&json!("t-123")))
        .count();
    assert_eq!(later, jobs.len() - 1);
}

#[tokio::test]
async fn inter_step_delays_notify_wait_state() {
    let (run, _, _) = build(
        vec![item("a", "alpha"), item("b", "bravo")],
        RunOptions {
            iteration_count: 2,
            delay: DelayOptions {
                item: Duration::from_millis(5),
                iteration: Duration::from_millis(5),
            },
            ..Default::default()
        },
    );
    let log = Arc::new(EventLog::new());
    let done = run.start(log.clone()).await;
    assert!(done.ok());

    // three waits (a→b, rollover, a→b), two notifications each; the
    // final eof re-queue is never delayed
    assert_eq!(log.count("waitStateChange"), 6);
}

#[tokio::test]
async fn iteration_data_rows_reach_the_transport() {
    let mut row0 = relay_types::DataRow::new();
    row0.insert("user".into(), json!("first"));
    let mut row1 = relay_types::DataRow::new();
    row1.insert("user".into(), json!("second"));

    let scripts = Arc::new(ScriptedRunner::new());
    let transport = Arc::new(ScriptedTransport::new());
    let run = Run::new(
        RunPlan {
            items: vec![item("a", "alpha")],
            data: relay_types::IterationData::from_rows(vec![row0, row1]),
            options: RunOptions {
                iteration_count: 3,
                ..Default::default()
            },
            ..Default::default()
        },
        scripts,
        transport.clone(),
    );

    let done = run.start(Arc::new(EventLog::new())).await;
    assert!(done.ok());

    let users: Vec<_> = transport
        .sent()
        .iter()
        .map(|job| job.data["user"].clone())
        .collect();
    // the last row is reused once the data runs out
    assert_eq!(users, vec![json!("first"), json!("second"), json!("second")]);
}

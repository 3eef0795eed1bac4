//! Test collaborators — scripted fakes and an event recorder.
//!
//! `ScriptedRunner` and `ScriptedTransport` replay queued results (or a
//! benign default) and record every job they receive. `EventLog` is an
//! [`Observer`] that records the order of emitted notifications. Used by
//! the engine's own tests and useful to embedders testing against relay.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use relay_types::{
    CursorSnapshot, EventKind, Item, NextDirective, ResponseSpec, ScriptJob, ScriptResult,
    TrackedContext, TransportExchange, TransportJob,
};

use super::{ScriptRunner, Transport};
use crate::error::{EngineError, EngineResult};
use crate::observer::Observer;

/// A successful, empty script result.
pub fn script_ok() -> Vec<ScriptResult> {
    vec![ScriptResult::default()]
}

/// A script result whose script failed with `message`.
pub fn script_error(message: impl Into<String>) -> Vec<ScriptResult> {
    vec![ScriptResult {
        error: Some(message.into()),
        context: TrackedContext::default(),
    }]
}

/// A script result carrying a jump directive.
pub fn jump_to(target: impl Into<String>) -> Vec<ScriptResult> {
    vec![ScriptResult {
        error: None,
        context: TrackedContext {
            next_request: NextDirective::Target(target.into()),
            ..Default::default()
        },
    }]
}

/// What a `ScriptedRunner` recorded about one job.
#[derive(Debug, Clone)]
pub struct RecordedScript {
    pub name: EventKind,
    pub item_id: String,
    pub coords: CursorSnapshot,
    /// Environment scope the job carried, for isolation assertions.
    pub environment: relay_types::VariableScope,
}

/// Script collaborator replaying queued results per stage.
///
/// With nothing queued for a stage it reports one clean, empty result.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<HashMap<EventKind, VecDeque<EngineResult<Vec<ScriptResult>>>>>,
    jobs: Mutex<Vec<RecordedScript>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next result for `kind` (FIFO per stage).
    pub fn enqueue(&self, kind: EventKind, result: EngineResult<Vec<ScriptResult>>) {
        self.responses
            .lock()
            .expect("scripted runner poisoned")
            .entry(kind)
            .or_default()
            .push_back(result);
    }

    /// Every job received so far, in order.
    pub fn jobs(&self) -> Vec<RecordedScript> {
        self.jobs.lock().expect("scripted runner poisoned").clone()
    }
}

#[async_trait]
impl ScriptRunner for ScriptedRunner {
    async fn run(&self, job: ScriptJob) -> EngineResult<Vec<ScriptResult>> {
        self.jobs
            .lock()
            .expect("scripted runner poisoned")
            .push(RecordedScript {
                name: job.name,
                item_id: job.item.id.clone(),
                coords: job.coords.clone(),
                environment: job.context.environment.clone(),
            });
        let queued = self
            .responses
            .lock()
            .expect("scripted runner poisoned")
            .get_mut(&job.name)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(result) => result,
            None => Ok(vec![ScriptResult::default()]),
        }
    }
}

/// Transport collaborator replaying queued exchanges.
///
/// With nothing queued it answers 200 with the request echoed back.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<EngineResult<TransportExchange>>>,
    sent: Mutex<Vec<TransportJob>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next exchange (FIFO).
    pub fn enqueue(&self, result: EngineResult<TransportExchange>) {
        self.responses
            .lock()
            .expect("scripted transport poisoned")
            .push_back(result);
    }

    /// Every job received so far, in order.
    pub fn sent(&self) -> Vec<TransportJob> {
        self.sent.lock().expect("scripted transport poisoned").clone()
    }
}

/// The default exchange: 200, no body, request echoed.
pub fn echo_exchange(item: &Item) -> TransportExchange {
    TransportExchange {
        request: item.request.clone(),
        response: ResponseSpec::new(200),
        cookies: Vec::new(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, job: TransportJob) -> EngineResult<TransportExchange> {
        self.sent
            .lock()
            .expect("scripted transport poisoned")
            .push(job.clone());
        let queued = self
            .responses
            .lock()
            .expect("scripted transport poisoned")
            .pop_front();
        match queued {
            Some(result) => result,
            None => Ok(echo_exchange(&job.item)),
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub name: &'static str,
    pub position: usize,
    pub iteration: usize,
    pub errored: bool,
}

/// Observer recording every notification in emission order.
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<LoggedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &'static str, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.entries
            .lock()
            .expect("event log poisoned")
            .push(LoggedEvent {
                name,
                position: cursor.position,
                iteration: cursor.iteration,
                errored: error.is_some(),
            });
    }

    /// All recorded entries.
    pub fn entries(&self) -> Vec<LoggedEvent> {
        self.entries.lock().expect("event log poisoned").clone()
    }

    /// Just the notification names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries().iter().map(|e| e.name).collect()
    }

    /// How many times `name` was emitted.
    pub fn count(&self, name: &str) -> usize {
        self.entries().iter().filter(|e| e.name == name).count()
    }
}

impl Observer for EventLog {
    fn start(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.record("start", error, cursor);
    }

    fn before_iteration(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.record("beforeIteration", error, cursor);
    }

    fn iteration(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.record("iteration", error, cursor);
    }

    fn before_item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, _item: &Item) {
        self.record("beforeItem", error, cursor);
    }

    fn item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, _item: &Item) {
        self.record("item", error, cursor);
    }

    fn before_prerequest(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        _item: &Item,
    ) {
        self.record("beforePrerequest", error, cursor);
    }

    fn prerequest(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        _item: &Item,
        _results: &[ScriptResult],
    ) {
        self.record("prerequest", error, cursor);
    }

    fn before_test(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, _item: &Item) {
        self.record("beforeTest", error, cursor);
    }

    fn test(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        _item: &Item,
        _results: &[ScriptResult],
    ) {
        self.record("test", error, cursor);
    }

    fn pause(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.record("pause", error, cursor);
    }

    fn resume(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.record("resume", error, cursor);
    }

    fn abort(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {
        self.record("abort", error, cursor);
    }

    fn wait_state_change(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        _waiting: bool,
        _duration: Duration,
    ) {
        self.record("waitStateChange", error, cursor);
    }
}

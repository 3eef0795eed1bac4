//! The run orchestrator — global state, scheduling primitives, and the
//! single-lane drain loop.
//!
//! A [`Run`] owns the item list, per-iteration data, variable scopes, the
//! active cursor, and a default instruction pool. `queue`/`interrupt`/
//! `immediate` are the three scheduling primitives; `start` runs the
//! startup sequence and then drains the pool one instruction at a time
//! until it empties, an instruction errors, the run is aborted, or the
//! global timeout fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use relay_types::{CursorSnapshot, Item, IterationData, ScopeSet};
use tokio::sync::oneshot;

use crate::collab::{ScriptRunner, Transport};
use crate::cursor::Cursor;
use crate::error::{EngineError, EngineResult};
use crate::instruction::{Command, Instruction, Pool, StepOutcome, WaterfallStep};
use crate::observer::{NullObserver, Observer};
use crate::partition::PartitionManager;
use crate::waterfall::ItemLookup;

/// Delays injected between scheduled steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayOptions {
    /// Wait between consecutive items.
    pub item: Duration,
    /// Wait before each new iteration.
    pub iteration: Duration,
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How many cycles over the item list to run.
    pub iteration_count: usize,
    /// Maximum concurrent lanes. 1 keeps the run single-lane.
    pub max_concurrency: usize,
    /// Externally-driven mode: partitions exist but no lane starts until
    /// the caller drives it via `run_single_partition`.
    pub externally_driven: bool,
    /// Stop the run when a script hook errors.
    pub stop_on_error: bool,
    /// Promote failed test assertions to run errors.
    pub stop_on_failure: bool,
    /// Abort (instead of erroring) when a script or assertion fails.
    pub abort_on_failure: bool,
    /// Ignore jump directives left by test scripts.
    pub disable_set_next: bool,
    /// Global wall-clock limit for the whole run.
    pub timeout: Option<Duration>,
    /// Inter-step delays.
    pub delay: DelayOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            iteration_count: 1,
            max_concurrency: 1,
            externally_driven: false,
            stop_on_error: false,
            stop_on_failure: false,
            abort_on_failure: false,
            disable_set_next: false,
            timeout: None,
            delay: DelayOptions::default(),
        }
    }
}

impl RunOptions {
    /// Validate option values. First failure aborts startup.
    pub fn validate(&self) -> EngineResult<()> {
        if self.iteration_count == 0 {
            return Err(EngineError::InvalidOptions(
                "iteration count must be at least 1".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::InvalidOptions(
                "max concurrency must be at least 1".into(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(EngineError::InvalidOptions("timeout must be positive".into()));
        }
        Ok(())
    }

    /// Whether this run fans out through the partition manager.
    pub(crate) fn partitioned(&self) -> bool {
        self.max_concurrency > 1 || self.externally_driven
    }
}

/// Everything a run needs up front: items, data, scopes, options.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub items: Vec<Item>,
    pub data: IterationData,
    pub scopes: ScopeSet,
    pub options: RunOptions,
}

impl RunPlan {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }
}

/// Final state of a run: the first error (if any) and the cursor where
/// the run ended.
#[derive(Debug)]
pub struct RunCompletion {
    pub error: Option<EngineError>,
    pub cursor: CursorSnapshot,
}

impl RunCompletion {
    /// True when the run finished without error.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One execution context: a pool, a cursor range, and owned scopes.
///
/// The run's default lane and every partition are lanes. A lane's scopes
/// are its own; nothing outside merges into them implicitly.
pub(crate) struct Lane {
    pub(crate) pool: Pool,
    pub(crate) cursor: Mutex<Cursor>,
    pub(crate) scopes: Mutex<ScopeSet>,
    /// Whether the lane's opening `before_iteration` was emitted.
    pub(crate) started: AtomicBool,
}

impl Lane {
    pub(crate) fn new(cursor: Cursor, scopes: ScopeSet) -> Self {
        Self {
            pool: Pool::new(),
            cursor: Mutex::new(cursor),
            scopes: Mutex::new(scopes),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> CursorSnapshot {
        self.cursor.lock().expect("lane cursor poisoned").snapshot()
    }
}

/// The suspended-task handle for pause/resume.
#[derive(Default)]
pub(crate) struct PauseState {
    /// Set when a pause was requested (possibly not yet parked).
    pub(crate) flagged: bool,
    /// Fires to release the parked pause instruction. Dropping it (abort,
    /// timeout) releases the lane without a resume notification.
    pub(crate) resume_tx: Option<oneshot::Sender<()>>,
}

pub(crate) struct Shared {
    pub(crate) options: RunOptions,
    pub(crate) items: Arc<Vec<Arc<Item>>>,
    pub(crate) data: IterationData,
    pub(crate) scripts: Arc<dyn ScriptRunner>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) default_lane: Lane,
    pub(crate) manager: OnceLock<Arc<PartitionManager>>,
    pub(crate) lookup: OnceLock<ItemLookup>,
    pub(crate) pause: Mutex<PauseState>,
    pub(crate) aborted: AtomicBool,
    pub(crate) abort_notified: AtomicBool,
    pub(crate) observer: Mutex<Arc<dyn Observer>>,
}

/// The run orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Run {
    pub(crate) shared: Arc<Shared>,
}

/// Control surface handed to embedders: pause, resume, abort.
#[derive(Clone)]
pub struct RunHandle {
    run: Run,
}

impl RunHandle {
    pub fn pause(&self) -> EngineResult<()> {
        self.run.pause()
    }

    pub fn resume(&self) -> EngineResult<()> {
        self.run.resume()
    }

    pub fn abort(&self) {
        self.run.abort()
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        self.run.snapshot()
    }
}

impl Run {
    /// Build a run from a plan and its two collaborators.
    pub fn new(
        plan: RunPlan,
        scripts: Arc<dyn ScriptRunner>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let items: Arc<Vec<Arc<Item>>> =
            Arc::new(plan.items.into_iter().map(Arc::new).collect());
        let cursor = Cursor::new(items.len(), plan.options.iteration_count.max(1));
        let default_lane = Lane::new(cursor, plan.scopes);
        Self {
            shared: Arc::new(Shared {
                options: plan.options,
                items,
                data: plan.data,
                scripts,
                transport,
                default_lane,
                manager: OnceLock::new(),
                lookup: OnceLock::new(),
                pause: Mutex::new(PauseState::default()),
                aborted: AtomicBool::new(false),
                abort_notified: AtomicBool::new(false),
                observer: Mutex::new(Arc::new(NullObserver)),
            }),
        }
    }

    /// A cloneable control handle for this run.
    pub fn handle(&self) -> RunHandle {
        RunHandle { run: self.clone() }
    }

    /// Snapshot of the run-level cursor.
    pub fn snapshot(&self) -> CursorSnapshot {
        self.shared.default_lane.snapshot()
    }

    pub(crate) fn observer(&self) -> Arc<dyn Observer> {
        self.shared.observer.lock().expect("observer poisoned").clone()
    }

    pub(crate) fn aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Append a command to the end of the default pool.
    pub fn queue(&self, command: Command) {
        self.shared.default_lane.pool.push(Instruction::new(command));
    }

    /// Append a pre-built instruction (lets callers attach done hooks).
    pub fn queue_instruction(&self, instruction: Instruction) {
        self.shared.default_lane.pool.push(instruction);
    }

    /// Prepend a command, ahead of all pending non-priority work.
    pub fn interrupt(&self, command: Command) {
        self.shared.default_lane.pool.unshift(Instruction::new(command));
    }

    /// Bypass the pool: execute on the next tick. Errors surface only
    /// through the returned handle, never through the run's completion.
    pub fn immediate(
        &self,
        command: Command,
    ) -> tokio::task::JoinHandle<EngineResult<StepOutcome>> {
        let run = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let instruction = Instruction::new(command);
            run.execute(&run.shared.default_lane, instruction).await
        })
    }

    /// Start the run: startup sequence, `start` notification, then drain
    /// to completion. Completion is always reported as an error (or not)
    /// plus the final cursor snapshot.
    #[tracing::instrument(level = "debug", skip(self, observer), fields(items = self.shared.items.len(), iterations = self.shared.options.iteration_count, concurrency = self.shared.options.max_concurrency))]
    pub async fn start(&self, observer: Arc<dyn Observer>) -> RunCompletion {
        *self.shared.observer.lock().expect("observer poisoned") = observer;
        if let Err(error) = self.initialize() {
            return RunCompletion {
                error: Some(error),
                cursor: self.snapshot(),
            };
        }
        self.observer().start(None, &self.snapshot());
        if self.shared.options.partitioned() {
            self.process_partitioned().await
        } else {
            self.process_single().await
        }
    }

    /// Startup sequence. Each step must succeed before the next runs.
    fn initialize(&self) -> EngineResult<()> {
        self.shared.options.validate()?;
        if self.shared.options.partitioned() {
            self.partition_manager()?;
        }
        Ok(())
    }

    /// Single-lane processing: bootstrap the waterfall, then drain.
    async fn process_single(&self) -> RunCompletion {
        self.queue(Command::Waterfall(WaterfallStep {
            static_coords: Some(self.snapshot()),
            bootstrap: true,
        }));
        let drained = self.drain(&self.shared.default_lane);
        self.with_timeout(drained).await
    }

    /// Race a drain against the global timeout, when one is set. On
    /// expiry the pools are cleared (soft preemption, same mechanism as
    /// abort), the in-flight instruction finishes, and the completion is
    /// reported exactly once with a timeout error.
    pub(crate) async fn with_timeout<F>(&self, drained: F) -> RunCompletion
    where
        F: std::future::Future<Output = EngineResult<CursorSnapshot>>,
    {
        match self.shared.options.timeout {
            None => self.completion(drained.await),
            Some(limit) => {
                tokio::pin!(drained);
                tokio::select! {
                    result = &mut drained => self.completion(result),
                    _ = tokio::time::sleep(limit) => {
                        tracing::debug!(?limit, "run timed out; clearing pools");
                        self.halt();
                        let _ = drained.await;
                        RunCompletion {
                            error: Some(EngineError::Timeout(limit)),
                            cursor: self.snapshot(),
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn completion(&self, drained: EngineResult<CursorSnapshot>) -> RunCompletion {
        match drained {
            Ok(cursor) => RunCompletion {
                error: None,
                cursor,
            },
            Err(error) => RunCompletion {
                error: Some(error),
                cursor: self.snapshot(),
            },
        }
    }

    /// Drain a lane's pool: pop one instruction, execute, repeat. Stops
    /// at the first error; an aborted run converges to a clean finish.
    pub(crate) async fn drain(&self, lane: &Lane) -> EngineResult<CursorSnapshot> {
        loop {
            if self.aborted() {
                return Ok(lane.snapshot());
            }
            let Some(instruction) = lane.pool.shift() else {
                return Ok(lane.snapshot());
            };
            match self.execute(lane, instruction).await {
                Ok(_) => {}
                Err(_) if self.aborted() => return Ok(lane.snapshot()),
                Err(error) => return Err(error),
            }
        }
    }

    /// Execute one instruction: dispatch on its command, resolve its
    /// completion, then yield so the continuation runs on a fresh tick.
    pub(crate) async fn execute(
        &self,
        lane: &Lane,
        instruction: Instruction,
    ) -> EngineResult<StepOutcome> {
        let (command, mut timings, completion) = instruction.into_parts();
        timings.started = Some(Instant::now());
        tracing::trace!(command = command.name(), "executing instruction");
        let result = self.dispatch(lane, command).await;
        completion.resolve(&result);
        if let (Some(started), Some(ended)) = (timings.started, completion.ended()) {
            tracing::trace!(elapsed = ?ended.duration_since(started), "instruction finished");
        }
        tokio::task::yield_now().await;
        result
    }

    /// The closed command dispatch.
    async fn dispatch(&self, lane: &Lane, command: Command) -> EngineResult<StepOutcome> {
        match command {
            Command::Waterfall(step) => self.waterfall(lane, step).await,
            Command::Prerequest(stage) => self.prerequest(lane, stage).await,
            Command::Request(stage) => self.request(lane, stage).await,
            Command::Test(stage) => self.test(lane, stage).await,
            Command::Pause => self.pause_step(lane).await,
            Command::Resume => self.resume_step(lane).await,
            Command::Delay(step) => self.delay_step(lane, step).await,
        }
    }

    /// The item at `position`. Out of range is a fatal scheduling error.
    pub(crate) fn item_at(&self, position: usize) -> EngineResult<Arc<Item>> {
        self.shared
            .items
            .get(position)
            .cloned()
            .ok_or_else(|| EngineError::LaneFailed(format!("no item at position {position}")))
    }

    /// The lazily-built jump lookup table over the original item list.
    pub(crate) fn lookup(&self) -> &ItemLookup {
        self.shared
            .lookup
            .get_or_init(|| ItemLookup::build(&self.shared.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::testing::{EventLog, ScriptedRunner, ScriptedTransport};

    fn empty_run(options: RunOptions) -> Run {
        let plan = RunPlan {
            options,
            ..Default::default()
        };
        Run::new(
            plan,
            Arc::new(ScriptedRunner::new()),
            Arc::new(ScriptedTransport::new()),
        )
    }

    #[test]
    fn zero_iterations_is_invalid() {
        let options = RunOptions {
            iteration_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(EngineError::InvalidOptions(_))
        ));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let options = RunOptions {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn invalid_options_abort_startup() {
        let run = empty_run(RunOptions {
            iteration_count: 0,
            ..Default::default()
        });
        let done = run.start(Arc::new(NullObserver)).await;
        assert!(matches!(done.error, Some(EngineError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn empty_item_list_completes_clean() {
        let run = empty_run(RunOptions::default());
        let log = Arc::new(EventLog::new());
        let done = run.start(log.clone()).await;
        assert!(done.ok());
        assert!(done.cursor.empty);
        assert_eq!(log.names(), vec!["start"]);
    }

    #[tokio::test]
    async fn immediate_bypasses_the_pool() {
        let run = empty_run(RunOptions::default());
        // nothing drains the pool here; an immediate still executes
        let handle = run.immediate(Command::Resume);
        let result = handle.await.expect("task");
        assert!(matches!(result, Err(EngineError::NotPaused)));
        assert!(run.shared.default_lane.pool.is_empty());
    }
}

//! Instructions and pools — deferred units of work and the queues that
//! hold them.
//!
//! An [`Instruction`] is one scheduled step: a closed [`Command`] variant
//! carrying its own typed payload, plus timings and a one-shot
//! [`Completion`] guard with post-success "done" hooks. A [`Pool`] is a
//! lane's private queue of instructions, drained one at a time; `unshift`
//! is the interrupt path that jumps ahead of all pending work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_types::{CursorSnapshot, TransportExchange};

use crate::error::EngineResult;

/// A pre-resolved or computed waterfall step.
#[derive(Debug, Clone)]
pub struct WaterfallStep {
    /// Execute exactly at this coordinate instead of deriving it with
    /// `whatnext`. Set on the first step of a lane and after a jump that
    /// resolved to the start of the iteration.
    pub static_coords: Option<CursorSnapshot>,
    /// This is the lane's opening step; it emits the first
    /// `before_iteration` notification.
    pub bootstrap: bool,
}

/// The chain context threaded through an item's prerequest → request →
/// test stages.
#[derive(Debug, Clone)]
pub struct ItemStage {
    /// Coordinate of the item being worked.
    pub coords: CursorSnapshot,
    /// Request override left by a prerequest script.
    pub request: Option<relay_types::RequestSpec>,
    /// The exchange, once the request stage completed.
    pub exchange: Option<TransportExchange>,
    /// An earlier stage failed but policy let the chain continue.
    pub failed: bool,
}

impl ItemStage {
    pub fn new(coords: CursorSnapshot) -> Self {
        Self {
            coords,
            request: None,
            exchange: None,
            failed: false,
        }
    }
}

/// A timed wait, optionally wrapping a follow-on command.
#[derive(Debug)]
pub struct DelayStep {
    pub duration: Duration,
    /// Queued into the lane's pool once the wait ends.
    pub then: Option<Box<Command>>,
}

/// The closed set of instruction kinds.
///
/// Each variant carries its own payload; dispatch is an exhaustive match
/// in the engine, so unknown actions are unrepresentable.
#[derive(Debug)]
pub enum Command {
    /// Advance the waterfall and schedule the next item chain.
    Waterfall(WaterfallStep),
    /// Run the current item's prerequest hooks.
    Prerequest(ItemStage),
    /// Perform the current item's request through the transport.
    Request(ItemStage),
    /// Run the current item's test hooks and resolve routing.
    Test(ItemStage),
    /// Park the lane until resumed.
    Pause,
    /// Release a parked pause.
    Resume,
    /// Wait, then queue the follow-on command.
    Delay(DelayStep),
}

impl Command {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Waterfall(_) => "waterfall",
            Command::Prerequest(_) => "prerequest",
            Command::Request(_) => "request",
            Command::Test(_) => "test",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Delay(_) => "delay",
        }
    }

    /// The coordinate a scheduled command targets, when it has one.
    /// The partition manager routes on this.
    pub fn coords(&self) -> Option<&CursorSnapshot> {
        match self {
            Command::Waterfall(step) => step.static_coords.as_ref(),
            Command::Prerequest(stage) | Command::Request(stage) | Command::Test(stage) => {
                Some(&stage.coords)
            }
            Command::Pause | Command::Resume | Command::Delay(_) => None,
        }
    }
}

/// What a completed instruction reports to its done hooks.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Cursor snapshot at completion.
    pub coords: CursorSnapshot,
}

/// A post-success completion hook.
pub type DoneHook = Box<dyn FnOnce(&StepOutcome) + Send>;

/// One-shot completion guard.
///
/// Resolving runs the done hooks (success only, registration order) and
/// records the end timestamp. A second resolution is a protocol
/// violation: it is logged and ignored, and the hooks do not run again.
pub struct Completion {
    fired: AtomicBool,
    ended: Mutex<Option<Instant>>,
    hooks: Mutex<Vec<DoneHook>>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            ended: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a done hook. Hooks run in registration order.
    pub fn on_done(&self, hook: DoneHook) {
        self.hooks.lock().expect("completion hooks poisoned").push(hook);
    }

    /// Resolve the completion. Returns false (and does nothing) when it
    /// was already resolved.
    pub fn resolve(&self, result: &EngineResult<StepOutcome>) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::warn!("instruction completion resolved twice; ignoring");
            return false;
        }
        *self.ended.lock().expect("completion timing poisoned") = Some(Instant::now());
        if let Ok(outcome) = result {
            let hooks = std::mem::take(&mut *self.hooks.lock().expect("completion hooks poisoned"));
            for hook in hooks {
                hook(outcome);
            }
        }
        true
    }

    /// When the instruction finished, if it has.
    pub fn ended(&self) -> Option<Instant> {
        *self.ended.lock().expect("completion timing poisoned")
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Creation/start timestamps of an instruction.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub created: Instant,
    pub started: Option<Instant>,
}

impl Timings {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            started: None,
        }
    }
}

/// One deferred unit of work.
pub struct Instruction {
    command: Command,
    timings: Timings,
    completion: Completion,
}

impl Instruction {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            timings: Timings::new(),
            completion: Completion::new(),
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Register a hook to run after this instruction succeeds.
    pub fn on_done(&self, hook: DoneHook) {
        self.completion.on_done(hook);
    }

    /// Split into the pieces the executor needs.
    pub(crate) fn into_parts(self) -> (Command, Timings, Completion) {
        (self.command, self.timings, self.completion)
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruction")
            .field("command", &self.command.name())
            .field("created", &self.timings.created)
            .finish()
    }
}

/// A lane's private instruction queue.
///
/// Cloning yields another handle to the same queue; handles exist only so
/// that abort can clear pools it does not drain. Cleared pools are never
/// resumed.
#[derive(Clone, Default)]
pub struct Pool {
    inner: Arc<Mutex<VecDeque<Instruction>>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the tail.
    pub fn push(&self, instruction: Instruction) {
        self.inner.lock().expect("pool poisoned").push_back(instruction);
    }

    /// Enqueue at the head, ahead of all pending work.
    pub fn unshift(&self, instruction: Instruction) {
        self.inner.lock().expect("pool poisoned").push_front(instruction);
    }

    /// Dequeue from the head.
    pub fn shift(&self) -> Option<Instruction> {
        self.inner.lock().expect("pool poisoned").pop_front()
    }

    /// Drop every pending instruction.
    pub fn clear(&self) {
        self.inner.lock().expect("pool poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("len", &self.len()).finish()
    }
}

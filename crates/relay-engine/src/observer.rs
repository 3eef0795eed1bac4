//! The event surface — a closed set of run notifications.
//!
//! Every trigger the engine can emit is a method on [`Observer`], so an
//! unknown trigger name is unrepresentable. All methods default to
//! no-ops; implementors override what they care about. Every method
//! receives the error (if any) and the cursor snapshot of the emitting
//! step first, then component-specific arguments.

use std::time::Duration;

use relay_types::{CursorSnapshot, Item, ScriptResult};

use crate::error::EngineError;

/// Receiver for run notifications.
#[allow(unused_variables)]
pub trait Observer: Send + Sync {
    /// The run started.
    fn start(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {}

    /// An iteration is about to start.
    fn before_iteration(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {}

    /// An iteration finished.
    fn iteration(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {}

    /// An item is about to run.
    fn before_item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, item: &Item) {}

    /// An item finished (all three chain stages done).
    fn item(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, item: &Item) {}

    /// Prerequest hooks are about to run.
    fn before_prerequest(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        item: &Item,
    ) {
    }

    /// Prerequest hooks finished.
    fn prerequest(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        item: &Item,
        results: &[ScriptResult],
    ) {
    }

    /// Test hooks are about to run.
    fn before_test(&self, error: Option<&EngineError>, cursor: &CursorSnapshot, item: &Item) {}

    /// Test hooks finished.
    fn test(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        item: &Item,
        results: &[ScriptResult],
    ) {
    }

    /// The run paused.
    fn pause(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {}

    /// The run resumed.
    fn resume(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {}

    /// The run was aborted.
    fn abort(&self, error: Option<&EngineError>, cursor: &CursorSnapshot) {}

    /// A scheduled wait started (`waiting = true`) or ended.
    fn wait_state_change(
        &self,
        error: Option<&EngineError>,
        cursor: &CursorSnapshot,
        waiting: bool,
        duration: Duration,
    ) {
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

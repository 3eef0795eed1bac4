//! Control commands — pause, resume, abort, and timed delays.
//!
//! Pause parks the draining lane on a one-shot resume channel; resume
//! fires it from an `immediate` execution that bypasses the pools. Abort
//! is a direct operation: it clears every reachable pool, releases a
//! parked pause, and emits its notification exactly once — in-flight
//! work finishes, nothing further starts.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};
use crate::instruction::{Command, DelayStep, Instruction, StepOutcome};
use crate::run::{Lane, Run};

impl Run {
    /// Request a pause. The pause instruction jumps ahead of all queued
    /// work; whatever is mid-flight finishes, then the lane parks.
    pub fn pause(&self) -> EngineResult<()> {
        {
            let mut state = self.shared.pause.lock().expect("pause state poisoned");
            if state.flagged || state.resume_tx.is_some() {
                return Err(EngineError::AlreadyPaused);
            }
            state.flagged = true;
        }
        tracing::debug!("pause requested");
        match self.shared.manager.get() {
            Some(manager) => manager.schedule(Command::Pause, true)?,
            None => self.interrupt(Command::Pause),
        }
        Ok(())
    }

    /// Request a resume. Executes on the next tick, bypassing the pools
    /// (the pools are blocked behind the parked pause).
    pub fn resume(&self) -> EngineResult<()> {
        {
            let state = self.shared.pause.lock().expect("pause state poisoned");
            if !state.flagged && state.resume_tx.is_none() {
                return Err(EngineError::NotPaused);
            }
        }
        tracing::debug!("resume requested");
        self.immediate(Command::Resume);
        Ok(())
    }

    /// Abort the run. Idempotent; only the first call emits the abort
    /// notification. Always converges the drain to a clean finish.
    pub fn abort(&self) {
        let first = !self.shared.abort_notified.swap(true, Ordering::SeqCst);
        tracing::debug!(first, "abort requested");
        self.halt();
        if first {
            self.observer().abort(None, &self.snapshot());
        }
    }

    /// Stop anything further from starting: flag the run, clear every
    /// reachable pool, release a parked pause. Shared by abort and the
    /// global timeout.
    pub(crate) fn halt(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.default_lane.pool.clear();
        if let Some(manager) = self.shared.manager.get() {
            manager.clear_pools();
        }
        let mut state = self.shared.pause.lock().expect("pause state poisoned");
        state.flagged = false;
        // dropping the sender wakes a parked lane without a resume event
        state.resume_tx = None;
    }

    /// Processor for [`Command::Pause`]: stash the resume handle and park
    /// until it fires (or is dropped by abort/timeout).
    pub(crate) async fn pause_step(&self, lane: &Lane) -> EngineResult<StepOutcome> {
        let receiver = {
            let mut state = self.shared.pause.lock().expect("pause state poisoned");
            if state.flagged {
                let (tx, rx) = oneshot::channel();
                state.resume_tx = Some(tx);
                Some(rx)
            } else {
                // resumed (or aborted) before the pause was reached
                None
            }
        };
        if let Some(rx) = receiver {
            let coords = lane.snapshot();
            self.observer().pause(None, &coords);
            tracing::debug!("lane parked; waiting for resume");
            let _ = rx.await;
        }
        Ok(StepOutcome {
            coords: lane.snapshot(),
        })
    }

    /// Processor for [`Command::Resume`]: clear the paused flag and fire
    /// the stashed handle.
    pub(crate) async fn resume_step(&self, lane: &Lane) -> EngineResult<StepOutcome> {
        let sender = {
            let mut state = self.shared.pause.lock().expect("pause state poisoned");
            if !state.flagged && state.resume_tx.is_none() {
                return Err(EngineError::NotPaused);
            }
            state.flagged = false;
            state.resume_tx.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        let coords = lane.snapshot();
        self.observer().resume(None, &coords);
        Ok(StepOutcome { coords })
    }

    /// Processor for [`Command::Delay`]: wait, notify the wait-state
    /// transitions, then queue the follow-on command.
    pub(crate) async fn delay_step(&self, lane: &Lane, step: DelayStep) -> EngineResult<StepOutcome> {
        let coords = lane.snapshot();
        let observer = self.observer();
        observer.wait_state_change(None, &coords, true, step.duration);
        tokio::time::sleep(step.duration).await;
        observer.wait_state_change(None, &coords, false, step.duration);
        if let Some(then) = step.then {
            // cleared pools are never resumed
            if !self.aborted() {
                lane.pool.push(Instruction::new(*then));
            }
        }
        Ok(StepOutcome { coords })
    }

    /// Queue `command`, waiting `wait` first. A zero wait queues the
    /// command directly with no delay instruction at all.
    pub(crate) fn schedule_after(&self, lane: &Lane, wait: Duration, command: Command) {
        if wait.is_zero() {
            lane.pool.push(Instruction::new(command));
        } else {
            lane.pool.push(Instruction::new(Command::Delay(DelayStep {
                duration: wait,
                then: Some(Box::new(command)),
            })));
        }
    }
}

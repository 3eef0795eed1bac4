//! relay-engine: the execution scheduler at the core of relay.
//!
//! This crate provides:
//!
//! - **Cursor**: the position/iteration coordinate with derived boundary
//!   flags that every other component steers by
//! - **Instruction & Pool**: deferred units of work (a closed command
//!   enum) and the per-lane FIFO/priority queues that hold them
//! - **Run**: global state, the queue/interrupt/immediate scheduling
//!   primitives, and the single-lane drain loop
//! - **Partition**: concurrent lanes over slices of the iteration space,
//!   plus the priority lane that preempts them for control work
//! - **Waterfall**: the state machine sequencing prerequest → request →
//!   test per item, including jump ("set next request") routing
//! - **Control**: pause/resume/abort and timed delays
//! - **Collab**: the script-sandbox and transport seams, with scripted
//!   in-memory fakes for tests
//!
//! The scheduler is cooperative: lanes are tokio tasks, each strictly
//! sequential, and every instruction completion is deferred to the next
//! tick. Work itself (scripts, requests) happens in the collaborators;
//! this crate only sequences, interrupts, and parallelizes it.

pub mod collab;
mod control;
pub mod cursor;
pub mod error;
pub mod instruction;
pub mod observer;
pub mod partition;
pub mod run;
mod waterfall;

pub use collab::{ScriptRunner, Transport};
pub use cursor::{Advance, Cursor, SeekOutcome};
pub use error::{EngineError, EngineResult};
pub use instruction::{
    Command, Completion, DelayStep, Instruction, ItemStage, Pool, StepOutcome, WaterfallStep,
};
pub use observer::{NullObserver, Observer};
pub use partition::{lane_layouts, LaneLayout, Partition, PartitionManager};
pub use run::{DelayOptions, Run, RunCompletion, RunHandle, RunOptions, RunPlan};

// Re-export the data types embedders speak.
pub use relay_types as types;

//! Collaborator seams — the script sandbox and the network transport.
//!
//! The scheduler consumes both through narrow async traits; their
//! internals (sandboxing, HTTP) are out of scope. `testing` provides
//! queue-programmable in-memory fakes.

pub mod testing;

use async_trait::async_trait;
use relay_types::{ScriptJob, ScriptResult, TransportExchange, TransportJob};

use crate::error::EngineResult;

/// Executes an item's script hooks for one stage.
///
/// Returns one [`ScriptResult`] per hook, in execution order. A hook
/// whose script failed reports the failure in its result; an `Err` from
/// this trait means the sandbox itself broke and stops the lane.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, job: ScriptJob) -> EngineResult<Vec<ScriptResult>>;
}

/// Performs an item's request.
///
/// The engine never interprets the response body; it forwards the
/// exchange into the post-work script context.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, job: TransportJob) -> EngineResult<TransportExchange>;
}

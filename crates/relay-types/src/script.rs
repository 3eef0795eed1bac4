//! Data contract of the script collaborator.
//!
//! These types define what the engine hands a script sandbox and what it
//! expects back. The `ScriptRunner` trait itself lives in relay-engine
//! (it depends on async_trait and the engine's error type).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::DataRow;
use crate::item::{EventKind, Item, RequestSpec};
use crate::scope::VariableScope;
use crate::snapshot::CursorSnapshot;
use crate::transport::ResponseSpec;

/// The context snapshot a script executes against.
///
/// For prerequest hooks `response` is `None`; for test hooks it carries
/// the transport's response (when the request succeeded).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptContext {
    pub environment: VariableScope,
    pub globals: VariableScope,
    pub collection: VariableScope,
    pub locals: VariableScope,
    /// The current iteration's data row.
    pub data: DataRow,
    /// The request about to be sent (possibly already script-mutated).
    pub request: Option<RequestSpec>,
    /// The response, for post-work hooks.
    pub response: Option<ResponseSpec>,
}

/// Failure policies forwarded to the sandbox so it can shape its results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScriptPolicies {
    pub stop_on_script_error: bool,
    pub stop_on_failure: bool,
    pub abort_on_failure: bool,
}

/// One unit of script work: run every hook of `kind` on `item`.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    /// Which stage's hooks to run.
    pub name: EventKind,
    /// The item the hooks belong to.
    pub item: Arc<Item>,
    /// Context snapshot the scripts execute against.
    pub context: ScriptContext,
    /// Coordinate of the step issuing this job.
    pub coords: CursorSnapshot,
    /// Failure policies in effect.
    pub policies: ScriptPolicies,
}

/// A single test assertion outcome reported by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A post-work routing directive left by a test script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextDirective {
    /// No directive was set; proceed linearly.
    #[default]
    Unset,
    /// Explicitly cleared ("null"): no redirect, proceed linearly.
    Continue,
    /// Redirect the next step to the named item (id, name, or position).
    Target(String),
}

impl NextDirective {
    pub fn is_set(&self) -> bool {
        !matches!(self, NextDirective::Unset)
    }
}

/// The fields a script run may have mutated.
///
/// `None` scopes mean "untouched"; `Some` replaces the lane's copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackedContext {
    pub environment: Option<VariableScope>,
    pub globals: Option<VariableScope>,
    pub collection: Option<VariableScope>,
    pub locals: Option<VariableScope>,
    /// The request, when a prerequest hook rewrote it.
    pub request: Option<RequestSpec>,
    /// Test assertion outcomes, in execution order.
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    /// Jump directive for the next scheduled item.
    #[serde(default)]
    pub next_request: NextDirective,
}

/// Result of one script hook execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptResult {
    /// Execution error, if the script itself failed.
    pub error: Option<String>,
    /// The possibly-mutated tracked context fields.
    pub context: TrackedContext,
}

impl ScriptResult {
    /// True when the script executed without error.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    /// True when every reported assertion passed.
    pub fn assertions_passed(&self) -> bool {
        self.context.assertions.iter().all(|a| a.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_is_unset() {
        let tracked = TrackedContext::default();
        assert_eq!(tracked.next_request, NextDirective::Unset);
        assert!(!tracked.next_request.is_set());
    }

    #[test]
    fn failed_assertion_is_detected() {
        let result = ScriptResult {
            error: None,
            context: TrackedContext {
                assertions: vec![
                    Assertion { name: "status ok".into(), passed: true, message: None },
                    Assertion { name: "body shape".into(), passed: false, message: Some("missing field".into()) },
                ],
                ..Default::default()
            },
        };
        assert!(result.ok());
        assert!(!result.assertions_passed());
    }
}

//! Work items — the request-like units a run executes.
//!
//! An item bundles a request specification with the script hooks that run
//! before (prerequest) and after (test) the request. The engine never
//! interprets the request or the scripts; both are forwarded to the
//! collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Which stage of an item's chain a script hook attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Pre-work: runs before the request is sent.
    Prerequest,
    /// Post-work: runs after the response arrives.
    Test,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Prerequest => write!(f, "prerequest"),
            EventKind::Test => write!(f, "test"),
        }
    }
}

/// A script hook attached to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHook {
    /// Stage this hook listens on.
    pub listen: EventKind,
    /// Script source, opaque to the engine.
    pub script: String,
}

/// A single header key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The request an item describes. Opaque to the scheduler; the transport
/// collaborator interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// HTTP method verb.
    pub method: String,
    /// Target URL, possibly containing variable placeholders the script
    /// collaborator has already resolved.
    pub url: String,
    /// Ordered header list.
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Optional body payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

impl RequestSpec {
    /// Create a request with no headers and no body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// One executable unit of a run: a named request plus its script hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, unique within a collection.
    pub id: String,
    /// Human-readable name. Jump directives may target it.
    pub name: String,
    /// The request to perform.
    pub request: RequestSpec,
    /// Script hooks, in declaration order.
    #[serde(default)]
    pub events: Vec<EventHook>,
}

impl Item {
    /// Create an item with no script hooks.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        request: RequestSpec,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            request,
            events: Vec::new(),
        }
    }

    /// Attach a script hook (builder style).
    pub fn on(mut self, listen: EventKind, script: impl Into<String>) -> Self {
        self.events.push(EventHook {
            listen,
            script: script.into(),
        });
        self
    }

    /// Hooks listening on the given stage, in declaration order.
    pub fn hooks(&self, kind: EventKind) -> impl Iterator<Item = &EventHook> {
        self.events.iter().filter(move |hook| hook.listen == kind)
    }
}

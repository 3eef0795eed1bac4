//! Data contract of the network transport collaborator.
//!
//! The engine does not interpret response bodies; it only forwards the
//! exchange into the post-work script context.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::data::DataRow;
use crate::item::{Header, Item, RequestSpec};
use crate::scope::VariableScope;
use crate::snapshot::CursorSnapshot;

/// One unit of transport work: perform the request of `item`.
#[derive(Debug, Clone)]
pub struct TransportJob {
    pub item: Arc<Item>,
    /// Environment scope at send time (read-only for the transport).
    pub environment: VariableScope,
    /// Globals scope at send time (read-only for the transport).
    pub globals: VariableScope,
    /// The current iteration's data row.
    pub data: DataRow,
    /// Coordinate of the step issuing this job.
    pub coords: CursorSnapshot,
}

/// The response half of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpec {
    /// HTTP status code.
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
    /// Wall-clock time of the exchange, in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ResponseSpec {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
            elapsed_ms: 0,
        }
    }
}

/// A cookie captured during the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

/// Everything a completed request produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportExchange {
    /// The request as actually sent.
    pub request: RequestSpec,
    pub response: ResponseSpec,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
}

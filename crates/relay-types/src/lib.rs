//! Pure data types for relay — items, variable scopes, cursor snapshots,
//! and the data contracts of the script/transport collaborators.
//!
//! This crate is a leaf dependency with no async runtime and no I/O. It
//! exists so that collaborator implementations (script sandboxes, HTTP
//! transports, reporters) can speak relay's type system without pulling
//! in relay-engine's scheduler machinery.

pub mod data;
pub mod item;
pub mod scope;
pub mod script;
pub mod snapshot;
pub mod transport;

// Flat re-exports for convenience
pub use data::*;
pub use item::*;
pub use scope::*;
pub use script::*;
pub use snapshot::*;
pub use transport::*;

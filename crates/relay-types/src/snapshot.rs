//! CursorSnapshot — the immutable, observable shape of a cursor.
//!
//! Every event the engine emits carries one of these. The boundary flags
//! (`empty`, `bof`, `eof`, `cr`) are derived from the raw coordinate at
//! snapshot time, never stored.

use serde::{Deserialize, Serialize};

/// An immutable coordinate within an item list and cycle count.
///
/// `position` indexes the item list, `iteration` indexes the cycle.
/// `ref` is an opaque token identifying the cursor instance that produced
/// the snapshot, for correlating events from the same run or lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorSnapshot {
    /// 0-based index into the item list.
    pub position: usize,
    /// 0-based cycle index.
    pub iteration: usize,
    /// Item-list size.
    pub length: usize,
    /// Total iteration count.
    pub cycles: usize,
    /// True when the item list is empty.
    pub empty: bool,
    /// End of file: no further work remains in any iteration.
    pub eof: bool,
    /// Beginning of file: nothing has run yet.
    pub bof: bool,
    /// Carriage return: this coordinate starts a new iteration.
    pub cr: bool,
    /// Opaque token of the producing cursor instance.
    #[serde(rename = "ref")]
    pub r#ref: String,
    /// Lane ordinal, when this cursor belongs to a partition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_index: Option<usize>,
    /// Lane-local cycle count, when this cursor belongs to a partition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_cycles: Option<usize>,
}

impl CursorSnapshot {
    /// Build a snapshot from a raw coordinate, deriving the boundary flags.
    pub fn from_parts(
        position: usize,
        iteration: usize,
        length: usize,
        cycles: usize,
        r#ref: impl Into<String>,
    ) -> Self {
        let empty = length == 0;
        Self {
            position,
            iteration,
            length,
            cycles,
            empty,
            bof: empty || (position == 0 && iteration == 0),
            eof: empty || (position >= length && iteration >= cycles),
            cr: empty || position >= length,
            r#ref: r#ref.into(),
            partition_index: None,
            partition_cycles: None,
        }
    }

    /// Attach partition metadata to the snapshot.
    pub fn with_partition(mut self, index: usize, cycles: usize) -> Self {
        self.partition_index = Some(index);
        self.partition_cycles = Some(cycles);
        self
    }
}

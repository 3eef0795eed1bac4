//! Iteration data — one key/value row per cycle.
//!
//! Read-only after run start. When a run has more iterations than rows,
//! the last row is reused for the remainder.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The variables one iteration reads from its data file.
pub type DataRow = HashMap<String, JsonValue>;

/// Ordered per-iteration data rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterationData {
    rows: Vec<DataRow>,
}

impl IterationData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<DataRow>) -> Self {
        Self { rows }
    }

    /// The row for the given iteration, clamped to the last row when the
    /// run outlives the data. `None` only when there is no data at all.
    pub fn row(&self, iteration: usize) -> Option<&DataRow> {
        self.rows.get(iteration).or_else(|| self.rows.last())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str, value: JsonValue) -> DataRow {
        let mut map = DataRow::new();
        map.insert(key.to_string(), value);
        map
    }

    #[test]
    fn rows_index_by_iteration() {
        let data = IterationData::from_rows(vec![row("n", json!(0)), row("n", json!(1))]);
        assert_eq!(data.row(0).unwrap()["n"], json!(0));
        assert_eq!(data.row(1).unwrap()["n"], json!(1));
    }

    #[test]
    fn overflow_clamps_to_last_row() {
        let data = IterationData::from_rows(vec![row("n", json!(0)), row("n", json!(1))]);
        assert_eq!(data.row(7).unwrap()["n"], json!(1));
    }

    #[test]
    fn empty_data_has_no_rows() {
        assert!(IterationData::new().row(0).is_none());
    }
}

//! Cursor — the mutable position/iteration handle every component steers by.
//!
//! A cursor tracks a coordinate `(position, iteration)` inside an item
//! list of `length` items repeated for `cycles` iterations. Reads hand out
//! immutable [`CursorSnapshot`]s with derived boundary flags; mutation
//! goes exclusively through `seek`/`next`/`bounds`/`reset`/`zero`/`clear`.
//! Out-of-range seeks are rejected, never clamped.

use std::hash::{BuildHasher, Hasher};
use std::time::SystemTime;

use relay_types::CursorSnapshot;

use crate::error::{EngineError, EngineResult};

/// Outcome of an advance (`next`/`whatnext`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    /// The coordinate after the advance. At end-of-file this is the last
    /// valid coordinate, not a past-the-end one.
    pub coords: CursorSnapshot,
    /// Whether the coordinate differs from the starting one.
    pub changed: bool,
    /// This advance starts a new iteration.
    pub cr: bool,
    /// No further work remains in any iteration.
    pub eof: bool,
}

/// Outcome of a signed seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekOutcome {
    /// Whether the coordinate changed.
    pub changed: bool,
    /// The seek was given position `-1` and normalized it to the start.
    pub to_start: bool,
}

/// Mutable coordinate within an item list and cycle count.
#[derive(Debug, Clone)]
pub struct Cursor {
    position: usize,
    iteration: usize,
    length: usize,
    cycles: usize,
    partition_index: Option<usize>,
    partition_cycles: Option<usize>,
    token: String,
}

impl Cursor {
    /// Create a cursor at the origin. A `cycles` of 0 is normalized to 1;
    /// a run always has at least one cycle.
    pub fn new(length: usize, cycles: usize) -> Self {
        Self {
            position: 0,
            iteration: 0,
            length,
            cycles: cycles.max(1),
            partition_index: None,
            partition_cycles: None,
            token: cursor_token(),
        }
    }

    /// Create a cursor at an explicit coordinate.
    pub fn with_position(
        length: usize,
        cycles: usize,
        position: usize,
        iteration: usize,
    ) -> EngineResult<Self> {
        let mut cursor = Self::new(length, cycles);
        if position != 0 || iteration != 0 {
            cursor.seek(position, iteration)?;
        }
        Ok(cursor)
    }

    /// Create a lane cursor: starts at `(0, start_iteration)`, ends when
    /// `end_cycle` iterations have run, and carries partition metadata in
    /// every snapshot.
    pub(crate) fn for_partition(
        length: usize,
        end_cycle: usize,
        start_iteration: usize,
        index: usize,
        lane_cycles: usize,
    ) -> Self {
        let mut cursor = Self::new(length, end_cycle);
        cursor.iteration = start_iteration.min(cursor.cycles - 1);
        cursor.partition_index = Some(index);
        cursor.partition_cycles = Some(lane_cycles);
        cursor
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// The opaque token identifying this cursor instance.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// An immutable snapshot with derived boundary flags.
    pub fn snapshot(&self) -> CursorSnapshot {
        let mut snap = CursorSnapshot::from_parts(
            self.position,
            self.iteration,
            self.length,
            self.cycles,
            self.token.clone(),
        );
        snap.partition_index = self.partition_index;
        snap.partition_cycles = self.partition_cycles;
        snap
    }

    /// Move to an absolute coordinate. Rejects out-of-bounds targets
    /// without mutating. Returns whether the coordinate changed.
    pub fn seek(&mut self, position: usize, iteration: usize) -> EngineResult<bool> {
        if position >= self.length || iteration >= self.cycles {
            return Err(EngineError::CursorOutOfBounds {
                position: position as i64,
                iteration: iteration as i64,
                length: self.length,
                cycles: self.cycles,
            });
        }
        let changed = position != self.position || iteration != self.iteration;
        self.position = position;
        self.iteration = iteration;
        Ok(changed)
    }

    /// Signed seek used by jump routing: a position of `-1` normalizes to
    /// the start of the iteration and reports `to_start`.
    pub fn seek_signed(&mut self, position: i64, iteration: i64) -> EngineResult<SeekOutcome> {
        let to_start = position == -1;
        if position < -1 || iteration < 0 {
            return Err(EngineError::CursorOutOfBounds {
                position,
                iteration,
                length: self.length,
                cycles: self.cycles,
            });
        }
        let target = if to_start { 0 } else { position as usize };
        let changed = self.seek(target, iteration as usize)?;
        Ok(SeekOutcome { changed, to_start })
    }

    /// Advance by one step, rolling over into the next iteration at the
    /// end of the item list. At end-of-file the cursor stays at its last
    /// valid coordinate.
    pub fn next(&mut self) -> Advance {
        let current = self.snapshot();
        let advance = Self::whatnext(&current);
        if advance.eof {
            // clamp instead of walking past the end
            self.position = self.length.saturating_sub(1);
            self.iteration = self.cycles.saturating_sub(1);
        } else {
            self.position = advance.coords.position;
            self.iteration = advance.coords.iteration;
        }
        Advance {
            coords: self.snapshot(),
            ..advance
        }
    }

    /// Pure preview of what [`Cursor::next`] would produce from an
    /// arbitrary coordinate. Mirrors `next` exactly, including the eof
    /// clamp.
    pub fn whatnext(coords: &CursorSnapshot) -> Advance {
        if coords.length == 0 {
            return Advance {
                coords: coords.clone(),
                changed: false,
                cr: false,
                eof: true,
            };
        }
        let mut position = coords.position + 1;
        let mut iteration = coords.iteration;
        let mut cr = false;
        if position >= coords.length {
            position = 0;
            iteration += 1;
            cr = true;
        }
        if cr && iteration >= coords.cycles {
            let clamped = project(coords, coords.length - 1, coords.cycles - 1);
            let changed =
                clamped.position != coords.position || clamped.iteration != coords.iteration;
            return Advance {
                coords: clamped,
                changed,
                cr: false,
                eof: true,
            };
        }
        Advance {
            coords: project(coords, position, iteration),
            changed: true,
            cr,
            eof: false,
        }
    }

    /// Rebind the dimensional limits without resetting the coordinate.
    /// Shrinking bounds past the coordinate pulls it back into range.
    pub fn bounds(&mut self, length: usize, cycles: usize) {
        self.length = length;
        self.cycles = cycles.max(1);
        if self.length == 0 {
            self.position = 0;
        } else if self.position >= self.length {
            self.position = self.length - 1;
        }
        if self.iteration >= self.cycles {
            self.iteration = self.cycles - 1;
        }
    }

    /// Reinitialize with new bounds and coordinate. Regenerates the
    /// instance token.
    pub fn reset(
        &mut self,
        length: usize,
        cycles: usize,
        position: usize,
        iteration: usize,
    ) -> EngineResult<()> {
        let replacement = Self::with_position(length, cycles, position, iteration)?;
        self.position = replacement.position;
        self.iteration = replacement.iteration;
        self.length = replacement.length;
        self.cycles = replacement.cycles;
        self.token = replacement.token;
        Ok(())
    }

    /// Move back to the origin, keeping bounds and token.
    pub fn zero(&mut self) {
        self.position = 0;
        self.iteration = 0;
    }

    /// Full reinitialization to an empty cursor. Regenerates the token.
    pub fn clear(&mut self) {
        self.position = 0;
        self.iteration = 0;
        self.length = 0;
        self.cycles = 1;
        self.partition_index = None;
        self.partition_cycles = None;
        self.token = cursor_token();
    }
}

/// Project a coordinate onto a snapshot, keeping bounds, token, and
/// partition metadata.
fn project(coords: &CursorSnapshot, position: usize, iteration: usize) -> CursorSnapshot {
    let mut snap = CursorSnapshot::from_parts(
        position,
        iteration,
        coords.length,
        coords.cycles,
        coords.r#ref.clone(),
    );
    snap.partition_index = coords.partition_index;
    snap.partition_cycles = coords.partition_cycles;
    snap
}

/// Generate an opaque cursor token using RandomState + SystemTime.
fn cursor_token() -> String {
    let state = std::collections::hash_map::RandomState::new();
    let mut hasher = state.build_hasher();
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    hasher.write_u128(now.as_nanos());
    format!("{:016x}", hasher.finish())
}

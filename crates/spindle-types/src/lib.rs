#![forbid(unsafe_code)]
//! Shared value types for the Spindle workspace.
//!
//! Id newtypes, block runs, the cyclic unit arithmetic every component
//! leans on, and the simulation-wide constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Constants ───────────────────────────────────────────────────────────────

/// Copies kept per object, each on a distinct disk.
pub const REPLICA_COUNT: usize = 3;

/// Steps aggregated into one frequency-table slice.
pub const SLICE_LEN: u32 = 1800;

/// Steps appended after the declared horizon so in-flight work can drain.
pub const EXTRA_STEPS: u32 = 105;

/// Token cost of a READ when the previous action was not a READ.
pub const READ_BASE_COST: u32 = 64;

/// Floor of the consecutive-READ decay.
pub const READ_MIN_COST: u32 = 16;

/// Planner page size in units.
pub const PAGE_UNITS: u32 = 21;

/// Load-spread pivot for replica selection.
pub const LOAD_SPREAD_THRESHOLD: f64 = 0.65;

/// Next READ cost under the decay rule: `max(16, ceil(prev * 0.8))`.
#[must_use]
pub fn decayed_read_cost(prev: u32) -> u32 {
    READ_MIN_COST.max(prev.saturating_mul(4).div_ceil(5))
}

// ── Id newtypes ─────────────────────────────────────────────────────────────

/// Disk identifier in `[1, N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskId(pub u32);

impl DiskId {
    /// Zero-based index for dense per-disk tables.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit position on a disk in `[1, V]`. Unit space is cyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitPos(pub u32);

impl UnitPos {
    /// Zero-based index for dense per-unit tables.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for UnitPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object category in `[1, M]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Zero-based index for dense per-category tables.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Block runs ──────────────────────────────────────────────────────────────

/// A contiguous run of units holding part of one replica.
///
/// A run never wraps: `start + len - 1 <= V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRun {
    pub start: UnitPos,
    pub len: u32,
}

impl BlockRun {
    /// Iterate the unit positions covered by this run, in order.
    pub fn units(&self) -> impl Iterator<Item = UnitPos> + '_ {
        (self.start.0..self.start.0 + self.len).map(UnitPos)
    }

    /// Last unit position covered by this run.
    #[must_use]
    pub fn end(&self) -> UnitPos {
        UnitPos(self.start.0 + self.len - 1)
    }
}

/// Possibly fragmented sequence of runs describing one replica placement.
///
/// Run order is allocation order: the k-th unit across the runs carries
/// intra-object ordinal k.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockList(pub Vec<BlockRun>);

impl BlockList {
    /// Total units across all runs.
    #[must_use]
    pub fn total_len(&self) -> u32 {
        self.0.iter().map(|r| r.len).sum()
    }

    /// Iterate every unit position in intra-object ordinal order.
    pub fn units(&self) -> impl Iterator<Item = UnitPos> + '_ {
        self.0.iter().flat_map(BlockRun::units)
    }

    /// First run of the list, if any.
    #[must_use]
    pub fn first_run(&self) -> Option<BlockRun> {
        self.0.first().copied()
    }
}

// ── Planner ranges ──────────────────────────────────────────────────────────

/// Contiguous `(start, end, tag)` record on a disk. Immutable after
/// preprocessing; bounds are 1-based inclusive unit positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRange {
    pub start: UnitPos,
    pub end: UnitPos,
    pub tag: Tag,
}

impl TagRange {
    /// Units covered by the range.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.end.0 - self.start.0 + 1
    }

    #[must_use]
    pub fn contains(&self, u: UnitPos) -> bool {
        (self.start.0..=self.end.0).contains(&u.0)
    }
}

// ── Cyclic unit arithmetic ──────────────────────────────────────────────────

/// Forward cyclic distance from `from` to `to` on a disk of `v` units.
///
/// Zero when `from == to`; the head only moves forward.
#[must_use]
pub fn cyclic_distance(v: u32, from: UnitPos, to: UnitPos) -> u32 {
    if to.0 >= from.0 {
        to.0 - from.0
    } else {
        v - from.0 + to.0
    }
}

/// Advance `pos` by `steps` units, wrapping past `v` back to 1.
#[must_use]
pub fn cyclic_advance(v: u32, pos: UnitPos, steps: u32) -> UnitPos {
    UnitPos((pos.0 - 1 + steps) % v + 1)
}

// ── Configuration header ────────────────────────────────────────────────────

/// The five integers of the configuration header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Declared step horizon T.
    pub steps: u32,
    /// Category count M.
    pub categories: u32,
    /// Disk count N.
    pub disks: u32,
    /// Units per disk V.
    pub units_per_disk: u32,
    /// Head token budget per step G.
    pub tokens_per_step: u32,
}

impl SimConfig {
    /// Validate the header values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps == 0
            || self.categories == 0
            || self.disks == 0
            || self.units_per_disk == 0
            || self.tokens_per_step == 0
        {
            return Err(ConfigError::ZeroParameter);
        }
        if self.disks < REPLICA_COUNT as u32 {
            return Err(ConfigError::TooFewDisks { disks: self.disks });
        }
        Ok(())
    }

    /// Number of frequency-table slices: `ceil(T / SLICE_LEN)`.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.steps.div_ceil(SLICE_LEN) as usize
    }

    /// Steps actually simulated: `T + EXTRA_STEPS`.
    #[must_use]
    pub fn total_steps(&self) -> u32 {
        self.steps + EXTRA_STEPS
    }

    /// True when `d` names a disk of this configuration.
    #[must_use]
    pub fn disk_in_range(&self, d: DiskId) -> bool {
        (1..=self.disks).contains(&d.0)
    }

    /// True when `tag` names a category of this configuration.
    #[must_use]
    pub fn tag_in_range(&self, tag: Tag) -> bool {
        (1..=self.categories).contains(&tag.0)
    }

    /// True when `u` names a unit of this configuration.
    #[must_use]
    pub fn unit_in_range(&self, u: UnitPos) -> bool {
        (1..=self.units_per_disk).contains(&u.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration header contains a zero parameter")]
    ZeroParameter,
    #[error("{disks} disks cannot hold {REPLICA_COUNT} replicas per object")]
    TooFewDisks { disks: u32 },
}

// ── Tests ───────────────────────────────────────────────────────────────────

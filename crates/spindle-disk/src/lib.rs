#![forbid(unsafe_code)]
//! Per-disk unit grid and allocation.
//!
//! `DiskMap` owns the `N x V` unit grid. Each unit is either free or
//! holds the intra-object ordinal assigned at write time. Allocation
//! prefers the planner's category ranges (contiguous first, fragmented
//! second) and falls back to whole-disk placement; free counts are
//! cached per disk and per `(disk, category)` so placement decisions
//! never rescan the grid.

use spindle_error::{Result, SimError};
use spindle_types::{BlockList, BlockRun, DiskId, SimConfig, Tag, TagRange, UnitPos};

// ── DiskMap ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiskMap {
    n: u32,
    v: u32,
    /// `units[disk][unit]` is the intra-object ordinal, `None` when free.
    units: Vec<Vec<Option<u32>>>,
    /// Cached free-unit count per disk.
    free: Vec<u32>,
    /// Cached free-unit count per `(disk, category)` inside that
    /// category's preallocated ranges.
    tag_free: Vec<Vec<u32>>,
    /// Planner ranges per disk, ordered by start unit.
    ranges: Vec<Vec<TagRange>>,
}

impl DiskMap {
    /// Build the grid from the planner's per-disk range tables.
    #[must_use]
    pub fn new(cfg: &SimConfig, ranges: Vec<Vec<TagRange>>) -> Self {
        let n = cfg.disks;
        let v = cfg.units_per_disk;
        let m = cfg.categories as usize;

        let mut tag_free = vec![vec![0u32; m]; n as usize];
        for (d, disk_ranges) in ranges.iter().enumerate() {
            debug_assert!(
                disk_ranges.windows(2).all(|w| w[0].end.0 < w[1].start.0),
                "planner ranges must be ordered and disjoint"
            );
            for r in disk_ranges {
                tag_free[d][r.tag.index()] += r.len();
            }
        }

        Self {
            n,
            v,
            units: vec![vec![None; v as usize]; n as usize],
            free: vec![v; n as usize],
            tag_free,
            ranges,
        }
    }

    // ── Observers ───────────────────────────────────────────────────────

    #[must_use]
    pub fn disk_count(&self) -> u32 {
        self.n
    }

    #[must_use]
    pub fn unit_count(&self) -> u32 {
        self.v
    }

    /// Free units on disk `d`.
    #[must_use]
    pub fn free_count(&self, d: DiskId) -> u32 {
        self.free[d.index()]
    }

    /// Free units inside `tag`'s preallocated ranges on disk `d`.
    #[must_use]
    pub fn tag_free(&self, d: DiskId, tag: Tag) -> u32 {
        self.tag_free[d.index()][tag.index()]
    }

    /// Allocated units on disk `d`.
    #[must_use]
    pub fn load(&self, d: DiskId) -> u32 {
        self.v - self.free[d.index()]
    }

    #[must_use]
    pub fn is_free(&self, d: DiskId, u: UnitPos) -> bool {
        self.units[d.index()][u.index()].is_none()
    }

    /// Intra-object ordinal stored in the unit, `None` when free.
    #[must_use]
    pub fn ordinal(&self, d: DiskId, u: UnitPos) -> Option<u32> {
        self.units[d.index()][u.index()]
    }

    /// The planner ranges of disk `d`, ordered by start unit.
    #[must_use]
    pub fn disk_ranges(&self, d: DiskId) -> &[TagRange] {
        &self.ranges[d.index()]
    }

    /// Disk ids ordered by descending free space (least loaded first),
    /// ties by ascending id, truncated to `count`.
    #[must_use]
    pub fn least_loaded(&self, count: usize) -> Vec<DiskId> {
        let mut disks: Vec<DiskId> = (1..=self.n).map(DiskId).collect();
        disks.sort_by(|a, b| {
            self.free[b.index()]
                .cmp(&self.free[a.index()])
                .then(a.0.cmp(&b.0))
        });
        disks.truncate(count);
        disks
    }

    /// The category whose preallocated range contains `u`, if any.
    #[must_use]
    pub fn containing_tag(&self, d: DiskId, u: UnitPos) -> Option<Tag> {
        let ranges = &self.ranges[d.index()];
        let i = ranges.partition_point(|r| r.end.0 < u.0);
        ranges.get(i).filter(|r| r.contains(u)).map(|r| r.tag)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate `size` units for `tag` inside its preallocated ranges on
    /// disk `d`.
    ///
    /// A single contiguous run is preferred; when no range holds one,
    /// free runs are accumulated across the category's ranges in
    /// traversal order. Intra-object ordinals are assigned 0, 1, 2, ...
    /// in that order.
    pub fn allocate_for(&mut self, d: DiskId, size: u32, tag: Tag) -> Result<BlockList> {
        debug_assert!(size > 0);
        if self.tag_free(d, tag) < size {
            return Err(SimError::NoSpace { disk: d, size });
        }

        // Contiguous pass: first range with a free run of the full size.
        for i in 0..self.ranges[d.index()].len() {
            let r = self.ranges[d.index()][i];
            if r.tag != tag {
                continue;
            }
            if let Some(start) = self.find_run(d, r.start, r.end, size) {
                let run = BlockRun { start, len: size };
                self.mark_allocated(d, run, 0);
                self.free[d.index()] -= size;
                self.tag_free[d.index()][tag.index()] -= size;
                return Ok(BlockList(vec![run]));
            }
        }

        // Fragmented pass: greedily take free runs in traversal order.
        let mut runs: Vec<BlockRun> = Vec::new();
        let mut remaining = size;
        'ranges: for i in 0..self.ranges[d.index()].len() {
            let r = self.ranges[d.index()][i];
            if r.tag != tag {
                continue;
            }
            let mut pos = r.start.0;
            while pos <= r.end.0 && remaining > 0 {
                if self.units[d.index()][(pos - 1) as usize].is_none() {
                    let run_start = pos;
                    while pos <= r.end.0
                        && remaining > 0
                        && self.units[d.index()][(pos - 1) as usize].is_none()
                    {
                        remaining -= 1;
                        pos += 1;
                    }
                    let run = BlockRun {
                        start: UnitPos(run_start),
                        len: pos - run_start,
                    };
                    self.mark_allocated(d, run, size - remaining - run.len);
                    runs.push(run);
                    if remaining == 0 {
                        break 'ranges;
                    }
                } else {
                    pos += 1;
                }
            }
        }

        if remaining == 0 {
            self.free[d.index()] -= size;
            self.tag_free[d.index()][tag.index()] -= size;
            Ok(BlockList(runs))
        } else {
            // The cached counter promised space the scan did not find;
            // roll the partial marks back.
            for run in &runs {
                self.unmark(d, *run);
            }
            Err(SimError::NoSpace { disk: d, size })
        }
    }

    /// Allocate `size` units anywhere on disk `d`, ignoring category
    /// tagging. Units landing inside a preallocated range still debit
    /// that category's free counter.
    pub fn allocate_anywhere(&mut self, d: DiskId, size: u32) -> Result<BlockList> {
        debug_assert!(size > 0);
        if self.free_count(d) < size {
            return Err(SimError::NoSpace { disk: d, size });
        }

        let list = if let Some(start) = self.find_run(d, UnitPos(1), UnitPos(self.v), size) {
            let run = BlockRun { start, len: size };
            self.mark_allocated(d, run, 0);
            BlockList(vec![run])
        } else {
            let mut runs: Vec<BlockRun> = Vec::new();
            let mut remaining = size;
            let mut pos = 1u32;
            while pos <= self.v && remaining > 0 {
                if self.units[d.index()][(pos - 1) as usize].is_none() {
                    let run_start = pos;
                    while pos <= self.v
                        && remaining > 0
                        && self.units[d.index()][(pos - 1) as usize].is_none()
                    {
                        remaining -= 1;
                        pos += 1;
                    }
                    let run = BlockRun {
                        start: UnitPos(run_start),
                        len: pos - run_start,
                    };
                    self.mark_allocated(d, run, size - remaining - run.len);
                    runs.push(run);
                } else {
                    pos += 1;
                }
            }
            debug_assert_eq!(remaining, 0, "free counter out of sync with grid");
            BlockList(runs)
        };

        self.free[d.index()] -= size;
        for u in list.units() {
            if let Some(tag) = self.containing_tag(d, u) {
                self.tag_free[d.index()][tag.index()] -= 1;
            }
        }
        tracing::trace!(
            target: "spindle::disk",
            disk = d.0,
            size,
            runs = list.0.len(),
            "untyped allocation"
        );
        Ok(list)
    }

    /// Release every unit of `blocks` on disk `d`, restoring the per-disk
    /// and per-category free counters.
    pub fn free(&mut self, d: DiskId, blocks: &BlockList) {
        let mut freed = 0u32;
        for u in blocks.units() {
            let slot = &mut self.units[d.index()][u.index()];
            debug_assert!(slot.is_some(), "freeing unallocated unit {u} on disk {d}");
            if slot.take().is_some() {
                freed += 1;
                if let Some(tag) = self.containing_tag(d, u) {
                    self.tag_free[d.index()][tag.index()] += 1;
                }
            }
        }
        self.free[d.index()] += freed;
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// First position in `[start, end]` opening a run of `size`
    /// consecutive free units, scanning forward.
    fn find_run(&self, d: DiskId, start: UnitPos, end: UnitPos, size: u32) -> Option<UnitPos> {
        let grid = &self.units[d.index()];
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for pos in start.0..=end.0 {
            if grid[(pos - 1) as usize].is_none() {
                if run_len == 0 {
                    run_start = pos;
                }
                run_len += 1;
                if run_len == size {
                    return Some(UnitPos(run_start));
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Stamp a run's units with ordinals starting at `first_ordinal`.
    fn mark_allocated(&mut self, d: DiskId, run: BlockRun, first_ordinal: u32) {
        for (k, u) in run.units().enumerate() {
            let slot = &mut self.units[d.index()][u.index()];
            debug_assert!(slot.is_none());
            *slot = Some(first_ordinal + k as u32);
        }
    }

    fn unmark(&mut self, d: DiskId, run: BlockRun) {
        for u in run.units() {
            self.units[d.index()][u.index()] = None;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#![forbid(unsafe_code)]
//! Workload analysis and category placement planning.
//!
//! Consumes the per-category frequency tables once, at preprocessing time,
//! and produces everything the allocator and the request tracker need for
//! the rest of the run:
//!
//! 1. per-category peak live volume (allocation sizing),
//! 2. pairwise read correlation and per-category related lists
//!    (fallback allocation order, co-location),
//! 3. an immutable per-disk sequence of `(start, end, tag)` ranges laid
//!    out in pages so correlated categories sit adjacent and adjacent
//!    disks rotate their hot zones apart.

use serde::Serialize;
use spindle_error::{Result, SimError};
use spindle_types::{DiskId, PAGE_UNITS, SimConfig, Tag, TagRange, UnitPos};

// ── Frequency tables ────────────────────────────────────────────────────────

/// Per-category, per-slice aggregate sizes declared by the preprocessing
/// stream: deleted, written, and read units for each frequency slice.
#[derive(Debug, Clone)]
pub struct FrequencyTables {
    slices: usize,
    deletes: Vec<Vec<u64>>,
    writes: Vec<Vec<u64>>,
    reads: Vec<Vec<u64>>,
}

impl FrequencyTables {
    /// Build the tables, checking that all three are `M x slice_count`.
    pub fn new(
        cfg: &SimConfig,
        deletes: Vec<Vec<u64>>,
        writes: Vec<Vec<u64>>,
        reads: Vec<Vec<u64>>,
    ) -> Result<Self> {
        let m = cfg.categories as usize;
        let slices = cfg.slice_count();
        for (name, table) in [("delete", &deletes), ("write", &writes), ("read", &reads)] {
            if table.len() != m || table.iter().any(|row| row.len() != slices) {
                return Err(SimError::BadInput(format!(
                    "{name} frequency table is not {m} x {slices}"
                )));
            }
        }
        Ok(Self {
            slices,
            deletes,
            writes,
            reads,
        })
    }

    /// Tables with every cell zero, for workloads that declare nothing.
    #[must_use]
    pub fn empty(cfg: &SimConfig) -> Self {
        let m = cfg.categories as usize;
        let slices = cfg.slice_count();
        Self {
            slices,
            deletes: vec![vec![0; slices]; m],
            writes: vec![vec![0; slices]; m],
            reads: vec![vec![0; slices]; m],
        }
    }

    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices
    }
}

// ── Workload profile ────────────────────────────────────────────────────────

/// Analysis products derived from the frequency tables.
#[derive(Debug, Clone)]
struct WorkloadProfile {
    /// Max over slices of running written-minus-deleted volume, per
    /// category. Never negative.
    peak: Vec<u64>,
    /// Pairwise cosine similarity of per-slice read-rate vectors.
    correlation: Vec<Vec<f64>>,
    /// Per category, the other categories sorted by descending
    /// correlation (ties broken by ascending tag).
    related: Vec<Vec<Tag>>,
}

fn analyze(cfg: &SimConfig, tables: &FrequencyTables) -> WorkloadProfile {
    let m = cfg.categories as usize;
    let slices = tables.slices;

    let mut peak = vec![0u64; m];
    let mut rates: Vec<Vec<Option<f64>>> = vec![vec![None; slices]; m];
    for c in 0..m {
        let mut live = 0i64;
        let mut high = 0i64;
        for s in 0..slices {
            live += tables.writes[c][s] as i64;
            live -= tables.deletes[c][s] as i64;
            high = high.max(live);
            // Read rate is reads per live unit; undefined while nothing
            // is live, and skipped from the correlation in that case.
            if live > 0 {
                rates[c][s] = Some(tables.reads[c][s] as f64 / live as f64);
            }
        }
        peak[c] = high.max(0) as u64;
    }

    let mut correlation = vec![vec![0.0; m]; m];
    for a in 0..m {
        for b in a + 1..m {
            let r = cosine(&rates[a], &rates[b]);
            correlation[a][b] = r;
            correlation[b][a] = r;
        }
    }

    let mut related = Vec::with_capacity(m);
    for a in 0..m {
        let mut others: Vec<Tag> = (1..=m as u32).map(Tag).filter(|t| t.index() != a).collect();
        others.sort_by(|x, y| {
            correlation[a][y.index()]
                .partial_cmp(&correlation[a][x.index()])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(x.0.cmp(&y.0))
        });
        related.push(others);
    }

    WorkloadProfile {
        peak,
        correlation,
        related,
    }
}

/// Cosine similarity over the slice indices where both rates are defined.
fn cosine(a: &[Option<f64>], b: &[Option<f64>]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        if let (Some(x), Some(y)) = (x, y) {
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

// ── Placement plan ──────────────────────────────────────────────────────────

/// The planner's outputs, owned by the engine for the whole run.
#[derive(Debug, Clone)]
pub struct Planner {
    cfg: SimConfig,
    profile: WorkloadProfile,
    /// Per-disk ordered range table.
    ranges: Vec<Vec<TagRange>>,
    /// Per-category page budget, for inspection.
    page_budget: Vec<u32>,
}

impl Planner {
    /// Run the whole preprocessing pass: analysis plus page layout.
    #[must_use]
    pub fn preprocess(cfg: SimConfig, tables: &FrequencyTables) -> Self {
        let profile = analyze(&cfg, tables);
        let (ranges, page_budget) = lay_out(&cfg, &profile);

        let assigned: u32 = page_budget.iter().sum();
        tracing::info!(
            target: "spindle::planner",
            disks = cfg.disks,
            categories = cfg.categories,
            pages_per_disk = cfg.units_per_disk / PAGE_UNITS,
            pages_assigned = assigned,
            "placement plan ready"
        );

        Self {
            cfg,
            profile,
            ranges,
            page_budget,
        }
    }

    /// Peak live volume estimated for `tag`.
    #[must_use]
    pub fn peak(&self, tag: Tag) -> u64 {
        self.profile.peak[tag.index()]
    }

    /// Read correlation between two categories, in `[0, 1]`.
    #[must_use]
    pub fn correlation(&self, a: Tag, b: Tag) -> f64 {
        self.profile.correlation[a.index()][b.index()]
    }

    /// Other categories sorted by descending correlation with `tag`.
    #[must_use]
    pub fn related(&self, tag: Tag) -> &[Tag] {
        &self.profile.related[tag.index()]
    }

    /// The ordered range table of disk `d`.
    #[must_use]
    pub fn disk_ranges(&self, d: DiskId) -> &[TagRange] {
        &self.ranges[d.index()]
    }

    /// Pages assigned to `tag` across all disks.
    #[must_use]
    pub fn page_budget(&self, tag: Tag) -> u32 {
        self.page_budget[tag.index()]
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    /// Serializable summary for the inspection surface.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            pages_per_disk: self.cfg.units_per_disk / PAGE_UNITS,
            page_unit: PAGE_UNITS,
            peaks: self.profile.peak.clone(),
            page_budget: self.page_budget.clone(),
            related: self.profile.related.clone(),
            disks: self.ranges.clone(),
        }
    }
}

/// Human- and JSON-renderable view of the plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub pages_per_disk: u32,
    pub page_unit: u32,
    pub peaks: Vec<u64>,
    pub page_budget: Vec<u32>,
    pub related: Vec<Vec<Tag>>,
    pub disks: Vec<Vec<TagRange>>,
}

// ── Page layout ─────────────────────────────────────────────────────────────

/// Categories ordered by descending peak, ties by ascending tag.
fn tags_by_peak(m: usize, peak: &[u64]) -> Vec<Tag> {
    let mut tags: Vec<Tag> = (1..=m as u32).map(Tag).collect();
    tags.sort_by(|a, b| peak[b.index()].cmp(&peak[a.index()]).then(a.0.cmp(&b.0)));
    tags
}

/// Split `total` into `m` shares proportional to `weight`, exactly, using
/// largest remainders. Equal weights when every weight is zero.
fn proportional_shares(total: u32, weight: &[u64]) -> Vec<u32> {
    let m = weight.len();
    let sum: u64 = weight.iter().sum();
    if sum == 0 {
        let base = total / m as u32;
        let rem = (total % m as u32) as usize;
        return (0..m).map(|i| base + u32::from(i < rem)).collect();
    }

    let mut shares = vec![0u32; m];
    let mut fractions: Vec<(usize, f64)> = Vec::with_capacity(m);
    let mut assigned = 0u32;
    for (i, &w) in weight.iter().enumerate() {
        let ideal = w as f64 / sum as f64 * f64::from(total);
        let floor = ideal.floor() as u32;
        shares[i] = floor;
        assigned += floor;
        fractions.push((i, ideal - f64::from(floor)));
    }
    fractions.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let mut leftover = total - assigned;
    for (i, _) in fractions {
        if leftover == 0 {
            break;
        }
        shares[i] += 1;
        leftover -= 1;
    }
    shares
}

/// Build the per-disk range tables.
///
/// Pages are sized by peak live volume, every category gets one page on
/// every disk when capacity allows, residual pages go round-robin across
/// disks, and each disk lays its pages out through a rotation of the
/// peak-ordered category list starting at `(d - 1) mod M`.
fn lay_out(cfg: &SimConfig, profile: &WorkloadProfile) -> (Vec<Vec<TagRange>>, Vec<u32>) {
    let m = cfg.categories as usize;
    let n = cfg.disks as usize;
    let pages_per_disk = cfg.units_per_disk / PAGE_UNITS;
    let total_pages = pages_per_disk * cfg.disks;

    // One page of every category on every disk, capacity permitting.
    let guarantee: u32 = if total_pages >= (m * n) as u32 { 1 } else { 0 };
    let residual_total = total_pages - guarantee * (m * n) as u32;
    let residual = proportional_shares(residual_total, &profile.peak);
    let budget: Vec<u32> = residual
        .iter()
        .map(|r| r + guarantee * n as u32)
        .collect();

    // Residual pages round-robin across disks, in peak order, skipping
    // disks that are already full.
    let ordered = tags_by_peak(m, &profile.peak);
    let mut per_disk = vec![vec![guarantee; n]; m];
    let mut disk_fill = vec![guarantee * m as u32; n];
    let mut cursor = 0usize;
    for &tag in &ordered {
        for _ in 0..residual[tag.index()] {
            let mut placed = false;
            for _ in 0..n {
                let d = cursor % n;
                cursor += 1;
                if disk_fill[d] < pages_per_disk {
                    per_disk[tag.index()][d] += 1;
                    disk_fill[d] += 1;
                    placed = true;
                    break;
                }
            }
            if !placed {
                break;
            }
        }
    }

    // Per-disk rotation layout, then merge contiguous same-category page
    // runs into ranges.
    let mut ranges = Vec::with_capacity(n);
    for d in 0..n {
        let mut remaining: Vec<u32> = (0..m).map(|c| per_disk[c][d]).collect();
        let mut left: u32 = remaining.iter().sum();
        let mut slots: Vec<Tag> = Vec::with_capacity(left as usize);
        let mut k = d % m;
        while left > 0 {
            let tag = ordered[k % m];
            k += 1;
            if remaining[tag.index()] > 0 {
                remaining[tag.index()] -= 1;
                left -= 1;
                slots.push(tag);
            }
        }

        let mut disk_ranges: Vec<TagRange> = Vec::new();
        for (page, &tag) in slots.iter().enumerate() {
            let start = UnitPos(page as u32 * PAGE_UNITS + 1);
            let end = UnitPos((page as u32 + 1) * PAGE_UNITS);
            match disk_ranges.last_mut() {
                Some(last) if last.tag == tag && last.end.0 + 1 == start.0 => {
                    last.end = end;
                }
                _ => disk_ranges.push(TagRange { start, end, tag }),
            }
        }
        ranges.push(disk_ranges);
    }

    (ranges, budget)
}

// ── Tests ───────────────────────────────────────────────────────────────────

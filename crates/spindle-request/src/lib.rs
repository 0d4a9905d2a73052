#![forbid(unsafe_code)]
//! Read request lifecycle.
//!
//! `RequestTracker` maps each logical read request onto replica units on
//! specific disks, consolidates concurrent requests for the same object
//! so one pass of head work satisfies all of them, and folds the
//! scheduler's per-unit read events back into per-request completions.
//!
//! Requests move `Pending -> Processing -> Completed`, monotonically.
//! Completed records are purged at the end of the step they complete in;
//! cancellation happens only through object deletion.

use spindle_disk::DiskMap;
use spindle_error::{Result, SimError};
use spindle_object::{ObjectRecord, ObjectStore, Replica};
use spindle_sched::HeadScheduler;
use spindle_types::{DiskId, LOAD_SPREAD_THRESHOLD, ObjectId, RequestId, UnitPos};
use std::collections::{BTreeSet, HashMap, VecDeque};

// ── Request records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone)]
struct ReadRequest {
    object: ObjectId,
    status: RequestStatus,
    /// Unread unit count across all disks.
    total_remaining: u32,
    /// Unread units partitioned by disk.
    remaining: HashMap<DiskId, BTreeSet<u32>>,
}

// ── Tracker ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RequestTracker {
    requests: HashMap<RequestId, ReadRequest>,
    /// Registration order of not-yet-allocated requests. Ids of requests
    /// cancelled in the meantime stay in the queue and are skipped.
    queue: VecDeque<RequestId>,
    /// Open request ids per object.
    by_object: HashMap<ObjectId, BTreeSet<RequestId>>,
    /// Requests completed during the current step, drained at its end.
    completed: BTreeSet<RequestId>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Observers ───────────────────────────────────────────────────────

    /// Requests currently tracked (any status).
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn processing_count(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.status == RequestStatus::Processing)
            .count()
    }

    /// Requests registered but not yet allocated to a replica.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.requests.get(&id).map(|r| r.status)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Insert a request in `Pending` state and queue it for allocation.
    pub fn register(&mut self, id: RequestId, object: ObjectId, store: &ObjectStore) -> Result<()> {
        if self.requests.contains_key(&id) {
            return Err(SimError::DuplicateRequest(id));
        }
        let record = store.get(object).ok_or(SimError::UnknownObject(object))?;
        self.requests.insert(
            id,
            ReadRequest {
                object,
                status: RequestStatus::Pending,
                total_remaining: record.size,
                remaining: HashMap::new(),
            },
        );
        self.queue.push_back(id);
        self.by_object.entry(object).or_default().insert(id);
        Ok(())
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Map every queued request onto concrete `(disk, unit)` targets, in
    /// FIFO registration order, and enroll the new targets with the
    /// scheduler.
    ///
    /// Requests first subscribe to the targets of in-flight siblings on
    /// the same object (shared work, no new scheduler load); any ordinals
    /// still uncovered come from one replica chosen by the load-spread
    /// policy.
    pub fn allocate_step(
        &mut self,
        store: &ObjectStore,
        map: &DiskMap,
        sched: &mut HeadScheduler,
    ) {
        let batch: Vec<RequestId> = self.queue.drain(..).collect();
        for rid in batch {
            let Some(object) = self
                .requests
                .get(&rid)
                .filter(|r| r.status == RequestStatus::Pending)
                .map(|r| r.object)
            else {
                continue;
            };
            let Some(record) = store.get(object) else {
                // The object vanished between registration and
                // allocation; the request can never complete.
                self.requests.remove(&rid);
                if let Some(ids) = self.by_object.get_mut(&object) {
                    ids.remove(&rid);
                    if ids.is_empty() {
                        self.by_object.remove(&object);
                    }
                }
                continue;
            };

            // Subscribe to targets already committed for this object by
            // processing siblings; each of their remaining units pins
            // one intra-object ordinal.
            let mut uncovered: BTreeSet<u32> = (0..record.size).collect();
            let mut shared: Vec<(DiskId, u32)> = Vec::new();
            if let Some(siblings) = self.by_object.get(&object) {
                for &other in siblings {
                    if other == rid {
                        continue;
                    }
                    let Some(sibling) = self.requests.get(&other) else {
                        continue;
                    };
                    if sibling.status != RequestStatus::Processing {
                        continue;
                    }
                    for (&d, units) in &sibling.remaining {
                        for &u in units {
                            if let Some(ordinal) = map.ordinal(d, UnitPos(u)) {
                                if uncovered.remove(&ordinal) {
                                    shared.push((d, u));
                                }
                            }
                        }
                    }
                }
            }

            // Whatever ordinals are left come from one chosen replica.
            let mut fresh: Vec<(DiskId, u32)> = Vec::new();
            if !uncovered.is_empty() {
                let replica = select_replica(record, sched);
                for u in replica.blocks.units() {
                    if let Some(ordinal) = map.ordinal(replica.disk, u) {
                        if uncovered.remove(&ordinal) {
                            fresh.push((replica.disk, u.0));
                        }
                    }
                }
            }
            debug_assert!(uncovered.is_empty(), "replica did not cover all ordinals");

            let Some(request) = self.requests.get_mut(&rid) else {
                continue;
            };
            for &(d, u) in shared.iter().chain(fresh.iter()) {
                request.remaining.entry(d).or_default().insert(u);
            }
            request.total_remaining = request.remaining.values().map(|s| s.len() as u32).sum();
            request.status = RequestStatus::Processing;

            tracing::trace!(
                target: "spindle::request",
                request = rid.0,
                object = object.0,
                shared = shared.len(),
                fresh = fresh.len(),
                "request allocated"
            );
            for (d, u) in fresh {
                sched.enroll(d, UnitPos(u));
            }
        }
    }

    // ── Completion propagation ──────────────────────────────────────────

    /// Fold one disk's read units for this step into request state.
    pub fn absorb_reads(&mut self, d: DiskId, units: &[UnitPos], store: &ObjectStore) {
        for &u in units {
            let Some(object) = store.object_of(d, u) else {
                continue;
            };
            let Some(ids) = self.by_object.get(&object) else {
                continue;
            };
            let ids: Vec<RequestId> = ids.iter().copied().collect();
            for rid in ids {
                let Some(request) = self.requests.get_mut(&rid) else {
                    continue;
                };
                if request.status != RequestStatus::Processing {
                    continue;
                }
                let dropped = request
                    .remaining
                    .get_mut(&d)
                    .is_some_and(|units| units.remove(&u.0));
                if dropped {
                    request.total_remaining -= 1;
                    if request.total_remaining == 0 {
                        request.status = RequestStatus::Completed;
                        self.completed.insert(rid);
                    }
                }
            }
        }
    }

    /// Report the step's completions and purge their records: primary
    /// map, object reverse index, and the completed set itself.
    pub fn drain_completed(&mut self) -> Vec<RequestId> {
        let done: Vec<RequestId> = std::mem::take(&mut self.completed).into_iter().collect();
        for &rid in &done {
            if let Some(request) = self.requests.remove(&rid) {
                if let Some(ids) = self.by_object.get_mut(&request.object) {
                    ids.remove(&rid);
                    if ids.is_empty() {
                        self.by_object.remove(&request.object);
                    }
                }
            }
        }
        done
    }

    // ── Cancellation ────────────────────────────────────────────────────

    /// Cancel every open request on `object`, withdrawing their targets
    /// from the scheduler, and report the cancelled ids.
    ///
    /// Units are shared only among requests of the same object, and all
    /// of those are cancelled together, so every target can be withdrawn
    /// outright.
    pub fn cancel_for_object(
        &mut self,
        object: ObjectId,
        sched: &mut HeadScheduler,
    ) -> Vec<RequestId> {
        let Some(ids) = self.by_object.remove(&object) else {
            return Vec::new();
        };
        let mut cancelled = Vec::with_capacity(ids.len());
        for rid in ids {
            let Some(request) = self.requests.remove(&rid) else {
                continue;
            };
            self.completed.remove(&rid);
            for (d, units) in request.remaining {
                sched.cancel_many(d, units.into_iter().map(UnitPos));
            }
            cancelled.push(rid);
        }
        tracing::debug!(
            target: "spindle::request",
            object = object.0,
            cancelled = cancelled.len(),
            "requests cancelled by delete"
        );
        cancelled
    }
}

// ── Replica selection ───────────────────────────────────────────────────────

/// Pick the replica to serve uncovered ordinals from.
///
/// With head loads spread wider than the threshold the least-loaded disk
/// wins; otherwise the replica whose first block sits closest ahead of
/// its disk's head does.
fn select_replica<'a>(record: &'a ObjectRecord, sched: &HeadScheduler) -> &'a Replica {
    let scored: Vec<(u32, usize)> = record
        .replicas
        .iter()
        .map(|r| {
            let distance = r
                .blocks
                .first_run()
                .map_or(u32::MAX, |run| {
                    sched.distance_to_nearest(r.disk, run.start, run.len)
                });
            (distance, sched.head_load(r.disk))
        })
        .collect();

    let max_load = scored.iter().map(|s| s.1).max().unwrap_or(0);
    let min_load = scored.iter().map(|s| s.1).min().unwrap_or(0);
    let spread = if max_load == 0 {
        0.0
    } else {
        (max_load - min_load) as f64 / max_load as f64
    };

    let pick = if spread > LOAD_SPREAD_THRESHOLD {
        let mut best = 0;
        for (i, s) in scored.iter().enumerate() {
            if s.1 < scored[best].1 {
                best = i;
            }
        }
        best
    } else {
        let mut best = 0;
        for (i, s) in scored.iter().enumerate() {
            if s.0 < scored[best].0 {
                best = i;
            }
        }
        best
    };
    &record.replicas[pick]
}

// ── Tests ───────────────────────────────────────────────────────────────────

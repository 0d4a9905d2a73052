#![forbid(unsafe_code)]
//! The step pipeline.
//!
//! `Simulator` owns every mutable structure of the system and drives one
//! step at a time: deletes, then writes, then read registration, then
//! scheduling and completion propagation. Each structure has a single
//! owner; cross-component mutations always go through the owning
//! interface (cancellation reaches the scheduler's pending sets only via
//! the tracker, frees reach the disk grid only via the store).
//!
//! A step is atomic: no suspension, no I/O. The protocol layer feeds a
//! fully parsed `StepInput` in and renders the returned `StepReport`.

use spindle_disk::DiskMap;
use spindle_error::Result;
use spindle_object::{ObjectRecord, ObjectStore};
use spindle_planner::{FrequencyTables, Planner};
use spindle_request::RequestTracker;
use spindle_sched::{HeadScheduler, StepPlan};
use spindle_types::{DiskId, ObjectId, RequestId, SimConfig, Tag};

// ── Step events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub id: ObjectId,
    pub size: u32,
    pub tag: Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRecord {
    pub request: RequestId,
    pub object: ObjectId,
}

/// Everything one step consumes, fully parsed before the step begins.
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    pub deletes: Vec<ObjectId>,
    pub writes: Vec<WriteRecord>,
    pub reads: Vec<ReadRecord>,
}

/// Everything one step produces, in protocol emission order.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: u32,
    /// Requests cancelled by this step's deletes.
    pub cancelled: Vec<RequestId>,
    /// Objects created by this step's writes, with their placements.
    pub created: Vec<ObjectRecord>,
    /// Per-disk action plans, ascending disk id.
    pub plans: Vec<(DiskId, StepPlan)>,
    /// Requests completed by this step's reads.
    pub completed: Vec<RequestId>,
}

// ── Simulator ───────────────────────────────────────────────────────────────

pub struct Simulator {
    cfg: SimConfig,
    planner: Planner,
    map: DiskMap,
    store: ObjectStore,
    sched: HeadScheduler,
    tracker: RequestTracker,
    step: u32,
}

impl Simulator {
    /// Run preprocessing and stand the components up.
    pub fn new(cfg: SimConfig, tables: &FrequencyTables) -> Result<Self> {
        cfg.validate()?;
        let planner = Planner::preprocess(cfg, tables);
        let ranges = (1..=cfg.disks)
            .map(|d| planner.disk_ranges(DiskId(d)).to_vec())
            .collect();
        Ok(Self {
            map: DiskMap::new(&cfg, ranges),
            store: ObjectStore::new(cfg.disks),
            sched: HeadScheduler::new(&cfg),
            tracker: RequestTracker::new(),
            planner,
            cfg,
            step: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    #[must_use]
    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    #[must_use]
    pub fn disk_map(&self) -> &DiskMap {
        &self.map
    }

    #[must_use]
    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn scheduler(&self) -> &HeadScheduler {
        &self.sched
    }

    #[must_use]
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Steps executed so far.
    #[must_use]
    pub fn steps_run(&self) -> u32 {
        self.step
    }

    /// Execute one step of the pipeline.
    ///
    /// Within the step, deletes happen before writes, writes before read
    /// registration, and registration before scheduling, so a request
    /// registered here can still complete here if its disk has tokens
    /// left. Failed writes and unknown ids degrade to empty output, never
    /// to a stopped simulation.
    pub fn step(&mut self, input: StepInput) -> StepReport {
        self.step += 1;

        let mut cancelled = Vec::new();
        for id in input.deletes {
            cancelled.extend(self.tracker.cancel_for_object(id, &mut self.sched));
            if self.store.delete(id, &mut self.map).is_err() {
                tracing::debug!(
                    target: "spindle::engine",
                    step = self.step,
                    object = id.0,
                    "delete of unknown object ignored"
                );
            }
        }

        let mut created = Vec::new();
        for w in input.writes {
            match self.store.create(
                w.id,
                w.size,
                w.tag,
                self.planner.related(w.tag),
                &mut self.map,
            ) {
                Ok(record) => created.push(record.clone()),
                Err(err) => {
                    tracing::debug!(
                        target: "spindle::engine",
                        step = self.step,
                        object = w.id.0,
                        size = w.size,
                        %err,
                        "write failed"
                    );
                }
            }
        }

        for r in input.reads {
            if let Err(err) = self.tracker.register(r.request, r.object, &self.store) {
                tracing::debug!(
                    target: "spindle::engine",
                    step = self.step,
                    request = r.request.0,
                    object = r.object.0,
                    %err,
                    "read registration dropped"
                );
            }
        }

        self.tracker.allocate_step(&self.store, &self.map, &mut self.sched);
        let plans = self.sched.run_step();
        for (d, plan) in &plans {
            self.tracker.absorb_reads(*d, &plan.reads, &self.store);
        }
        let completed = self.tracker.drain_completed();

        tracing::debug!(
            target: "spindle::engine",
            step = self.step,
            cancelled = cancelled.len(),
            created = created.len(),
            completed = completed.len(),
            open = self.tracker.open_count(),
            "step done"
        );

        StepReport {
            step: self.step,
            cancelled,
            created,
            plans,
            completed,
        }
    }
}

#![forbid(unsafe_code)]
//! Deterministic mixed-workload churn: many steps of interleaved writes,
//! deletes, and reads, with the cross-component invariants recounted at
//! every step boundary.

use spindle_engine::{ReadRecord, Simulator, StepInput, WriteRecord};
use spindle_planner::FrequencyTables;
use spindle_types::{
    DiskId, ObjectId, READ_BASE_COST, RequestId, SimConfig, Tag, UnitPos, decayed_read_cost,
};
use std::collections::HashSet;

/// Small multiplicative congruential generator; fixed seed, fixed run.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Per-disk replay of the emitted action strings against the published
/// cost rules: budget conservation and the READ decay across steps.
struct CostReplay {
    last_read: bool,
    last_cost: u32,
}

impl CostReplay {
    fn new() -> Self {
        Self {
            last_read: false,
            last_cost: 0,
        }
    }

    fn step(&mut self, g: u32, plan: &spindle_sched::StepPlan) {
        use spindle_sched::HeadAction;
        let mut total = 0u32;
        for (i, action) in plan.actions.iter().enumerate() {
            match action {
                HeadAction::Jump(_) => {
                    assert_eq!(i, 0, "jump must open the step");
                    assert_eq!(plan.actions.len(), 1, "jump must end the step");
                    total += g;
                    self.last_read = false;
                    self.last_cost = g;
                }
                HeadAction::Pass => {
                    total += 1;
                    self.last_read = false;
                    self.last_cost = 1;
                }
                HeadAction::Read(_) => {
                    let c = if self.last_read {
                        decayed_read_cost(self.last_cost)
                    } else {
                        READ_BASE_COST
                    };
                    total += c;
                    self.last_read = true;
                    self.last_cost = c;
                }
            }
        }
        assert!(total <= g, "step spent {total} of {g} tokens");
    }
}

fn recount_invariants(sim: &Simulator) {
    let map = sim.disk_map();
    let store = sim.object_store();
    for d in 1..=map.disk_count() {
        let d = DiskId(d);
        let free = (1..=map.unit_count())
            .filter(|&u| map.is_free(d, UnitPos(u)))
            .count() as u32;
        assert_eq!(map.free_count(d), free);

        let mut seen: HashSet<Tag> = HashSet::new();
        for r in map.disk_ranges(d) {
            if !seen.insert(r.tag) {
                continue;
            }
            let recount: u32 = map
                .disk_ranges(d)
                .iter()
                .filter(|x| x.tag == r.tag)
                .map(|x| {
                    (x.start.0..=x.end.0)
                        .filter(|&u| map.is_free(d, UnitPos(u)))
                        .count() as u32
                })
                .sum();
            assert_eq!(map.tag_free(d, r.tag), recount);
        }

        // Reverse index agrees with the grid.
        for u in 1..=map.unit_count() {
            let u = UnitPos(u);
            if store.object_of(d, u).is_some() {
                assert!(!map.is_free(d, u));
            }
        }
    }
}

#[test]
fn churn_preserves_invariants_and_resolves_every_request() {
    let cfg = SimConfig {
        steps: 10,
        categories: 4,
        disks: 5,
        units_per_disk: 420,
        tokens_per_step: 300,
    };
    // A workload profile with skewed peaks so the planner has real
    // proportions to split.
    let tables = FrequencyTables::new(
        &cfg,
        vec![vec![50], vec![10], vec![0], vec![5]],
        vec![vec![400], vec![150], vec![60], vec![30]],
        vec![vec![900], vec![300], vec![40], vec![10]],
    )
    .unwrap();
    let mut sim = Simulator::new(cfg, &tables).unwrap();

    let mut rng = Lcg(0xfeed_5eed);
    let mut live: Vec<ObjectId> = Vec::new();
    let mut next_object = 1u64;
    let mut next_request = 1u64;
    let mut registered: HashSet<RequestId> = HashSet::new();
    let mut resolved: HashSet<RequestId> = HashSet::new();
    let mut replay: Vec<CostReplay> = (0..cfg.disks).map(|_| CostReplay::new()).collect();

    for step in 0..60u32 {
        let mut input = StepInput::default();

        if step % 3 == 2 && !live.is_empty() {
            input.deletes.push(live.remove(0));
        }
        for _ in 0..=rng.below(2) {
            input.writes.push(WriteRecord {
                id: ObjectId(next_object),
                size: rng.below(8) as u32 + 1,
                tag: Tag(rng.below(4) as u32 + 1),
            });
            next_object += 1;
        }
        for _ in 0..rng.below(3) {
            if live.is_empty() {
                break;
            }
            let object = live[rng.below(live.len() as u64) as usize];
            input.reads.push(ReadRecord {
                request: RequestId(next_request),
                object,
            });
            registered.insert(RequestId(next_request));
            next_request += 1;
        }

        let report = sim.step(input);

        for record in &report.created {
            live.push(record.id);
            // Three replicas, three distinct disks, full size each.
            let mut disks: Vec<DiskId> = record.replicas.iter().map(|r| r.disk).collect();
            disks.sort();
            disks.dedup();
            assert_eq!(disks.len(), 3);
            for r in &record.replicas {
                assert_eq!(r.blocks.total_len(), record.size);
            }
        }
        for id in report.cancelled.iter().chain(&report.completed) {
            assert!(registered.contains(id), "unknown request {id} resolved");
            assert!(resolved.insert(*id), "request {id} resolved twice");
        }
        for (d, plan) in &report.plans {
            replay[d.index()].step(cfg.tokens_per_step, plan);
        }
        recount_invariants(&sim);
    }

    // Let the tail drain: no new work, only leftover reads.
    for _ in 0..200 {
        let report = sim.step(StepInput::default());
        for id in &report.completed {
            assert!(resolved.insert(*id), "request {id} resolved twice");
        }
        for (d, plan) in &report.plans {
            replay[d.index()].step(cfg.tokens_per_step, plan);
        }
        if sim.tracker().open_count() == 0 {
            break;
        }
    }

    assert_eq!(sim.tracker().open_count(), 0, "requests left unresolved");
    assert_eq!(registered, resolved);
    recount_invariants(&sim);
}

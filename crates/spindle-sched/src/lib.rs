#![forbid(unsafe_code)]
//! Token-budgeted disk head scheduling.
//!
//! One record per disk: head position, last action kind, last READ cost,
//! and the ordered pending-read set. Each step every head gets a fresh
//! budget of `G` tokens and drains as many pending targets as the budget
//! and the READ-cost decay rule allow.
//!
//! Action costs:
//! - PASS moves forward one unit for 1 token.
//! - JUMP teleports for the whole budget and is only legal as the first
//!   action of a step.
//! - READ costs 64 tokens cold, `max(16, ceil(prev * 0.8))` when it
//!   directly follows another READ, including across step boundaries.
//!
//! When the head sits before a gap it weighs passing over it (and paying
//! the cold READ re-entry) against reading straight through it (keeping
//! the decay warm); plans that spill into the next step are charged the
//! stranded remainder of this one.

use spindle_types::{
    DiskId, READ_BASE_COST, SimConfig, UnitPos, cyclic_advance, cyclic_distance,
    decayed_read_cost,
};
use std::collections::BTreeSet;
use std::fmt;

// ── Actions ─────────────────────────────────────────────────────────────────

/// One head micro-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadAction {
    Pass,
    Read(UnitPos),
    Jump(UnitPos),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Pass,
    Read,
    Jump,
}

/// A disk's executed action sequence for one step.
#[derive(Debug, Clone, Default)]
pub struct StepPlan {
    pub actions: Vec<HeadAction>,
    /// Units read this step, in execution order.
    pub reads: Vec<UnitPos>,
}

impl fmt::Display for StepPlan {
    /// Protocol rendering: `j T` for a jump step, otherwise `p`/`r` per
    /// action terminated by `#`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(HeadAction::Jump(target)) = self.actions.first() {
            return write!(f, "j {target}");
        }
        for action in &self.actions {
            match action {
                HeadAction::Pass => f.write_str("p")?,
                HeadAction::Read(_) => f.write_str("r")?,
                HeadAction::Jump(_) => unreachable!("jump is only legal first"),
            }
        }
        f.write_str("#")
    }
}

// ── Head state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct HeadState {
    pos: UnitPos,
    last_action: ActionKind,
    last_cost: u32,
    /// Pending read targets, ordered for cyclic successor lookup.
    pending: BTreeSet<u32>,
}

impl HeadState {
    fn new() -> Self {
        Self {
            pos: UnitPos(1),
            last_action: ActionKind::Pass,
            last_cost: 0,
            pending: BTreeSet::new(),
        }
    }

    /// Nearest pending target: the cyclic successor of `pos`, falling
    /// back to the set minimum once past the highest target.
    fn nearest(&self) -> Option<UnitPos> {
        self.pending
            .range(self.pos.0..)
            .next()
            .or_else(|| self.pending.iter().next())
            .map(|&u| UnitPos(u))
    }

    /// Cost of a READ issued now.
    fn read_cost(&self) -> u32 {
        if self.last_action == ActionKind::Read {
            decayed_read_cost(self.last_cost)
        } else {
            READ_BASE_COST
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeadScheduler {
    v: u32,
    tokens_per_step: u32,
    heads: Vec<HeadState>,
}

impl HeadScheduler {
    #[must_use]
    pub fn new(cfg: &SimConfig) -> Self {
        Self {
            v: cfg.units_per_disk,
            tokens_per_step: cfg.tokens_per_step,
            heads: (0..cfg.disks).map(|_| HeadState::new()).collect(),
        }
    }

    // ── Target bookkeeping ──────────────────────────────────────────────

    /// Enroll a unit as a read target on disk `d`.
    pub fn enroll(&mut self, d: DiskId, u: UnitPos) {
        self.heads[d.index()].pending.insert(u.0);
    }

    /// Enroll a batch of targets on disk `d`.
    pub fn enroll_many(&mut self, d: DiskId, units: impl IntoIterator<Item = UnitPos>) {
        let pending = &mut self.heads[d.index()].pending;
        for u in units {
            pending.insert(u.0);
        }
    }

    /// Drop a target; returns whether it was pending.
    pub fn cancel(&mut self, d: DiskId, u: UnitPos) -> bool {
        self.heads[d.index()].pending.remove(&u.0)
    }

    /// Drop a batch of targets on disk `d`.
    pub fn cancel_many(&mut self, d: DiskId, units: impl IntoIterator<Item = UnitPos>) {
        let pending = &mut self.heads[d.index()].pending;
        for u in units {
            pending.remove(&u.0);
        }
    }

    // ── Observables ─────────────────────────────────────────────────────

    #[must_use]
    pub fn head_position(&self, d: DiskId) -> UnitPos {
        self.heads[d.index()].pos
    }

    /// Pending-target count on disk `d`.
    #[must_use]
    pub fn head_load(&self, d: DiskId) -> usize {
        self.heads[d.index()].pending.len()
    }

    #[must_use]
    pub fn has_pending(&self, d: DiskId) -> bool {
        !self.heads[d.index()].pending.is_empty()
    }

    #[must_use]
    pub fn is_pending(&self, d: DiskId, u: UnitPos) -> bool {
        self.heads[d.index()].pending.contains(&u.0)
    }

    /// Minimum cyclic distance from the head of `d` to any pending target
    /// inside the window `[start, start + len - 1]`. When the window holds
    /// no pending target, the distance to the window start stands in: it
    /// measures how soon the head sweeps into the window at all.
    #[must_use]
    pub fn distance_to_nearest(&self, d: DiskId, start: UnitPos, len: u32) -> u32 {
        let head = &self.heads[d.index()];
        let end = (start.0 + len - 1).min(self.v);
        head.pending
            .range(start.0..=end)
            .map(|&u| cyclic_distance(self.v, head.pos, UnitPos(u)))
            .min()
            .unwrap_or_else(|| cyclic_distance(self.v, head.pos, start))
    }

    // ── Step planning ───────────────────────────────────────────────────

    /// Plan and execute one step on every disk, ascending disk id.
    ///
    /// Removing a target from the pending set is coupled with its READ
    /// emission; the returned plans carry the units read this step.
    pub fn run_step(&mut self) -> Vec<(DiskId, StepPlan)> {
        (0..self.heads.len())
            .map(|idx| (DiskId(idx as u32 + 1), self.plan_disk(idx)))
            .collect()
    }

    fn plan_disk(&mut self, idx: usize) -> StepPlan {
        let v = self.v;
        let step_tokens = self.tokens_per_step;
        let head = &mut self.heads[idx];
        let mut plan = StepPlan::default();

        // A target out of reach of this whole step is worth the jump,
        // but only as the first action.
        if let Some(target) = head.nearest() {
            let dist = cyclic_distance(v, head.pos, target);
            if dist + READ_BASE_COST > step_tokens {
                tracing::trace!(
                    target: "spindle::sched",
                    disk = idx + 1,
                    from = head.pos.0,
                    to = target.0,
                    dist,
                    "jump"
                );
                head.pos = target;
                head.last_action = ActionKind::Jump;
                head.last_cost = step_tokens;
                plan.actions.push(HeadAction::Jump(target));
                return plan;
            }
        }

        let mut budget = step_tokens;
        while budget > 0 {
            let Some(target) = head.nearest() else { break };

            if target == head.pos {
                let cost = head.read_cost();
                if cost > budget {
                    break;
                }
                head.pending.remove(&head.pos.0);
                plan.reads.push(head.pos);
                plan.actions.push(HeadAction::Read(head.pos));
                head.last_action = ActionKind::Read;
                head.last_cost = cost;
                budget -= cost;
                head.pos = cyclic_advance(v, head.pos, 1);
                continue;
            }

            let dist = cyclic_distance(v, head.pos, target);
            if head.last_action == ActionKind::Read {
                // Plan A: pass the gap, pay the cold READ on arrival. A
                // gap that fits the budget while the READ does not
                // strands the rest of this step.
                let mut pass_plan = dist + READ_BASE_COST;
                if dist < budget && dist + READ_BASE_COST > budget {
                    pass_plan = budget + READ_BASE_COST;
                }

                // Plan B: read straight through the gap, keeping the
                // decay warm. Simulate the `dist + 1` reads against the
                // remaining budget.
                let mut spent = 0u32;
                let mut fits_now = 0u32;
                let mut sim_cost = head.last_cost;
                let mut sim_budget = budget;
                let mut spills = false;
                for _ in 0..=dist {
                    let c = decayed_read_cost(sim_cost);
                    if sim_budget < c {
                        spills = true;
                        break;
                    }
                    spent += c;
                    sim_budget -= c;
                    sim_cost = c;
                    fits_now += 1;
                    if spent > pass_plan {
                        break;
                    }
                }
                let read_plan = if spills {
                    // Charge what this step strands plus the next-step
                    // continuation at the carried decay.
                    let mut continuation = 0u32;
                    let mut c = sim_cost;
                    for _ in 0..(dist + 1 - fits_now) {
                        c = decayed_read_cost(c);
                        continuation += c;
                    }
                    budget + continuation
                } else {
                    spent
                };

                // Equal cost keeps the PASS plan: it leaves the pending
                // set intact for future steps.
                if read_plan < pass_plan {
                    if fits_now == 0 {
                        break;
                    }
                    for _ in 0..fits_now {
                        head.pending.remove(&head.pos.0);
                        plan.reads.push(head.pos);
                        plan.actions.push(HeadAction::Read(head.pos));
                        head.pos = cyclic_advance(v, head.pos, 1);
                    }
                    head.last_action = ActionKind::Read;
                    head.last_cost = sim_cost;
                    budget -= spent;
                    if spills {
                        break;
                    }
                    continue;
                }
            }

            let steps = dist.min(budget);
            for _ in 0..steps {
                plan.actions.push(HeadAction::Pass);
            }
            head.pos = cyclic_advance(v, head.pos, steps);
            head.last_action = ActionKind::Pass;
            head.last_cost = 1;
            budget -= steps;
        }

        plan
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

use serde::Serialize;
use swingset_cbor::Hash;

use crate::gc::GcBatch;
use crate::refs::VatId;
use crate::state::RunQueueEntry;

/// Where the kernel is within a crank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrankPhase {
    #[default]
    Idle,
    Delivering,
    ApplyingSyscalls,
    Committing,
}

/// The next piece of work, in priority order: GC actions, then reaps, then the run queue.
#[derive(Debug)]
pub(crate) enum Work {
    Gc(GcBatch),
    Reap(VatId),
    Run(RunQueueEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrankKind {
    Send,
    Notify,
    DropExports,
    RetireExports,
    RetireImports,
    /// Every queued action of the group had stopped applying.
    NegatedGcActions,
    BringOutYourDead,
}

/// What one crank did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrankReport {
    pub crank_number: u64,
    pub kind: CrankKind,
    /// Vat that received a delivery, if any did.
    pub vat: Option<VatId>,
    pub computrons: u64,
    pub mutations: usize,
    pub crank_hash: Hash,
}

/// Decides when a host's block of cranks ends.
pub trait RunPolicy {
    /// Called after each crank; returning false stops the run.
    fn crank_complete(&mut self, report: &CrankReport) -> bool;
}

/// Run until the queues drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunUntilIdle;

impl RunPolicy for RunUntilIdle {
    fn crank_complete(&mut self, _report: &CrankReport) -> bool {
        true
    }
}

/// Stop after a fixed number of cranks.
#[derive(Debug, Clone, Copy)]
pub struct CrankBudget {
    remaining: u64,
}

impl CrankBudget {
    pub fn new(cranks: u64) -> Self {
        Self { remaining: cranks }
    }
}

impl RunPolicy for CrankBudget {
    fn crank_complete(&mut self, _report: &CrankReport) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }
}

/// Stop once the vats have reported at least this many computrons in total.
#[derive(Debug, Clone, Copy)]
pub struct ComputronBudget {
    limit: u64,
    used: u64,
}

impl ComputronBudget {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

impl RunPolicy for ComputronBudget {
    fn crank_complete(&mut self, report: &CrankReport) -> bool {
        self.used = self.used.saturating_add(report.computrons);
        self.used < self.limit
    }
}

//! The contract between the kernel and the vat manager that hosts vat workers.
//!
//! The kernel hands a worker one [`VatDelivery`] at a time. While the worker runs it issues
//! [`VatSyscall`]s through the [`SyscallHandler`] the kernel passes in, and each call returns
//! its [`VatSyscallResult`] synchronously. The kernel records the ordered syscalls with their
//! results in the vat's transcript; on replay the same handler slot is filled by a simulator
//! that checks each syscall against the record and re-supplies the recorded result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{VatCapData, VatMessage};
use crate::refs::{VatId, VatRef};

/// One promise resolution as a vat sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatResolution {
    pub vpid: VatRef,
    pub rejected: bool,
    pub data: VatCapData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VatDelivery {
    Message { target: VatRef, message: VatMessage },
    Notify { resolutions: Vec<VatResolution> },
    DropExports { vrefs: Vec<VatRef> },
    RetireExports { vrefs: Vec<VatRef> },
    RetireImports { vrefs: Vec<VatRef> },
    BringOutYourDead,
}

impl VatDelivery {
    pub fn kind(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VatSyscall {
    Send { target: VatRef, message: VatMessage },
    Resolve { resolutions: Vec<VatResolution> },
    Subscribe { vpid: VatRef },
    Exit { failure: bool, info: VatCapData },
    DropImports { vrefs: Vec<VatRef> },
    RetireImports { vrefs: Vec<VatRef> },
    RetireExports { vrefs: Vec<VatRef> },
    AbandonExports { vrefs: Vec<VatRef> },
    VatstoreGet { key: String },
    VatstoreSet { key: String, value: String },
    VatstoreDelete { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum VatSyscallResult {
    Ok,
    /// Result of `vatstoreGet`.
    Value(Option<String>),
    /// The syscall was refused; the vat sees an ordinary error and keeps running.
    Error(String),
}

impl VatSyscallResult {
    pub fn is_error(&self) -> bool {
        matches!(self, VatSyscallResult::Error(_))
    }
}

/// Receives a vat's syscalls during a delivery.
pub trait SyscallHandler {
    fn syscall(&mut self, syscall: VatSyscall) -> VatSyscallResult;
}

/// What a worker reports once a delivery returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// The worker crashed or threw out of the delivery. The vat is terminated and none of
    /// the syscalls it made during this delivery take effect.
    pub did_abort: bool,
    pub problem: Option<String>,
    pub computrons: u64,
}

impl DeliveryOutcome {
    pub fn ok(computrons: u64) -> Self {
        Self {
            computrons,
            ..Self::default()
        }
    }

    pub fn aborted(problem: impl Into<String>) -> Self {
        Self {
            did_abort: true,
            problem: Some(problem.into()),
            computrons: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum VatManagerError {
    #[error("no worker for vat {0}")]
    NoWorker(VatId),
    #[error("worker for vat {vat} failed: {reason}")]
    Worker { vat: VatId, reason: String },
    #[error("snapshot of vat {vat} failed: {reason}")]
    Snapshot { vat: VatId, reason: String },
}

/// Hosts vat workers. The kernel never looks inside a vat; everything it knows comes
/// through this trait.
pub trait VatManager {
    /// Start (or restart) a worker, from `snapshot` if given or from genesis otherwise.
    fn start_worker(&mut self, vat: VatId, snapshot: Option<&[u8]>)
    -> Result<(), VatManagerError>;

    /// Run one delivery to completion, routing its syscalls through `syscalls`.
    fn deliver(
        &mut self,
        vat: VatId,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<DeliveryOutcome, VatManagerError>;

    /// Capture the worker's heap so later replays can start from here.
    fn make_snapshot(&mut self, vat: VatId) -> Result<Vec<u8>, VatManagerError>;

    fn stop_worker(&mut self, vat: VatId);
}

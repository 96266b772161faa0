//! Bringing a vat worker back to its last committed state.
//!
//! The worker starts from the current span's snapshot and is fed the span's deliveries
//! again. Its syscalls are not applied; they are checked against the transcript, and
//! each gets the result recorded the first time round. Any divergence means the vat is
//! not a pure function of its inputs, which the kernel cannot recover from.

use std::collections::VecDeque;

use crate::error::{KernelError, KernelResult};
use crate::refs::VatId;
use crate::state::{RecordedSyscall, TranscriptEntry};
use crate::vat::{SyscallHandler, VatManager, VatSyscall, VatSyscallResult};

/// Stands in for the kernel while a recorded delivery is replayed.
pub struct SyscallSimulator {
    expected: VecDeque<RecordedSyscall>,
    mismatch: Option<String>,
}

impl SyscallSimulator {
    pub fn new(recorded: &[RecordedSyscall]) -> Self {
        Self {
            expected: recorded.iter().cloned().collect(),
            mismatch: None,
        }
    }

    /// First divergence seen, including recorded syscalls the worker never made.
    pub fn finish(self) -> Result<(), String> {
        if let Some(mismatch) = self.mismatch {
            return Err(mismatch);
        }
        match self.expected.front() {
            Some(missing) => Err(format!("worker never made {:?}", missing.syscall)),
            None => Ok(()),
        }
    }
}

impl SyscallHandler for SyscallSimulator {
    fn syscall(&mut self, syscall: VatSyscall) -> VatSyscallResult {
        if self.mismatch.is_some() {
            return VatSyscallResult::Error("replay diverged".into());
        }
        match self.expected.pop_front() {
            Some(recorded) if recorded.syscall == syscall => recorded.result,
            Some(recorded) => {
                self.mismatch = Some(format!(
                    "expected {:?}, got {syscall:?}",
                    recorded.syscall
                ));
                VatSyscallResult::Error("replay diverged".into())
            }
            None => {
                self.mismatch = Some(format!("unexpected extra {syscall:?}"));
                VatSyscallResult::Error("replay diverged".into())
            }
        }
    }
}

/// Start `vat`'s worker from `snapshot` and replay `entries` into it.
pub(crate) fn replay_transcript(
    manager: &mut dyn VatManager,
    vat: VatId,
    snapshot: Option<&[u8]>,
    entries: &[TranscriptEntry],
) -> KernelResult<()> {
    manager.start_worker(vat, snapshot)?;
    for (pos, entry) in entries.iter().enumerate() {
        let mut simulator = SyscallSimulator::new(&entry.syscalls);
        let outcome = manager.deliver(vat, &entry.delivery, &mut simulator)?;
        if outcome.did_abort {
            return Err(KernelError::consistency(format!(
                "{vat} aborted replaying entry {pos}: {}",
                outcome.problem.unwrap_or_default()
            )));
        }
        simulator.finish().map_err(|mismatch| {
            KernelError::consistency(format!("{vat} replay diverged at entry {pos}: {mismatch}"))
        })?;
    }
    log::debug!("{vat} replayed {} transcript entries", entries.len());
    Ok(())
}

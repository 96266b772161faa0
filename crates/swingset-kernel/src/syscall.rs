//! Applying a vat's syscalls to the kernel tables during a delivery.

use swingset_store::KvStore;

use crate::error::{KernelError, SyscallError, SyscallFailure};
use crate::message::{KernelCapData, KernelMessage};
use crate::refs::{KernelRef, VatId};
use crate::scheduler::CrankPhase;
use crate::state::{KernelState, RecordedSyscall};
use crate::vat::{SyscallHandler, VatSyscall, VatSyscallResult};

/// A syscall after its vrefs have been translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KernelSyscall {
    Send {
        target: KernelRef,
        message: KernelMessage,
    },
    Resolve {
        resolutions: Vec<(KernelRef, bool, KernelCapData)>,
    },
    Subscribe {
        kpid: KernelRef,
    },
    Exit {
        failure: bool,
        info: KernelCapData,
    },
    DropImports {
        krefs: Vec<KernelRef>,
    },
    RetireImports {
        krefs: Vec<KernelRef>,
    },
    RetireExports {
        krefs: Vec<KernelRef>,
    },
    AbandonExports {
        krefs: Vec<KernelRef>,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
}

/// A vat asked to end itself. Acted on once the delivery returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExitRequest {
    pub failure: bool,
    pub info: KernelCapData,
}

/// The handler a live delivery runs against: translates and applies each syscall and
/// records it with its result for the transcript.
pub(crate) struct SyscallContext<'a, S: KvStore> {
    state: &'a mut KernelState<S>,
    vat: VatId,
    pub recorded: Vec<RecordedSyscall>,
    pub exit: Option<ExitRequest>,
    /// A kernel failure raised while serving a syscall. The crank is abandoned once the
    /// delivery returns.
    pub fatal: Option<KernelError>,
}

impl<'a, S: KvStore> SyscallContext<'a, S> {
    pub fn new(state: &'a mut KernelState<S>, vat: VatId) -> Self {
        Self {
            state,
            vat,
            recorded: Vec::new(),
            exit: None,
            fatal: None,
        }
    }

    fn dispatch(&mut self, syscall: &VatSyscall) -> Result<VatSyscallResult, SyscallFailure> {
        let translated = self.state.translate_syscall(self.vat, syscall)?;
        if let KernelSyscall::Exit { failure, info } = translated {
            if self.exit.is_some() {
                return Err(SyscallError::AlreadyExiting.into());
            }
            self.exit = Some(ExitRequest { failure, info });
            return Ok(VatSyscallResult::Ok);
        }
        self.state.apply_syscall(self.vat, translated)
    }
}

impl<S: KvStore> SyscallHandler for SyscallContext<'_, S> {
    fn syscall(&mut self, syscall: VatSyscall) -> VatSyscallResult {
        if self.fatal.is_some() {
            return VatSyscallResult::Error("kernel failure".into());
        }
        log::debug!("{} syscall {syscall:?}", self.vat);
        self.state.set_phase(CrankPhase::ApplyingSyscalls);
        let savepoint = self.state.savepoint();
        let result = match self.dispatch(&syscall) {
            Ok(result) => result,
            Err(SyscallFailure::Vat(err)) => {
                self.state.rollback(savepoint);
                log::debug!("{} syscall refused: {err}", self.vat);
                VatSyscallResult::Error(err.to_string())
            }
            Err(SyscallFailure::Kernel(err)) => {
                log::error!("{} syscall hit a kernel failure: {err}", self.vat);
                self.fatal = Some(err);
                VatSyscallResult::Error("kernel failure".into())
            }
        };
        self.state.set_phase(CrankPhase::Delivering);
        self.recorded.push(RecordedSyscall {
            syscall,
            result: result.clone(),
        });
        result
    }
}

impl<S: KvStore> KernelState<S> {
    pub(crate) fn apply_syscall(
        &mut self,
        vat: VatId,
        syscall: KernelSyscall,
    ) -> Result<VatSyscallResult, SyscallFailure> {
        match syscall {
            KernelSyscall::Send { target, message } => {
                if let Some(result) = message.result {
                    self.set_decider(result, None)?;
                }
                self.enqueue_send(target, message)?;
            }
            KernelSyscall::Resolve { resolutions } => {
                for (kpid, rejected, data) in resolutions {
                    self.resolve_promise(kpid, rejected, data)?;
                    self.delete_clist_entry(vat, kpid)?;
                }
            }
            KernelSyscall::Subscribe { kpid } => self.subscribe(kpid, vat)?,
            KernelSyscall::Exit { .. } => {
                return Err(KernelError::consistency("exit reached the kernel tables").into());
            }
            KernelSyscall::DropImports { krefs } => {
                for kref in krefs {
                    self.unmark_reachable(vat, kref)?;
                }
            }
            KernelSyscall::RetireImports { krefs } => {
                for kref in krefs {
                    let entry = self.clist_entry(vat, kref)?.ok_or_else(|| {
                        KernelError::consistency(format!("{vat} lost its entry for {kref}"))
                    })?;
                    if entry.reachable {
                        return Err(SyscallError::StillReachable(entry.vref).into());
                    }
                    self.delete_clist_entry(vat, kref)?;
                }
            }
            KernelSyscall::RetireExports { krefs } => {
                for &kref in &krefs {
                    let reachable = self.object_refcount(kref)?.is_some_and(|c| c.reachable > 0);
                    if reachable {
                        let vref = self.vref_for_kref(vat, kref)?.ok_or_else(|| {
                            KernelError::consistency(format!("{vat} lost its entry for {kref}"))
                        })?;
                        return Err(SyscallError::StillReachable(vref).into());
                    }
                }
                self.retire_kernel_objects(vat, &krefs)?;
            }
            KernelSyscall::AbandonExports { krefs } => {
                for kref in krefs {
                    self.delete_clist_entry(vat, kref)?;
                    self.orphan_object(kref);
                }
            }
            KernelSyscall::VatstoreGet { key } => {
                return Ok(VatSyscallResult::Value(self.vatstore_get(vat, &key)?));
            }
            KernelSyscall::VatstoreSet { key, value } => self.vatstore_set(vat, &key, &value)?,
            KernelSyscall::VatstoreDelete { key } => self.vatstore_delete(vat, &key),
        }
        Ok(VatSyscallResult::Ok)
    }
}

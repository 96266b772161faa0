//! The kernel: owns the tables and the vat manager and runs cranks.

use std::collections::BTreeSet;
use std::sync::Arc;

use swingset_store::KvStore;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult, SyscallFailure};
use crate::message::{KernelCapData, KernelMessage};
use crate::refs::{KernelRef, VatId, VatRef};
use crate::state::{KernelState, PromiseStatus, RefStrength, VatOptions};
use crate::vat::VatManager;

mod crank;
mod delivery;
mod lifecycle;

/// Kernel-decided disconnection reason for promises whose decider died.
pub(crate) fn vat_terminated() -> KernelCapData {
    KernelCapData::error("vat terminated")
}

pub struct Kernel<S: KvStore> {
    state: KernelState<S>,
    vat_manager: Box<dyn VatManager>,
    config: KernelConfig,
    /// Vats whose worker is running and caught up with the transcript. Not persisted:
    /// after a restart every vat is replayed before its next delivery.
    online: BTreeSet<VatId>,
    /// Set by the first fatal error; the kernel refuses all further work.
    panic: Option<String>,
}

/// Open a kernel over `store`, writing the initial tables if the store is empty.
pub fn open_kernel<S: KvStore>(
    store: Arc<S>,
    vat_manager: Box<dyn VatManager>,
    config: KernelConfig,
) -> KernelResult<Kernel<S>> {
    let mut state = KernelState::new(store);
    if state.initialize_if_needed()? {
        state.commit()?;
        log::info!("initialized kernel tables");
    } else {
        log::info!("opened kernel at crank {}", state.crank_number()?);
    }
    Ok(Kernel {
        state,
        vat_manager,
        config,
        online: BTreeSet::new(),
        panic: None,
    })
}

impl<S: KvStore> Kernel<S> {
    pub fn state(&self) -> &KernelState<S> {
        &self.state
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn panic_reason(&self) -> Option<&str> {
        self.panic.as_deref()
    }

    fn check_panic(&self) -> KernelResult<()> {
        match &self.panic {
            Some(reason) => Err(KernelError::Panicked(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&mut self, err: &KernelError) {
        log::error!("kernel panic: {err}");
        self.state.discard();
        self.panic = Some(err.to_string());
    }

    /// Run a host-initiated change as its own transaction, outside any crank.
    fn host_op<T>(&mut self, op: impl FnOnce(&mut Self) -> KernelResult<T>) -> KernelResult<T> {
        self.check_panic()?;
        let result = op(self).and_then(|value| {
            self.state.process_refcounts()?;
            self.state.commit()?;
            Ok(value)
        });
        if let Err(err) = &result {
            if err.is_fatal() {
                self.halt(err);
            } else {
                self.state.discard();
            }
        }
        result
    }

    /// Register a vat. Its worker is started on first delivery. The root object `o+0` is
    /// exported and pinned.
    pub fn create_vat(&mut self, name: &str, options: VatOptions) -> KernelResult<VatId> {
        self.host_op(|kernel| {
            let vat = kernel.state.allocate_vat(name, options)?;
            kernel.state.init_transcript(vat)?;
            if let Some(interval) = kernel.config.reap_interval {
                kernel.state.set_reap_countdown(vat, interval)?;
            }
            let root = kernel
                .state
                .provide_kernel_for_vat_ref(vat, VatRef::object_export(0), true)
                .map_err(|err| match err {
                    SyscallFailure::Kernel(err) => err,
                    SyscallFailure::Vat(err) => {
                        KernelError::consistency(format!("exporting root of {vat}: {err}"))
                    }
                })?;
            kernel.state.pin_object(root)?;
            log::info!("created vat {vat} '{name}' with root {root}");
            Ok(vat)
        })
    }

    pub fn vat_root(&self, vat: VatId) -> KernelResult<KernelRef> {
        self.state
            .kref_for_vref(vat, VatRef::object_export(0))?
            .ok_or(KernelError::UnknownVat(vat))
    }

    /// Queue a message from outside any vat. With `want_result` the message gets a
    /// kernel-decided result promise that the host holds for as long as the kernel lives.
    pub fn queue_to_kref(
        &mut self,
        target: KernelRef,
        methargs: KernelCapData,
        want_result: bool,
    ) -> KernelResult<Option<KernelRef>> {
        self.host_op(|kernel| {
            for kref in std::iter::once(&target).chain(&methargs.slots) {
                let known = match kref {
                    KernelRef::Object(_) => kernel.state.object_exists(*kref)?,
                    KernelRef::Promise(_) => kernel.state.promise_state(*kref)?.is_some(),
                };
                if !known {
                    return Err(KernelError::UnknownRef(*kref));
                }
            }
            let result = if want_result {
                let kpid = kernel.state.add_kernel_promise(None)?;
                kernel.state.incref(kpid, RefStrength::Strong)?;
                Some(kpid)
            } else {
                None
            };
            kernel
                .state
                .enqueue_send(target, KernelMessage::new(methargs, result))?;
            Ok(result)
        })
    }

    pub fn kp_status(&self, kpid: KernelRef) -> KernelResult<PromiseStatus> {
        Ok(self
            .state
            .promise_state(kpid)?
            .ok_or(KernelError::UnknownRef(kpid))?
            .status())
    }

    /// `(rejected, data)` of a settled promise, `None` while unresolved.
    pub fn kp_resolution(&self, kpid: KernelRef) -> KernelResult<Option<(bool, KernelCapData)>> {
        let state = self
            .state
            .promise_state(kpid)?
            .ok_or(KernelError::UnknownRef(kpid))?;
        Ok(state.resolution().map(|(rejected, data)| (rejected, data.clone())))
    }

    /// Settle a promise the kernel decides.
    pub fn resolve(
        &mut self,
        kpid: KernelRef,
        rejected: bool,
        data: KernelCapData,
    ) -> KernelResult<()> {
        self.host_op(|kernel| {
            let state = kernel
                .state
                .promise_state(kpid)?
                .ok_or(KernelError::UnknownRef(kpid))?;
            if state.status() != PromiseStatus::Unresolved {
                return Err(KernelError::AlreadySettled(kpid));
            }
            if let Some(decider) = state.decider() {
                return Err(KernelError::NotKernelDecided { kpid, decider });
            }
            if data.slots.contains(&kpid) {
                return Err(KernelError::ResolvedToItself(kpid));
            }
            kernel.state.resolve_promise(kpid, rejected, data)
        })
    }

    pub fn pin_object(&mut self, kref: KernelRef) -> KernelResult<bool> {
        self.host_op(|kernel| kernel.state.pin_object(kref))
    }

    pub fn run_queue_len(&self) -> KernelResult<u64> {
        self.state.run_queue_len()
    }

    /// Nothing left to do: no GC actions, reaps or run-queue entries.
    pub fn is_idle(&self) -> KernelResult<bool> {
        Ok(self.state.gc_actions()?.is_empty()
            && self.state.reap_queue()?.is_empty()
            && self.state.run_queue_len()? == 0)
    }
}

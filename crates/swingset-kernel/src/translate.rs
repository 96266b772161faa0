//! Translation between the kernel's view (krefs) and a vat's view (vrefs).
//!
//! Kernel-to-vat translation runs for each delivery and may allocate imports in the
//! receiving vat's c-list. Vat-to-kernel translation runs for each syscall and may
//! allocate kernel objects and promises for new exports; a vref the vat has no right to
//! use is reported as a [`SyscallError`].

use std::collections::{BTreeSet, VecDeque};

use swingset_store::KvStore;

use crate::error::{KernelError, KernelResult, SyscallError, SyscallFailure};
use crate::gc::{GcActionKind, GcBatch};
use crate::message::{KernelCapData, KernelMessage, VatCapData};
use crate::refs::{KernelRef, VatId, VatRef};
use crate::state::{KernelState, PromiseState, PromiseStatus};
use crate::syscall::KernelSyscall;
use crate::vat::{VatDelivery, VatResolution, VatSyscall};

impl<S: KvStore> KernelState<S> {
    fn data_for_vat(&mut self, vat: VatId, data: &KernelCapData) -> KernelResult<VatCapData> {
        data.map_slots(|slot| self.provide_vat_for_kernel_ref(vat, *slot, true))
    }

    /// A message delivery. The receiving vat becomes the decider of the result promise. A
    /// result the host already settled is left off the delivery.
    pub(crate) fn translate_message(
        &mut self,
        vat: VatId,
        target: KernelRef,
        message: &KernelMessage,
    ) -> KernelResult<VatDelivery> {
        let target = self.provide_vat_for_kernel_ref(vat, target, true)?;
        let methargs = self.data_for_vat(vat, &message.methargs)?;
        let result = match message.result {
            Some(kpid)
                if self.promise_state_required(kpid)?.status() == PromiseStatus::Unresolved =>
            {
                let vpid = self.provide_vat_for_kernel_ref(vat, kpid, true)?;
                self.set_decider(kpid, Some(vat))?;
                Some(vpid)
            }
            Some(kpid) => {
                log::debug!("result {kpid} already settled; delivering to {vat} without it");
                None
            }
            None => None,
        };
        Ok(VatDelivery::Message {
            target,
            message: crate::message::Message::new(methargs, result),
        })
    }

    /// A notify for `kpid`, together with every other settled promise reachable from its
    /// resolution data that the vat also knows. The vat forgets all of them afterwards.
    /// Returns `None` when the vat no longer knows `kpid`.
    pub(crate) fn translate_notify(
        &mut self,
        vat: VatId,
        kpid: KernelRef,
    ) -> KernelResult<Option<VatDelivery>> {
        if self.clist_entry(vat, kpid)?.is_none() {
            return Ok(None);
        }
        let kpids = self.kpids_to_retire(vat, kpid)?;
        if kpids.is_empty() {
            return Err(KernelError::consistency(format!(
                "notify {vat} of unresolved {kpid}"
            )));
        }
        let mut resolutions = Vec::with_capacity(kpids.len());
        for &kp in &kpids {
            let state = self.promise_state_required(kp)?;
            let Some((rejected, data)) = state.resolution() else {
                continue;
            };
            let vpid = self.provide_vat_for_kernel_ref(vat, kp, true)?;
            resolutions.push(VatResolution {
                vpid,
                rejected,
                data: self.data_for_vat(vat, data)?,
            });
        }
        for kp in kpids {
            self.delete_clist_entry(vat, kp)?;
        }
        Ok(Some(VatDelivery::Notify { resolutions }))
    }

    /// Settled promises the vat knows, starting at `kpid` and following promise slots in
    /// resolution data, breadth first.
    pub(crate) fn kpids_to_retire(
        &self,
        vat: VatId,
        kpid: KernelRef,
    ) -> KernelResult<Vec<KernelRef>> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut pending = VecDeque::from([kpid]);
        while let Some(kp) = pending.pop_front() {
            if !seen.insert(kp) || self.clist_entry(vat, kp)?.is_none() {
                continue;
            }
            let Some(state) = self.promise_state(kp)? else {
                continue;
            };
            if let PromiseState::Fulfilled { data } | PromiseState::Rejected { data } = state {
                order.push(kp);
                pending.extend(data.slots.iter().copied().filter(KernelRef::is_promise));
            }
        }
        Ok(order)
    }

    /// A GC delivery. Drops clear the exporter's reachable flag; retirements delete the
    /// vat's entries (and, for exports, the kernel object).
    pub(crate) fn translate_gc(&mut self, batch: &GcBatch) -> KernelResult<VatDelivery> {
        let vat = batch.vat;
        let mut vrefs = Vec::with_capacity(batch.krefs.len());
        for &kref in &batch.krefs {
            let vref = self.vref_for_kref(vat, kref)?.ok_or_else(|| {
                KernelError::consistency(format!("{vat} has no entry for gc target {kref}"))
            })?;
            vrefs.push(vref);
            match batch.kind {
                GcActionKind::DropExport => {
                    self.unmark_reachable(vat, kref)?;
                }
                GcActionKind::RetireExport => {
                    self.delete_clist_entry(vat, kref)?;
                    self.delete_object(kref);
                }
                GcActionKind::RetireImport => self.delete_clist_entry(vat, kref)?,
            }
        }
        Ok(match batch.kind {
            GcActionKind::DropExport => VatDelivery::DropExports { vrefs },
            GcActionKind::RetireExport => VatDelivery::RetireExports { vrefs },
            GcActionKind::RetireImport => VatDelivery::RetireImports { vrefs },
        })
    }

    fn kref_for_syscall(
        &mut self,
        vat: VatId,
        vref: VatRef,
        set_reachable: bool,
    ) -> Result<KernelRef, SyscallFailure> {
        self.provide_kernel_for_vat_ref(vat, vref, set_reachable)
    }

    fn data_from_vat(
        &mut self,
        vat: VatId,
        data: &VatCapData,
    ) -> Result<KernelCapData, SyscallFailure> {
        data.map_slots(|slot| self.kref_for_syscall(vat, *slot, true))
    }

    /// A promise this vat may resolve or hand off as a message result.
    fn decided_promise(&mut self, vat: VatId, vpid: VatRef) -> Result<KernelRef, SyscallFailure> {
        if !vpid.is_promise() {
            return Err(SyscallError::WrongKind {
                vref: vpid,
                expected: "a promise",
            }
            .into());
        }
        let kpid = self.kref_for_syscall(vat, vpid, true)?;
        match self.promise_state_required(kpid)? {
            PromiseState::Unresolved { decider, .. } if decider == Some(vat) => Ok(kpid),
            PromiseState::Unresolved { .. } => Err(SyscallError::NotDecider(vpid).into()),
            _ => Err(SyscallError::AlreadyResolved(vpid).into()),
        }
    }

    /// Objects a GC syscall names: all known to the vat, of the right direction, and each
    /// named once.
    fn gc_targets(
        &self,
        vat: VatId,
        vrefs: &[VatRef],
        exported: bool,
    ) -> Result<Vec<KernelRef>, SyscallFailure> {
        let expected = if exported {
            "an exported object"
        } else {
            "an imported object"
        };
        let mut seen = BTreeSet::new();
        let mut krefs = Vec::with_capacity(vrefs.len());
        for &vref in vrefs {
            if !vref.is_object() || vref.is_exported() != exported {
                return Err(SyscallError::WrongKind { vref, expected }.into());
            }
            if !seen.insert(vref) {
                return Err(SyscallError::Duplicate(vref).into());
            }
            let kref = self
                .kref_for_vref(vat, vref)?
                .ok_or(SyscallError::UnknownVref(vref))?;
            krefs.push(kref);
        }
        Ok(krefs)
    }

    pub(crate) fn translate_syscall(
        &mut self,
        vat: VatId,
        syscall: &VatSyscall,
    ) -> Result<KernelSyscall, SyscallFailure> {
        Ok(match syscall {
            VatSyscall::Send { target, message } => {
                let result = match message.result {
                    Some(vpid) => Some(self.decided_promise(vat, vpid)?),
                    None => None,
                };
                let target = self.kref_for_syscall(vat, *target, true)?;
                let methargs = self.data_from_vat(vat, &message.methargs)?;
                KernelSyscall::Send {
                    target,
                    message: KernelMessage::new(methargs, result),
                }
            }
            VatSyscall::Resolve { resolutions } => {
                let mut seen = BTreeSet::new();
                let mut translated = Vec::with_capacity(resolutions.len());
                for resolution in resolutions {
                    if !seen.insert(resolution.vpid) {
                        return Err(SyscallError::Duplicate(resolution.vpid).into());
                    }
                    let kpid = self.decided_promise(vat, resolution.vpid)?;
                    let data = self.data_from_vat(vat, &resolution.data)?;
                    if data.slots.contains(&kpid) {
                        return Err(SyscallError::ResolvedToItself(resolution.vpid).into());
                    }
                    translated.push((kpid, resolution.rejected, data));
                }
                KernelSyscall::Resolve {
                    resolutions: translated,
                }
            }
            VatSyscall::Subscribe { vpid } => {
                if !vpid.is_promise() {
                    return Err(SyscallError::WrongKind {
                        vref: *vpid,
                        expected: "a promise",
                    }
                    .into());
                }
                KernelSyscall::Subscribe {
                    kpid: self.kref_for_syscall(vat, *vpid, true)?,
                }
            }
            VatSyscall::Exit { failure, info } => KernelSyscall::Exit {
                failure: *failure,
                info: self.data_from_vat(vat, info)?,
            },
            VatSyscall::DropImports { vrefs } => KernelSyscall::DropImports {
                krefs: self.gc_targets(vat, vrefs, false)?,
            },
            VatSyscall::RetireImports { vrefs } => KernelSyscall::RetireImports {
                krefs: self.gc_targets(vat, vrefs, false)?,
            },
            VatSyscall::RetireExports { vrefs } => KernelSyscall::RetireExports {
                krefs: self.gc_targets(vat, vrefs, true)?,
            },
            VatSyscall::AbandonExports { vrefs } => KernelSyscall::AbandonExports {
                krefs: self.gc_targets(vat, vrefs, true)?,
            },
            VatSyscall::VatstoreGet { key } => KernelSyscall::VatstoreGet {
                key: vatstore_key(key)?,
            },
            VatSyscall::VatstoreSet { key, value } => KernelSyscall::VatstoreSet {
                key: vatstore_key(key)?,
                value: value.clone(),
            },
            VatSyscall::VatstoreDelete { key } => KernelSyscall::VatstoreDelete {
                key: vatstore_key(key)?,
            },
        })
    }
}

fn vatstore_key(key: &str) -> Result<String, SyscallError> {
    if key.is_empty() || key.chars().any(char::is_control) {
        return Err(SyscallError::BadVatstoreKey(key.to_string()));
    }
    Ok(key.to_string())
}

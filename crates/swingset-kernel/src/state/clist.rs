//! Per-vat translation tables between kernel refs and vat refs.
//!
//! Each entry is stored twice, `<vat>.c.<kref>` holding the [`ClistEntry`] and
//! `<vat>.c.<vref>` holding the kref, so both directions are a single lookup.
//!
//! Import entries contribute to the object's counts: recognizable and reachable
//! while the matching flags are set. Export entries belong to the owner and count for
//! nothing. Promise entries hold one reference each.

use serde::{Deserialize, Serialize};
use swingset_store::KvStore;

use super::{KernelState, RefStrength, keys};
use crate::error::{KernelError, KernelResult, SyscallError, SyscallFailure};
use crate::refs::{Durability, KernelRef, VatId, VatRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClistEntry {
    pub vref: VatRef,
    /// For objects, whether the vat can currently reach it. Promise entries are always
    /// reachable.
    pub reachable: bool,
    /// Whether the vat can still compare the object's identity. Cleared just before an
    /// import is retired.
    pub recognizable: bool,
    /// Fixed when the entry is created.
    pub durability: Durability,
}

impl ClistEntry {
    fn is_import(&self) -> bool {
        self.vref.is_object() && !self.vref.is_exported()
    }
}

impl<S: KvStore> KernelState<S> {
    pub fn clist_entry(&self, vat: VatId, kref: KernelRef) -> KernelResult<Option<ClistEntry>> {
        self.get(&keys::clist(vat, kref))
    }

    pub fn kref_for_vref(&self, vat: VatId, vref: VatRef) -> KernelResult<Option<KernelRef>> {
        self.get(&keys::clist(vat, vref))
    }

    pub fn vref_for_kref(&self, vat: VatId, kref: KernelRef) -> KernelResult<Option<VatRef>> {
        Ok(self.clist_entry(vat, kref)?.map(|entry| entry.vref))
    }

    /// Every entry of one vat's c-list, in kref order.
    pub fn clist(&self, vat: VatId) -> KernelResult<Vec<(KernelRef, ClistEntry)>> {
        let prefix = keys::clist_prefix(vat);
        let mut entries = Vec::new();
        for (key, _) in self.scan_prefix(&prefix)? {
            let Ok(kref) = key[prefix.len()..].parse::<KernelRef>() else {
                continue;
            };
            entries.push((kref, self.get_required(&key)?));
        }
        entries.sort_by_key(|(kref, _)| *kref);
        Ok(entries)
    }

    pub(crate) fn add_clist_entry(
        &mut self,
        vat: VatId,
        kref: KernelRef,
        vref: VatRef,
        reachable: bool,
    ) -> KernelResult<()> {
        if self.has(&keys::clist(vat, kref))? || self.has(&keys::clist(vat, vref))? {
            return Err(KernelError::consistency(format!(
                "duplicate c-list entry {vat} {kref} <-> {vref}"
            )));
        }
        let entry = ClistEntry {
            vref,
            reachable: reachable || vref.is_promise(),
            recognizable: true,
            durability: vref.durability(),
        };
        if kref.is_promise() {
            self.incref(kref, RefStrength::Strong)?;
        } else if entry.is_import() {
            self.incref(kref, RefStrength::RecognizeOnly)?;
            if entry.reachable {
                self.incref(kref, RefStrength::ReachOnly)?;
            }
        }
        self.set(&keys::clist(vat, kref), &entry)?;
        self.set(&keys::clist(vat, vref), &kref)
    }

    /// Translate a vref the vat handed to the kernel. Unknown exports are allocated as new
    /// kernel objects or promises; unknown imports and exported promise ids the vat
    /// already retired are the vat's mistake.
    pub(crate) fn provide_kernel_for_vat_ref(
        &mut self,
        vat: VatId,
        vref: VatRef,
        set_reachable: bool,
    ) -> Result<KernelRef, SyscallFailure> {
        if let Some(kref) = self.kref_for_vref(vat, vref)? {
            if set_reachable {
                self.mark_reachable(vat, kref)?;
            }
            return Ok(kref);
        }
        if !vref.is_exported() {
            return Err(SyscallError::UnknownVref(vref).into());
        }
        if vref.is_promise() && self.has(&keys::retired_promise(vat, vref))? {
            return Err(SyscallError::RetiredVref(vref).into());
        }
        let kref = if vref.is_object() {
            self.add_kernel_object(vat)?
        } else {
            self.add_kernel_promise(Some(vat))?
        };
        log::trace!("{vat} exported {vref} as {kref}");
        self.add_clist_entry(vat, kref, vref, set_reachable)?;
        Ok(kref)
    }

    /// Translate a kref the kernel is handing to a vat, allocating an import if the vat
    /// has never seen it.
    pub(crate) fn provide_vat_for_kernel_ref(
        &mut self,
        vat: VatId,
        kref: KernelRef,
        set_reachable: bool,
    ) -> KernelResult<VatRef> {
        if let Some(entry) = self.clist_entry(vat, kref)? {
            if set_reachable {
                self.mark_reachable(vat, kref)?;
            }
            return Ok(entry.vref);
        }
        let vref = match kref {
            KernelRef::Object(_) => {
                if self.object_owner(kref)? == Some(vat) {
                    return Err(KernelError::consistency(format!(
                        "{vat} owns {kref} but has no c-list entry for it"
                    )));
                }
                VatRef::object_import(self.next_id(&keys::import_object_next_id(vat))?)
            }
            KernelRef::Promise(_) => {
                VatRef::promise_import(self.next_id(&keys::import_promise_next_id(vat))?)
            }
        };
        log::trace!("{vat} imported {kref} as {vref}");
        self.add_clist_entry(vat, kref, vref, set_reachable)?;
        Ok(vref)
    }

    pub(crate) fn mark_reachable(&mut self, vat: VatId, kref: KernelRef) -> KernelResult<()> {
        self.mark_recognizable(vat, kref)?;
        let key = keys::clist(vat, kref);
        let mut entry: ClistEntry = self.get_required(&key)?;
        if entry.reachable {
            return Ok(());
        }
        entry.reachable = true;
        if entry.is_import() {
            self.incref(kref, RefStrength::ReachOnly)?;
        }
        self.set(&key, &entry)
    }

    /// Clear the reachable flag, returning whether it was set.
    pub(crate) fn unmark_reachable(&mut self, vat: VatId, kref: KernelRef) -> KernelResult<bool> {
        let key = keys::clist(vat, kref);
        let mut entry: ClistEntry = self.get_required(&key)?;
        if !entry.reachable || kref.is_promise() {
            return Ok(false);
        }
        entry.reachable = false;
        if entry.is_import() {
            self.decref(kref, RefStrength::ReachOnly)?;
        }
        self.set(&key, &entry)?;
        Ok(true)
    }

    pub(crate) fn mark_recognizable(&mut self, vat: VatId, kref: KernelRef) -> KernelResult<()> {
        let key = keys::clist(vat, kref);
        let mut entry: ClistEntry = self.get_required(&key)?;
        if entry.recognizable {
            return Ok(());
        }
        entry.recognizable = true;
        if entry.is_import() {
            self.incref(kref, RefStrength::RecognizeOnly)?;
        }
        self.set(&key, &entry)
    }

    /// Clear the recognizable flag. Only an unreachable entry may lose recognition.
    pub(crate) fn unmark_recognizable(&mut self, vat: VatId, kref: KernelRef) -> KernelResult<bool> {
        let key = keys::clist(vat, kref);
        let mut entry: ClistEntry = self.get_required(&key)?;
        if !entry.recognizable || kref.is_promise() {
            return Ok(false);
        }
        if entry.reachable {
            return Err(KernelError::consistency(format!(
                "{vat} {kref} cannot stop being recognizable while reachable"
            )));
        }
        entry.recognizable = false;
        if entry.is_import() {
            self.decref(kref, RefStrength::RecognizeOnly)?;
        }
        self.set(&key, &entry)?;
        Ok(true)
    }

    /// Remove both rows of an entry and whatever counts it contributed. An exported
    /// promise id is remembered as retired so the vat cannot export it again.
    pub(crate) fn delete_clist_entry(&mut self, vat: VatId, kref: KernelRef) -> KernelResult<()> {
        let key = keys::clist(vat, kref);
        let Some(entry) = self.get::<ClistEntry>(&key)? else {
            return Ok(());
        };
        if kref.is_promise() {
            self.decref(kref, RefStrength::Strong)?;
        } else if entry.is_import() {
            if entry.reachable {
                self.decref(kref, RefStrength::ReachOnly)?;
            }
            if entry.recognizable {
                self.decref(kref, RefStrength::RecognizeOnly)?;
            }
        }
        self.delete(&key);
        self.delete(&keys::clist(vat, entry.vref));
        if entry.vref.is_promise() && entry.vref.is_exported() {
            self.set(&keys::retired_promise(vat, entry.vref), &true)?;
        }
        Ok(())
    }

    /// Live vats holding an import entry for `kref`, in vat order.
    pub(crate) fn importers_of(&self, kref: KernelRef) -> KernelResult<Vec<VatId>> {
        let mut importers = Vec::new();
        for vat in self.live_vats()? {
            if let Some(entry) = self.clist_entry(vat, kref)?
                && entry.is_import()
            {
                importers.push(vat);
            }
        }
        Ok(importers)
    }
}

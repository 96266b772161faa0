//! Cross-vat garbage collection.
//!
//! Reference counts live with the objects (see [`crate::state::RefCount`]). Whenever a
//! count may have reached zero the kref lands in the possibly-dead set; before each
//! commit [`KernelState::process_refcounts`] drains that set to a fixpoint and turns
//! what it finds into GC actions for the owning and importing vats. Actions are kept in
//! a persisted ordered set, so queueing the same action twice is a no-op.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use swingset_store::KvStore;

use crate::error::KernelResult;
use crate::refs::{KernelRef, VatId};
use crate::state::{KernelState, PromiseState, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GcActionKind {
    /// Tell the exporter nobody can reach the object any more.
    DropExport,
    /// Tell the exporter nobody can recognize it either; the kernel object goes away.
    RetireExport,
    /// Tell an importer the object is gone for good.
    RetireImport,
}

impl GcActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GcActionKind::DropExport => "dropExport",
            GcActionKind::RetireExport => "retireExport",
            GcActionKind::RetireImport => "retireImport",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GcAction {
    pub vat: VatId,
    pub kind: GcActionKind,
    pub kref: KernelRef,
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat, self.kind.as_str(), self.kref)
    }
}

/// One delivery's worth of GC work: a single vat and action kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcBatch {
    pub vat: VatId,
    pub kind: GcActionKind,
    /// Sorted and free of repeats. Empty when every queued action had been negated.
    pub krefs: Vec<KernelRef>,
}

impl<S: KvStore> KernelState<S> {
    pub fn gc_actions(&self) -> KernelResult<BTreeSet<GcAction>> {
        Ok(self.get(keys::GC_ACTIONS)?.unwrap_or_default())
    }

    pub(crate) fn add_gc_actions(
        &mut self,
        actions: impl IntoIterator<Item = GcAction>,
    ) -> KernelResult<()> {
        let mut queued = self.gc_actions()?;
        let before = queued.len();
        queued.extend(actions);
        if queued.len() != before {
            self.set(keys::GC_ACTIONS, &queued)?;
        }
        Ok(())
    }

    /// Drain the possibly-dead set, deleting what is gone and queueing GC actions for
    /// what vats must be told. Deleting one thing can free others, so this runs until
    /// the set stays empty.
    pub(crate) fn process_refcounts(&mut self) -> KernelResult<()> {
        while let Some(kref) = self.take_possibly_dead() {
            match kref {
                KernelRef::Promise(_) => self.collect_promise(kref)?,
                KernelRef::Object(_) => self.collect_object(kref)?,
            }
        }
        Ok(())
    }

    fn collect_promise(&mut self, kpid: KernelRef) -> KernelResult<()> {
        let Some(count) = self.promise_refcount(kpid)? else {
            return Ok(());
        };
        if count > 0 {
            return Ok(());
        }
        // Unresolved promises keep their row so the decider can still settle them.
        if let Some(PromiseState::Fulfilled { .. } | PromiseState::Rejected { .. }) =
            self.promise_state(kpid)?
        {
            log::trace!("collecting {kpid}");
            self.delete_promise(kpid)?;
        }
        Ok(())
    }

    fn collect_object(&mut self, kref: KernelRef) -> KernelResult<()> {
        let Some(count) = self.object_refcount(kref)? else {
            return Ok(());
        };
        match self.object_owner(kref)? {
            Some(owner) => {
                let mut actions = Vec::new();
                let exported_reachable = self
                    .clist_entry(owner, kref)?
                    .is_some_and(|entry| entry.reachable);
                if count.reachable == 0 && exported_reachable {
                    actions.push(GcAction {
                        vat: owner,
                        kind: GcActionKind::DropExport,
                        kref,
                    });
                }
                if count.recognizable == 0 {
                    actions.push(GcAction {
                        vat: owner,
                        kind: GcActionKind::RetireExport,
                        kref,
                    });
                }
                self.add_gc_actions(actions)
            }
            None if count.recognizable == 0 => {
                log::trace!("collecting orphaned {kref}");
                self.delete_object(kref);
                Ok(())
            }
            // Orphaned and unreachable: nobody can ever hand it out again, so its
            // remaining importers are told to forget it.
            None if count.reachable == 0 => self.retire_imports_of(kref),
            None => Ok(()),
        }
    }

    fn retire_imports_of(&mut self, kref: KernelRef) -> KernelResult<()> {
        let actions: Vec<GcAction> = self
            .importers_of(kref)?
            .into_iter()
            .map(|vat| GcAction {
                vat,
                kind: GcActionKind::RetireImport,
                kref,
            })
            .collect();
        self.add_gc_actions(actions)
    }

    /// The exporter declared these objects gone. Importers are told to retire them and
    /// the kernel objects are deleted.
    pub(crate) fn retire_kernel_objects(
        &mut self,
        exporter: VatId,
        krefs: &[KernelRef],
    ) -> KernelResult<()> {
        for &kref in krefs {
            self.retire_imports_of(kref)?;
            self.delete_clist_entry(exporter, kref)?;
            self.delete_object(kref);
        }
        Ok(())
    }

    /// Remove the first (vat, kind) group from the action set and keep only the actions
    /// that still apply.
    pub(crate) fn take_gc_batch(&mut self) -> KernelResult<Option<GcBatch>> {
        let mut queued = self.gc_actions()?;
        let Some(first) = queued.first().copied() else {
            return Ok(None);
        };
        let group: Vec<GcAction> = queued
            .iter()
            .filter(|action| action.vat == first.vat && action.kind == first.kind)
            .copied()
            .collect();
        for action in &group {
            queued.remove(action);
        }
        self.set(keys::GC_ACTIONS, &queued)?;

        let mut krefs = Vec::with_capacity(group.len());
        for action in group {
            if self.gc_action_applies(&action)? {
                krefs.push(action.kref);
            } else {
                log::debug!("negated gc action {action}");
            }
        }
        Ok(Some(GcBatch {
            vat: first.vat,
            kind: first.kind,
            krefs,
        }))
    }

    fn gc_action_applies(&self, action: &GcAction) -> KernelResult<bool> {
        if !self.vat_is_alive(action.vat)? {
            return Ok(false);
        }
        let Some(entry) = self.clist_entry(action.vat, action.kref)? else {
            return Ok(false);
        };
        match action.kind {
            GcActionKind::RetireImport => Ok(!entry.vref.is_exported()),
            GcActionKind::DropExport | GcActionKind::RetireExport => {
                if self.object_owner(action.kref)? != Some(action.vat) {
                    return Ok(false);
                }
                let Some(count) = self.object_refcount(action.kref)? else {
                    return Ok(false);
                };
                Ok(match action.kind {
                    GcActionKind::DropExport => count.reachable == 0 && entry.reachable,
                    _ => count.recognizable == 0,
                })
            }
        }
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use swingset_store::KvStore;

use super::{KernelState, keys};
use crate::error::{KernelError, KernelResult};
use crate::refs::{KernelRef, VatId};

/// Object reference counts. Every recognizable holder may also be reachable, never the
/// other way round, so `reachable <= recognizable` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCount {
    pub reachable: u64,
    pub recognizable: u64,
}

/// Which half of an object's count a reference contributes to. Promises keep a single
/// count and ignore the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefStrength {
    Strong,
    ReachOnly,
    RecognizeOnly,
}

impl RefStrength {
    fn split(self) -> (u64, u64) {
        match self {
            RefStrength::Strong => (1, 1),
            RefStrength::ReachOnly => (1, 0),
            RefStrength::RecognizeOnly => (0, 1),
        }
    }
}

impl<S: KvStore> KernelState<S> {
    pub(crate) fn add_kernel_object(&mut self, owner: VatId) -> KernelResult<KernelRef> {
        let kref = KernelRef::Object(self.next_id(keys::KO_NEXT_ID)?);
        self.set(&keys::object_owner(kref), &owner)?;
        self.set(&keys::refcount(kref), &RefCount::default())?;
        Ok(kref)
    }

    pub fn object_exists(&self, kref: KernelRef) -> KernelResult<bool> {
        Ok(kref.is_object() && self.has(&keys::refcount(kref))?)
    }

    /// Owning vat, or `None` once the object is orphaned (owner terminated or abandoned it).
    pub fn object_owner(&self, kref: KernelRef) -> KernelResult<Option<VatId>> {
        self.get(&keys::object_owner(kref))
    }

    pub fn object_refcount(&self, kref: KernelRef) -> KernelResult<Option<RefCount>> {
        self.get(&keys::refcount(kref))
    }

    fn set_object_refcount(&mut self, kref: KernelRef, count: RefCount) -> KernelResult<()> {
        if count.reachable > count.recognizable {
            return Err(KernelError::consistency(format!(
                "{kref} reachable count {} exceeds recognizable count {}",
                count.reachable, count.recognizable
            )));
        }
        self.set(&keys::refcount(kref), &count)
    }

    pub fn promise_refcount(&self, kpid: KernelRef) -> KernelResult<Option<u64>> {
        self.get(&keys::refcount(kpid))
    }

    pub(crate) fn incref(&mut self, kref: KernelRef, strength: RefStrength) -> KernelResult<()> {
        let key = keys::refcount(kref);
        match kref {
            KernelRef::Promise(_) => {
                let count: u64 = self.get_required(&key)?;
                self.set(&key, &(count + 1))
            }
            KernelRef::Object(_) => {
                let mut count: RefCount = self.get_required(&key)?;
                let (reach, recognize) = strength.split();
                count.reachable += reach;
                count.recognizable += recognize;
                self.set_object_refcount(kref, count)
            }
        }
    }

    /// Drop one reference. Anything that might now be unreferenced is queued for the
    /// next GC pass. Decrementing a deleted object is a no-op: its last holders are
    /// still letting go while it is retired.
    pub(crate) fn decref(&mut self, kref: KernelRef, strength: RefStrength) -> KernelResult<()> {
        let key = keys::refcount(kref);
        match kref {
            KernelRef::Promise(_) => {
                let count: u64 = self.get_required(&key)?;
                let count = count.checked_sub(1).ok_or_else(|| {
                    KernelError::consistency(format!("refcount underflow on {kref}"))
                })?;
                self.set(&key, &count)?;
                if count == 0 {
                    self.possibly_dead.insert(kref);
                }
                Ok(())
            }
            KernelRef::Object(_) => {
                let Some(mut count) = self.get::<RefCount>(&key)? else {
                    return Ok(());
                };
                let (reach, recognize) = strength.split();
                let underflow = || KernelError::consistency(format!("refcount underflow on {kref}"));
                count.reachable = count.reachable.checked_sub(reach).ok_or_else(underflow)?;
                count.recognizable = count
                    .recognizable
                    .checked_sub(recognize)
                    .ok_or_else(underflow)?;
                if count.reachable == 0 || count.recognizable == 0 {
                    self.possibly_dead.insert(kref);
                }
                self.set_object_refcount(kref, count)
            }
        }
    }

    pub(crate) fn mark_possibly_dead(&mut self, kref: KernelRef) {
        self.possibly_dead.insert(kref);
    }

    pub(crate) fn take_possibly_dead(&mut self) -> Option<KernelRef> {
        self.possibly_dead.pop_first()
    }

    /// Clear the owner so the object is collected once its importers let go.
    pub(crate) fn orphan_object(&mut self, kref: KernelRef) {
        self.delete(&keys::object_owner(kref));
        self.possibly_dead.insert(kref);
    }

    pub(crate) fn delete_object(&mut self, kref: KernelRef) {
        self.delete(&keys::object_owner(kref));
        self.delete(&keys::refcount(kref));
    }

    /// Hold a permanent strong reference so the object is never collected.
    pub(crate) fn pin_object(&mut self, kref: KernelRef) -> KernelResult<bool> {
        if !self.object_exists(kref)? {
            return Err(KernelError::UnknownRef(kref));
        }
        let mut pinned: BTreeSet<KernelRef> = self.get(keys::PINNED)?.unwrap_or_default();
        if !pinned.insert(kref) {
            return Ok(false);
        }
        self.incref(kref, RefStrength::Strong)?;
        self.set(keys::PINNED, &pinned)?;
        Ok(true)
    }

    pub fn pinned_objects(&self) -> KernelResult<BTreeSet<KernelRef>> {
        Ok(self.get(keys::PINNED)?.unwrap_or_default())
    }
}

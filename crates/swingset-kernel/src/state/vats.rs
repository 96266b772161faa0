use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use swingset_store::KvStore;

use super::{KernelState, keys};
use crate::error::{KernelError, KernelResult};
use crate::refs::VatId;

const FIRST_IMPORT_OBJECT_ID: u64 = 50;
const FIRST_IMPORT_PROMISE_ID: u64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatOptions {
    /// Let messages sent to promises this vat decides go straight to it instead of
    /// waiting on the promise.
    pub enable_pipelining: bool,
    /// Terminating this vat halts the kernel.
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatInfo {
    pub name: String,
    pub options: VatOptions,
}

impl<S: KvStore> KernelState<S> {
    pub(crate) fn allocate_vat(&mut self, name: &str, options: VatOptions) -> KernelResult<VatId> {
        if self.has(&keys::vat_name(name))? {
            return Err(KernelError::DuplicateVatName(name.to_string()));
        }
        let id = self.next_id(keys::VAT_NEXT_ID)?;
        let vat = VatId(
            u32::try_from(id)
                .map_err(|_| KernelError::consistency(format!("vat id {id} out of range")))?,
        );
        let info = VatInfo {
            name: name.to_string(),
            options,
        };
        self.set(&keys::vat_info(vat), &info)?;
        self.set(&keys::vat_name(name), &vat)?;
        self.set(&keys::import_object_next_id(vat), &FIRST_IMPORT_OBJECT_ID)?;
        self.set(&keys::import_promise_next_id(vat), &FIRST_IMPORT_PROMISE_ID)?;
        let mut live = self.live_vat_set()?;
        live.insert(vat);
        self.set(keys::LIVE_VATS, &live)?;
        Ok(vat)
    }

    fn live_vat_set(&self) -> KernelResult<BTreeSet<VatId>> {
        Ok(self.get(keys::LIVE_VATS)?.unwrap_or_default())
    }

    pub fn live_vats(&self) -> KernelResult<Vec<VatId>> {
        Ok(self.live_vat_set()?.into_iter().collect())
    }

    /// Terminated vats, in termination order.
    pub fn terminated_vats(&self) -> KernelResult<Vec<VatId>> {
        Ok(self.get(keys::TERMINATED_VATS)?.unwrap_or_default())
    }

    pub fn vat_is_alive(&self, vat: VatId) -> KernelResult<bool> {
        Ok(self.live_vat_set()?.contains(&vat))
    }

    pub fn vat_info(&self, vat: VatId) -> KernelResult<Option<VatInfo>> {
        self.get(&keys::vat_info(vat))
    }

    pub fn vat_id_for_name(&self, name: &str) -> KernelResult<Option<VatId>> {
        self.get(&keys::vat_name(name))
    }

    pub(crate) fn mark_vat_terminated(&mut self, vat: VatId) -> KernelResult<()> {
        let mut live = self.live_vat_set()?;
        if !live.remove(&vat) {
            return Err(KernelError::UnknownVat(vat));
        }
        self.set(keys::LIVE_VATS, &live)?;
        let mut dead = self.terminated_vats()?;
        dead.push(vat);
        self.set(keys::TERMINATED_VATS, &dead)?;
        self.remove_from_reap_queue(vat)
    }

    pub fn vatstore_get(&self, vat: VatId, key: &str) -> KernelResult<Option<String>> {
        self.get(&keys::vatstore(vat, key))
    }

    pub(crate) fn vatstore_set(&mut self, vat: VatId, key: &str, value: &str) -> KernelResult<()> {
        self.set(&keys::vatstore(vat, key), value)
    }

    pub(crate) fn vatstore_delete(&mut self, vat: VatId, key: &str) {
        self.delete(&keys::vatstore(vat, key));
    }

    pub(crate) fn set_reap_countdown(&mut self, vat: VatId, countdown: u64) -> KernelResult<()> {
        self.set(&keys::reap_countdown(vat), &countdown)
    }

    /// Count one delivery against the vat's reap interval. Returns true (and resets the
    /// countdown) when the vat is due for a reap.
    pub(crate) fn tick_reap_countdown(&mut self, vat: VatId, interval: u64) -> KernelResult<bool> {
        let key = keys::reap_countdown(vat);
        let remaining: u64 = self.get(&key)?.unwrap_or(interval);
        if remaining <= 1 {
            self.set(&key, &interval)?;
            return Ok(true);
        }
        self.set(&key, &(remaining - 1))?;
        Ok(false)
    }

    pub(crate) fn schedule_reap(&mut self, vat: VatId) -> KernelResult<()> {
        let mut queue: Vec<VatId> = self.get(keys::REAP_QUEUE)?.unwrap_or_default();
        if !queue.contains(&vat) {
            queue.push(vat);
            self.set(keys::REAP_QUEUE, &queue)?;
        }
        Ok(())
    }

    pub(crate) fn next_reap(&mut self) -> KernelResult<Option<VatId>> {
        let mut queue: Vec<VatId> = self.get(keys::REAP_QUEUE)?.unwrap_or_default();
        if queue.is_empty() {
            return Ok(None);
        }
        let vat = queue.remove(0);
        self.set(keys::REAP_QUEUE, &queue)?;
        Ok(Some(vat))
    }

    pub fn reap_queue(&self) -> KernelResult<Vec<VatId>> {
        Ok(self.get(keys::REAP_QUEUE)?.unwrap_or_default())
    }

    fn remove_from_reap_queue(&mut self, vat: VatId) -> KernelResult<()> {
        let mut queue = self.reap_queue()?;
        let before = queue.len();
        queue.retain(|queued| *queued != vat);
        if queue.len() != before {
            self.set(keys::REAP_QUEUE, &queue)?;
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use swingset_store::KvStore;

use super::{KernelState, RefStrength, keys};
use crate::error::KernelResult;
use crate::message::KernelMessage;
use crate::refs::{KernelRef, VatId};

/// Pending work. Each entry holds references on every kref it names until the crank
/// that consumes it is done with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunQueueEntry {
    Send {
        target: KernelRef,
        message: KernelMessage,
    },
    Notify {
        vat: VatId,
        kpid: KernelRef,
    },
}

impl RunQueueEntry {
    pub fn krefs(&self) -> Vec<KernelRef> {
        match self {
            RunQueueEntry::Send { target, message } => {
                std::iter::once(*target).chain(message.krefs()).collect()
            }
            RunQueueEntry::Notify { kpid, .. } => vec![*kpid],
        }
    }
}

impl<S: KvStore> KernelState<S> {
    pub(crate) fn enqueue_send(
        &mut self,
        target: KernelRef,
        message: KernelMessage,
    ) -> KernelResult<()> {
        self.push_entry(RunQueueEntry::Send { target, message })
    }

    pub(crate) fn enqueue_notify(&mut self, vat: VatId, kpid: KernelRef) -> KernelResult<()> {
        self.push_entry(RunQueueEntry::Notify { vat, kpid })
    }

    fn push_entry(&mut self, entry: RunQueueEntry) -> KernelResult<()> {
        for kref in entry.krefs() {
            self.incref(kref, RefStrength::Strong)?;
        }
        let tail: u64 = self.get_required(keys::RUN_QUEUE_TAIL)?;
        self.set(&keys::run_queue_entry(tail), &entry)?;
        self.set(keys::RUN_QUEUE_TAIL, &(tail + 1))
    }

    /// Take the oldest entry. Its holds stay in place; the caller releases them with
    /// [`KernelState::release_entry`] once the entry has been routed.
    pub(crate) fn dequeue(&mut self) -> KernelResult<Option<RunQueueEntry>> {
        let head: u64 = self.get_required(keys::RUN_QUEUE_HEAD)?;
        let tail: u64 = self.get_required(keys::RUN_QUEUE_TAIL)?;
        if head == tail {
            return Ok(None);
        }
        let key = keys::run_queue_entry(head);
        let entry = self.get_required(&key)?;
        self.delete(&key);
        self.set(keys::RUN_QUEUE_HEAD, &(head + 1))?;
        Ok(Some(entry))
    }

    pub(crate) fn release_entry(&mut self, entry: &RunQueueEntry) -> KernelResult<()> {
        for kref in entry.krefs() {
            self.decref(kref, RefStrength::Strong)?;
        }
        Ok(())
    }

    pub fn run_queue_len(&self) -> KernelResult<u64> {
        let head: u64 = self.get_required(keys::RUN_QUEUE_HEAD)?;
        let tail: u64 = self.get_required(keys::RUN_QUEUE_TAIL)?;
        Ok(tail - head)
    }

    /// Queued entries, oldest first.
    pub fn run_queue_entries(&self) -> KernelResult<Vec<RunQueueEntry>> {
        let head: u64 = self.get_required(keys::RUN_QUEUE_HEAD)?;
        let tail: u64 = self.get_required(keys::RUN_QUEUE_TAIL)?;
        (head..tail)
            .map(|seq| self.get_required(&keys::run_queue_entry(seq)))
            .collect()
    }
}

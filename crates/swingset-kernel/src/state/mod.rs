//! All kernel tables, kept in the store and mutated only through a per-crank write buffer.
//!
//! Reads see the buffer layered over the committed store. Nothing reaches the store until
//! [`KernelState::commit`], which turns the buffer into one [`WriteBatch`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use swingset_cbor::{Hash, from_cbor, to_canonical_cbor};
use swingset_store::{KvStore, WriteBatch, prefix_end};

use crate::error::{KernelError, KernelResult};
use crate::refs::KernelRef;
use crate::scheduler::CrankPhase;

mod clist;
mod objects;
mod promises;
mod run_queue;
mod transcript;
mod vats;

pub use clist::ClistEntry;
pub use objects::RefCount;
pub(crate) use objects::RefStrength;
pub(crate) use promises::not_callable;
pub use promises::{PromiseState, PromiseStatus};
pub use run_queue::RunQueueEntry;
pub use transcript::{RecordedSyscall, SpanRecord, TranscriptEntry};
pub use vats::{VatInfo, VatOptions};

/// Store key layout.
pub(crate) mod keys {
    use crate::refs::{KernelRef, VatId, VatRef};

    pub const INITIALIZED: &str = "initialized";
    pub const CRANK_NUMBER: &str = "crankNumber";
    pub const CRANK_HASH: &str = "crankhash";
    pub const ACTIVITY_HASH: &str = "activityhash";
    pub const KO_NEXT_ID: &str = "ko.nextID";
    pub const KP_NEXT_ID: &str = "kp.nextID";
    pub const VAT_NEXT_ID: &str = "vat.nextID";
    pub const LIVE_VATS: &str = "vat.live";
    pub const TERMINATED_VATS: &str = "vat.terminated";
    pub const RUN_QUEUE_HEAD: &str = "runQueue.head";
    pub const RUN_QUEUE_TAIL: &str = "runQueue.tail";
    pub const GC_ACTIONS: &str = "gcActions";
    pub const REAP_QUEUE: &str = "reapQueue";
    pub const PINNED: &str = "pinnedObjects";

    pub fn run_queue_entry(seq: u64) -> String {
        format!("runQueue.{seq}")
    }

    pub fn object_owner(kref: KernelRef) -> String {
        format!("{kref}.owner")
    }

    pub fn refcount(kref: KernelRef) -> String {
        format!("{kref}.refCount")
    }

    pub fn promise_state(kref: KernelRef) -> String {
        format!("{kref}.state")
    }

    pub fn vat_name(name: &str) -> String {
        format!("vat.name.{name}")
    }

    pub fn vat_prefix(vat: VatId) -> String {
        format!("{vat}.")
    }

    pub fn vat_info(vat: VatId) -> String {
        format!("{vat}.info")
    }

    pub fn clist_prefix(vat: VatId) -> String {
        format!("{vat}.c.")
    }

    pub fn clist(vat: VatId, side: impl std::fmt::Display) -> String {
        format!("{vat}.c.{side}")
    }

    pub fn retired_promise_prefix(vat: VatId) -> String {
        format!("{vat}.retired.")
    }

    pub fn retired_promise(vat: VatId, vref: VatRef) -> String {
        format!("{vat}.retired.{vref}")
    }

    pub fn import_object_next_id(vat: VatId) -> String {
        format!("{vat}.o.nextID")
    }

    pub fn import_promise_next_id(vat: VatId) -> String {
        format!("{vat}.p.nextID")
    }

    pub fn vatstore(vat: VatId, key: &str) -> String {
        format!("{vat}.vs.{key}")
    }

    pub fn reap_countdown(vat: VatId) -> String {
        format!("{vat}.reapCountdown")
    }

    pub fn current_span(vat: VatId) -> String {
        format!("{vat}.transcript.current")
    }

    pub fn retired_span(vat: VatId, span_id: u64) -> String {
        format!("{vat}.transcript.span.{span_id}")
    }

    pub fn transcript_entry(vat: VatId, span_id: u64, pos: u64) -> String {
        format!("{vat}.transcript.{span_id}.{pos}")
    }

    pub fn snapshot(hash: &swingset_cbor::Hash) -> String {
        format!("snapshot.{hash}")
    }
}

/// In-flight state that a savepoint can restore.
#[derive(Clone)]
pub struct Savepoint {
    pending: BTreeMap<String, Option<Vec<u8>>>,
    possibly_dead: BTreeSet<KernelRef>,
}

/// What one commit wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub crank_hash: Hash,
    pub activity_hash: Hash,
    pub mutations: usize,
}

pub struct KernelState<S: KvStore> {
    store: Arc<S>,
    pending: BTreeMap<String, Option<Vec<u8>>>,
    /// Krefs whose counts may have hit zero during this crank. Drained by
    /// `process_refcounts` before every commit, so it is empty between cranks.
    possibly_dead: BTreeSet<KernelRef>,
    phase: CrankPhase,
}

impl<S: KvStore> KernelState<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            possibly_dead: BTreeSet::new(),
            phase: CrankPhase::Idle,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn phase(&self) -> CrankPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: CrankPhase) {
        self.phase = phase;
    }

    /// Write the tables a fresh kernel starts with, unless this store already has them.
    pub(crate) fn initialize_if_needed(&mut self) -> KernelResult<bool> {
        if self.has(keys::INITIALIZED)? {
            return Ok(false);
        }
        self.set(keys::KO_NEXT_ID, &20u64)?;
        self.set(keys::KP_NEXT_ID, &40u64)?;
        self.set(keys::VAT_NEXT_ID, &1u32)?;
        self.set(keys::CRANK_NUMBER, &0u64)?;
        self.set(keys::RUN_QUEUE_HEAD, &0u64)?;
        self.set(keys::RUN_QUEUE_TAIL, &0u64)?;
        self.set(keys::LIVE_VATS, &BTreeSet::<crate::refs::VatId>::new())?;
        self.set(keys::TERMINATED_VATS, &Vec::<crate::refs::VatId>::new())?;
        self.set(keys::GC_ACTIONS, &BTreeSet::<crate::gc::GcAction>::new())?;
        self.set(keys::REAP_QUEUE, &Vec::<crate::refs::VatId>::new())?;
        self.set(keys::PINNED, &BTreeSet::<KernelRef>::new())?;
        self.set(keys::INITIALIZED, &true)?;
        Ok(true)
    }

    pub(crate) fn get_raw(&self, key: &str) -> KernelResult<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.store.get(key)?),
        }
    }

    pub(crate) fn has(&self, key: &str) -> KernelResult<bool> {
        Ok(self.get_raw(key)?.is_some())
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, key: &str) -> KernelResult<Option<T>> {
        self.get_raw(key)?
            .map(|bytes| {
                from_cbor(&bytes).map_err(|source| KernelError::Codec {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub(crate) fn get_required<T: DeserializeOwned>(&self, key: &str) -> KernelResult<T> {
        self.get(key)?
            .ok_or_else(|| KernelError::consistency(format!("missing kernel table row '{key}'")))
    }

    pub(crate) fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> KernelResult<()> {
        let bytes = to_canonical_cbor(value).map_err(|source| KernelError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.pending.insert(key.to_string(), Some(bytes));
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &str) {
        self.pending.insert(key.to_string(), None);
    }

    /// Entries under `prefix`, with this crank's pending writes applied.
    pub(crate) fn scan_prefix(&self, prefix: &str) -> KernelResult<Vec<(String, Vec<u8>)>> {
        let end = prefix_end(prefix);
        let mut merged: BTreeMap<String, Vec<u8>> =
            self.store.range(prefix, end.as_deref())?.into_iter().collect();
        let upper = end.as_deref();
        for (key, value) in &self.pending {
            if key.as_str() < prefix || upper.is_some_and(|end| key.as_str() >= end) {
                continue;
            }
            match value {
                Some(bytes) => {
                    merged.insert(key.clone(), bytes.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub(crate) fn delete_prefix(&mut self, prefix: &str) -> KernelResult<usize> {
        let doomed = self.scan_prefix(prefix)?;
        for (key, _) in &doomed {
            self.delete(key);
        }
        Ok(doomed.len())
    }

    /// Return the counter's current value and advance it.
    pub(crate) fn next_id(&mut self, key: &str) -> KernelResult<u64> {
        let id: u64 = self.get(key)?.unwrap_or(0);
        self.set(key, &(id + 1))?;
        Ok(id)
    }

    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint {
            pending: self.pending.clone(),
            possibly_dead: self.possibly_dead.clone(),
        }
    }

    pub(crate) fn rollback(&mut self, savepoint: Savepoint) {
        self.pending = savepoint.pending;
        self.possibly_dead = savepoint.possibly_dead;
    }

    /// Drop everything this crank wrote.
    pub(crate) fn discard(&mut self) {
        self.pending.clear();
        self.possibly_dead.clear();
        self.phase = CrankPhase::Idle;
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn crank_number(&self) -> KernelResult<u64> {
        Ok(self.get(keys::CRANK_NUMBER)?.unwrap_or(0))
    }

    pub(crate) fn increment_crank_number(&mut self) -> KernelResult<u64> {
        let next = self.crank_number()? + 1;
        self.set(keys::CRANK_NUMBER, &next)?;
        Ok(next)
    }

    pub fn activity_hash(&self) -> KernelResult<Hash> {
        Ok(self.get(keys::ACTIVITY_HASH)?.unwrap_or_default())
    }

    /// Write every pending mutation to the store as one atomic batch.
    ///
    /// The crank hash covers the mutations themselves; the activity hash chains it onto
    /// the previous activity hash, and both are written in the same batch.
    pub(crate) fn commit(&mut self) -> KernelResult<CommitSummary> {
        if !self.possibly_dead.is_empty() {
            return Err(KernelError::consistency(
                "commit with unprocessed reference counts",
            ));
        }
        let mut batch = WriteBatch::new();
        for (key, value) in std::mem::take(&mut self.pending) {
            match value {
                Some(bytes) => batch.set(key, bytes),
                None => batch.delete(key),
            }
        }
        let mutations = batch.len();
        let crank_hash = Hash::of_cbor(&batch).map_err(|source| KernelError::Codec {
            key: keys::CRANK_HASH.into(),
            source,
        })?;
        let activity_hash = self.activity_hash()?.chain(&crank_hash);
        for (key, hash) in [(keys::CRANK_HASH, crank_hash), (keys::ACTIVITY_HASH, activity_hash)] {
            let bytes = to_canonical_cbor(&hash).map_err(|source| KernelError::Codec {
                key: key.into(),
                source,
            })?;
            batch.set(key, bytes);
        }
        self.store.commit(&batch)?;
        Ok(CommitSummary {
            crank_hash,
            activity_hash,
            mutations,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use swingset_store::MemKvStore;

    pub fn fresh_state() -> KernelState<MemKvStore> {
        let mut state = KernelState::new(Arc::new(MemKvStore::new()));
        state.initialize_if_needed().expect("init");
        state.commit().expect("commit init");
        state
    }
}

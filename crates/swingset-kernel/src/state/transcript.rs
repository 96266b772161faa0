//! Per-vat delivery history, cut into spans at each heap snapshot.
//!
//! Entry positions count from the vat's creation and never restart; a span covers
//! `start_pos..end_pos`. Replay starts the worker from the current span's snapshot (or
//! from genesis) and re-delivers exactly the current span's entries.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use swingset_cbor::Hash;
use swingset_store::KvStore;

use super::{KernelState, keys};
use crate::error::KernelResult;
use crate::refs::VatId;
use crate::vat::{VatDelivery, VatSyscall, VatSyscallResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedSyscall {
    pub syscall: VatSyscall,
    pub result: VatSyscallResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub delivery: VatDelivery,
    pub syscalls: Vec<RecordedSyscall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: u64,
    /// Bumped by each upgrade.
    pub incarnation: u64,
    pub start_pos: u64,
    pub end_pos: u64,
    /// Heap snapshot the span starts from; `None` starts from the vat's genesis.
    pub snapshot: Option<Hash>,
}

impl SpanRecord {
    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: KvStore> KernelState<S> {
    pub(crate) fn init_transcript(&mut self, vat: VatId) -> KernelResult<()> {
        let span = SpanRecord {
            span_id: 0,
            incarnation: 0,
            start_pos: 0,
            end_pos: 0,
            snapshot: None,
        };
        self.set(&keys::current_span(vat), &span)
    }

    pub fn current_span(&self, vat: VatId) -> KernelResult<SpanRecord> {
        self.get_required(&keys::current_span(vat))
    }

    /// Append to the current span, returning the span's new length.
    pub(crate) fn append_transcript_entry(
        &mut self,
        vat: VatId,
        entry: &TranscriptEntry,
    ) -> KernelResult<u64> {
        let mut span = self.current_span(vat)?;
        self.set(&keys::transcript_entry(vat, span.span_id, span.end_pos), entry)?;
        span.end_pos += 1;
        self.set(&keys::current_span(vat), &span)?;
        Ok(span.len())
    }

    /// Entries of the current span, oldest first.
    pub fn transcript_entries(&self, vat: VatId) -> KernelResult<Vec<TranscriptEntry>> {
        let span = self.current_span(vat)?;
        (span.start_pos..span.end_pos)
            .map(|pos| self.get_required(&keys::transcript_entry(vat, span.span_id, pos)))
            .collect()
    }

    /// Close the current span and open an empty one anchored at `snapshot`.
    ///
    /// The old span's entries are deleted, and so is its snapshot once no live vat's
    /// current span starts from it, unless `keep_retired` is set, in which case the span
    /// is recorded under `<vat>.transcript.span.<id>` and everything is kept.
    pub(crate) fn start_new_span(
        &mut self,
        vat: VatId,
        snapshot: Option<Hash>,
        new_incarnation: bool,
        keep_retired: bool,
    ) -> KernelResult<SpanRecord> {
        let old = self.current_span(vat)?;
        let next = SpanRecord {
            span_id: old.span_id + 1,
            incarnation: old.incarnation + u64::from(new_incarnation),
            start_pos: old.end_pos,
            end_pos: old.end_pos,
            snapshot,
        };
        self.set(&keys::current_span(vat), &next)?;
        if keep_retired {
            self.set(&keys::retired_span(vat, old.span_id), &old)?;
        } else {
            self.delete_span_entries(vat, &old);
            if let Some(hash) = old.snapshot
                && old.snapshot != next.snapshot
            {
                self.release_snapshot(&hash)?;
            }
        }
        log::debug!(
            "{vat} span {} closed at {}, span {} opened",
            old.span_id,
            old.end_pos,
            next.span_id
        );
        Ok(next)
    }

    fn delete_span_entries(&mut self, vat: VatId, span: &SpanRecord) {
        for pos in span.start_pos..span.end_pos {
            self.delete(&keys::transcript_entry(vat, span.span_id, pos));
        }
    }

    pub fn retired_spans(&self, vat: VatId) -> KernelResult<Vec<SpanRecord>> {
        let mut spans: Vec<SpanRecord> = self
            .scan_prefix(&format!("{vat}.transcript.span."))?
            .into_iter()
            .map(|(key, _)| self.get_required(&key))
            .collect::<KernelResult<_>>()?;
        spans.sort_by_key(|span| span.span_id);
        Ok(spans)
    }

    /// Store a heap snapshot under its content hash.
    pub(crate) fn save_snapshot(&mut self, bytes: &[u8]) -> KernelResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        self.set(&keys::snapshot(&hash), &ByteBuf::from(bytes.to_vec()))?;
        Ok(hash)
    }

    pub fn load_snapshot(&self, hash: &Hash) -> KernelResult<Option<Vec<u8>>> {
        Ok(self
            .get::<ByteBuf>(&keys::snapshot(hash))?
            .map(ByteBuf::into_vec))
    }

    /// Delete a snapshot no live vat starts from any more.
    pub(crate) fn release_snapshot(&mut self, hash: &Hash) -> KernelResult<()> {
        for vat in self.live_vats()? {
            if self.current_span(vat)?.snapshot.as_ref() == Some(hash) {
                return Ok(());
            }
        }
        self.delete(&keys::snapshot(hash));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VatOptions;
    use crate::state::test_support::fresh_state;

    fn entry(n: u64) -> TranscriptEntry {
        TranscriptEntry {
            delivery: VatDelivery::BringOutYourDead,
            syscalls: vec![RecordedSyscall {
                syscall: VatSyscall::VatstoreGet {
                    key: format!("k{n}"),
                },
                result: VatSyscallResult::Value(None),
            }],
        }
    }

    #[test]
    fn new_span_drops_old_entries_and_snapshot() {
        let mut state = fresh_state();
        let vat = state.allocate_vat("v", VatOptions::default()).unwrap();
        state.init_transcript(vat).unwrap();
        for n in 0..3 {
            state.append_transcript_entry(vat, &entry(n)).unwrap();
        }
        let first = state.save_snapshot(b"heap one").unwrap();
        state.start_new_span(vat, Some(first), false, false).unwrap();
        assert!(state.transcript_entries(vat).unwrap().is_empty());

        state.append_transcript_entry(vat, &entry(3)).unwrap();
        let span = state.current_span(vat).unwrap();
        assert_eq!((span.span_id, span.start_pos, span.end_pos), (1, 3, 4));
        assert_eq!(state.transcript_entries(vat).unwrap(), vec![entry(3)]);

        let second = state.save_snapshot(b"heap two").unwrap();
        state.start_new_span(vat, Some(second), false, false).unwrap();
        assert_eq!(state.load_snapshot(&first).unwrap(), None);
        assert_eq!(
            state.load_snapshot(&second).unwrap().as_deref(),
            Some(&b"heap two"[..])
        );
        assert!(state.scan_prefix(&format!("{vat}.transcript.0.")).unwrap().is_empty());
    }

    #[test]
    fn retired_spans_are_kept_on_request() {
        let mut state = fresh_state();
        let vat = state.allocate_vat("v", VatOptions::default()).unwrap();
        state.init_transcript(vat).unwrap();
        state.append_transcript_entry(vat, &entry(0)).unwrap();
        let snap = state.save_snapshot(b"heap").unwrap();
        state.start_new_span(vat, Some(snap), true, true).unwrap();

        let retired = state.retired_spans(vat).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].end_pos, 1);
        assert_eq!(state.current_span(vat).unwrap().incarnation, 1);
        assert!(state.has(&keys::transcript_entry(vat, 0, 0)).unwrap());
    }
}

use super::*;
use crate::gc::GcBatch;
use crate::replay::replay_transcript;
use crate::state::TranscriptEntry;
use crate::syscall::SyscallContext;
use crate::vat::{DeliveryOutcome, VatDelivery};

/// A delivery in kernel terms, before translation into the vat's c-list.
#[derive(Debug)]
pub(super) enum KernelDelivery {
    Message {
        target: KernelRef,
        message: KernelMessage,
    },
    Notify {
        kpid: KernelRef,
    },
    Gc(GcBatch),
    BringOutYourDead,
}

impl<S: KvStore> Kernel<S> {
    /// Start the vat's worker if needed, replaying the current span.
    pub(super) fn ensure_online(&mut self, vat: VatId) -> KernelResult<()> {
        if self.online.contains(&vat) {
            return Ok(());
        }
        let span = self.state.current_span(vat)?;
        let snapshot = match &span.snapshot {
            Some(hash) => Some(self.state.load_snapshot(hash)?.ok_or_else(|| {
                KernelError::consistency(format!("{vat} snapshot {hash} is missing"))
            })?),
            None => None,
        };
        let entries = self.state.transcript_entries(vat)?;
        replay_transcript(
            self.vat_manager.as_mut(),
            vat,
            snapshot.as_deref(),
            &entries,
        )?;
        log::info!(
            "{vat} online (span {}, {} entries replayed)",
            span.span_id,
            entries.len()
        );
        self.online.insert(vat);
        Ok(())
    }

    /// Translate, deliver, and record one delivery.
    ///
    /// A worker that aborts, fails, or exits with failure loses every effect of the
    /// delivery and is terminated; a message's result promise is rejected with the
    /// reason. Returns the computrons used, or `None` when there was nothing to deliver.
    pub(super) fn deliver(
        &mut self,
        vat: VatId,
        delivery: KernelDelivery,
    ) -> KernelResult<Option<u64>> {
        self.ensure_online(vat)?;
        let before = self.state.savepoint();
        let vat_delivery = match &delivery {
            KernelDelivery::Message { target, message } => {
                self.state.translate_message(vat, *target, message)?
            }
            KernelDelivery::Notify { kpid } => match self.state.translate_notify(vat, *kpid)? {
                Some(notify) => notify,
                None => {
                    log::debug!("{vat} no longer knows {kpid}; notify skipped");
                    return Ok(None);
                }
            },
            KernelDelivery::Gc(batch) => self.state.translate_gc(batch)?,
            KernelDelivery::BringOutYourDead => VatDelivery::BringOutYourDead,
        };
        log::debug!("{vat} <- {}", vat_delivery.kind());

        let (outcome, recorded, exit, fatal) = {
            let mut ctx = SyscallContext::new(&mut self.state, vat);
            let outcome = self.vat_manager.deliver(vat, &vat_delivery, &mut ctx);
            (outcome, ctx.recorded, ctx.exit, ctx.fatal)
        };
        if let Some(err) = fatal {
            return Err(err);
        }
        let outcome = outcome.unwrap_or_else(|err| {
            log::warn!("{vat} worker failed: {err}");
            DeliveryOutcome::aborted(err.to_string())
        });
        let computrons = outcome.computrons;

        let failure = match (&exit, outcome.did_abort) {
            (_, true) => Some(KernelCapData::error(
                outcome.problem.as_deref().unwrap_or("delivery aborted"),
            )),
            (Some(exit), false) if exit.failure => Some(exit.info.clone()),
            _ => None,
        };
        if let Some(reason) = failure {
            self.state.rollback(before);
            log::info!("{vat} failed during {}: {}", vat_delivery.kind(), reason.body);
            if let KernelDelivery::Message { message, .. } = &delivery {
                self.state.reject_result(message, reason.clone())?;
            }
            self.terminate_vat_now(vat, &reason)?;
            return Ok(Some(computrons));
        }

        let span_len = self.state.append_transcript_entry(
            vat,
            &TranscriptEntry {
                delivery: vat_delivery,
                syscalls: recorded,
            },
        )?;
        if let Some(exit) = exit {
            log::info!("{vat} exited: {}", exit.info.body);
            self.terminate_vat_now(vat, &exit.info)?;
            return Ok(Some(computrons));
        }
        self.maybe_snapshot(vat, span_len)?;
        if !matches!(delivery, KernelDelivery::BringOutYourDead) {
            self.maybe_schedule_reap(vat)?;
        }
        Ok(Some(computrons))
    }

    fn maybe_snapshot(&mut self, vat: VatId, span_len: u64) -> KernelResult<()> {
        let span = self.state.current_span(vat)?;
        let due = match span.snapshot {
            None => self.config.snapshot_initial,
            Some(_) => self.config.snapshot_interval,
        };
        if due == 0 || span_len < due {
            return Ok(());
        }
        let bytes = match self.vat_manager.make_snapshot(vat) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("{vat} snapshot skipped: {err}");
                return Ok(());
            }
        };
        let hash = self.state.save_snapshot(&bytes)?;
        let span = self
            .state
            .start_new_span(vat, Some(hash), false, self.config.keep_retired_spans)?;
        log::info!("{vat} snapshot {hash} opens span {}", span.span_id);
        Ok(())
    }

    fn maybe_schedule_reap(&mut self, vat: VatId) -> KernelResult<()> {
        let Some(interval) = self.config.reap_interval else {
            return Ok(());
        };
        if self.state.tick_reap_countdown(vat, interval)? {
            self.state.schedule_reap(vat)?;
        }
        Ok(())
    }
}

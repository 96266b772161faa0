use super::*;
use crate::refs::Durability;
use crate::state::{ClistEntry, PromiseState, keys};

impl<S: KvStore> Kernel<S> {
    /// Terminate a vat from the host side, as its own transaction.
    pub fn terminate_vat(&mut self, vat: VatId, reason: KernelCapData) -> KernelResult<()> {
        self.host_op(|kernel| kernel.terminate_vat_now(vat, &reason))
    }

    /// Remove a vat from the kernel within the current transaction.
    ///
    /// Promises it decides are rejected with the disconnection reason, its exports are
    /// orphaned (collected once their importers let go), its imports are released, and
    /// everything stored under its prefix is deleted. Terminating a critical vat halts the
    /// kernel.
    pub(super) fn terminate_vat_now(
        &mut self,
        vat: VatId,
        reason: &KernelCapData,
    ) -> KernelResult<()> {
        if !self.state.vat_is_alive(vat)? {
            return Err(KernelError::UnknownVat(vat));
        }
        let info = self
            .state
            .vat_info(vat)?
            .ok_or(KernelError::UnknownVat(vat))?;
        if info.options.critical {
            return Err(KernelError::consistency(format!(
                "critical vat {vat} '{}' terminated: {}",
                info.name, reason.body
            )));
        }
        log::info!("terminating {vat} '{}': {}", info.name, reason.body);
        let span = self.state.current_span(vat)?;
        self.state.mark_vat_terminated(vat)?;

        let entries = self.state.clist(vat)?;
        self.reject_decided_promises(vat, &entries, vat_terminated())?;
        for (kref, entry) in entries {
            self.state.delete_clist_entry(vat, kref)?;
            if kref.is_object() && entry.vref.is_exported() {
                self.state.orphan_object(kref);
            }
        }
        self.state.delete_prefix(&keys::vat_prefix(vat))?;
        self.state.delete(&keys::vat_name(&info.name));
        if let Some(hash) = span.snapshot {
            self.state.release_snapshot(&hash)?;
        }
        self.vat_manager.stop_worker(vat);
        self.online.remove(&vat);
        Ok(())
    }

    /// Restart a vat as a new incarnation.
    ///
    /// Durable exports and the root object survive; other exports are abandoned. Promises
    /// it decides are rejected, its imports and vatstore are kept, and a fresh span with
    /// no snapshot starts so the new worker begins from genesis.
    pub fn upgrade_vat(&mut self, vat: VatId) -> KernelResult<()> {
        self.host_op(|kernel| {
            if !kernel.state.vat_is_alive(vat)? {
                return Err(KernelError::UnknownVat(vat));
            }
            kernel.vat_manager.stop_worker(vat);
            kernel.online.remove(&vat);

            let entries = kernel.state.clist(vat)?;
            let upgraded = kernel.reject_decided_promises(
                vat,
                &entries,
                KernelCapData::error("vat upgraded"),
            )?;
            for kpid in upgraded {
                kernel.state.delete_clist_entry(vat, kpid)?;
            }
            // The new incarnation numbers its promises from scratch.
            kernel
                .state
                .delete_prefix(&keys::retired_promise_prefix(vat))?;
            let mut abandoned = 0;
            for (kref, entry) in &entries {
                let survives = entry.durability == Durability::Durable
                    || entry.vref == VatRef::object_export(0);
                if kref.is_object() && entry.vref.is_exported() && !survives {
                    kernel.state.delete_clist_entry(vat, *kref)?;
                    kernel.state.orphan_object(*kref);
                    abandoned += 1;
                }
            }
            let span = kernel.state.start_new_span(
                vat,
                None,
                true,
                kernel.config.keep_retired_spans,
            )?;
            log::info!(
                "upgraded {vat} to incarnation {}, {abandoned} exports abandoned",
                span.incarnation
            );
            Ok(())
        })
    }

    /// Reject every unresolved promise in `entries` that `vat` decides. Returns them.
    fn reject_decided_promises(
        &mut self,
        vat: VatId,
        entries: &[(KernelRef, ClistEntry)],
        reason: KernelCapData,
    ) -> KernelResult<Vec<KernelRef>> {
        let mut rejected = Vec::new();
        for (kref, _) in entries {
            if !kref.is_promise() {
                continue;
            }
            if let Some(PromiseState::Unresolved {
                decider: Some(decider),
                ..
            }) = self.state.promise_state(*kref)?
                && decider == vat
            {
                self.state.resolve_promise(*kref, true, reason.clone())?;
                rejected.push(*kref);
            }
        }
        Ok(rejected)
    }
}

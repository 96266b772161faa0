use std::collections::BTreeSet;

use super::delivery::KernelDelivery;
use super::*;
use crate::gc::GcActionKind;
use crate::scheduler::{CrankKind, CrankPhase, CrankReport, RunPolicy, Work};
use crate::state::{PromiseState, RunQueueEntry, not_callable};

/// Where a send ends up once promise forwarding has been followed.
enum Route {
    Deliver { vat: VatId, target: KernelRef },
    Queue(KernelRef),
    Reject(KernelCapData),
}

impl<S: KvStore> Kernel<S> {
    /// Do one unit of work and commit it. Returns `None` when there was nothing to do.
    ///
    /// Any error here halts the kernel: the crank's writes are discarded and every later
    /// call fails with [`KernelError::Panicked`].
    pub fn run_one_crank(&mut self) -> KernelResult<Option<CrankReport>> {
        self.check_panic()?;
        match self.crank() {
            Ok(report) => Ok(report),
            Err(err) => {
                self.halt(&err);
                Err(err)
            }
        }
    }

    /// Run cranks until the kernel is idle or `policy` says stop.
    pub fn run(&mut self, policy: &mut dyn RunPolicy) -> KernelResult<Vec<CrankReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_one_crank()? {
            let more = policy.crank_complete(&report);
            reports.push(report);
            if !more {
                break;
            }
        }
        Ok(reports)
    }

    fn crank(&mut self) -> KernelResult<Option<CrankReport>> {
        let Some(work) = self.next_work()? else {
            self.state.discard();
            return Ok(None);
        };
        self.state.set_phase(CrankPhase::Delivering);
        let (kind, vat, computrons) = self.process(work)?;
        self.state.process_refcounts()?;
        self.state.set_phase(CrankPhase::Committing);
        let crank_number = self.state.increment_crank_number()?;
        let summary = self.state.commit()?;
        self.state.set_phase(CrankPhase::Idle);
        log::debug!(
            "crank {crank_number} {kind:?} done: {} mutations, activity {}",
            summary.mutations,
            summary.activity_hash
        );
        Ok(Some(CrankReport {
            crank_number,
            kind,
            vat,
            computrons,
            mutations: summary.mutations,
            crank_hash: summary.crank_hash,
        }))
    }

    fn next_work(&mut self) -> KernelResult<Option<Work>> {
        if let Some(batch) = self.state.take_gc_batch()? {
            return Ok(Some(Work::Gc(batch)));
        }
        if let Some(vat) = self.state.next_reap()? {
            return Ok(Some(Work::Reap(vat)));
        }
        Ok(self.state.dequeue()?.map(Work::Run))
    }

    fn process(&mut self, work: Work) -> KernelResult<(CrankKind, Option<VatId>, u64)> {
        match work {
            Work::Gc(batch) => {
                if batch.krefs.is_empty() {
                    return Ok((CrankKind::NegatedGcActions, None, 0));
                }
                let kind = match batch.kind {
                    GcActionKind::DropExport => CrankKind::DropExports,
                    GcActionKind::RetireExport => CrankKind::RetireExports,
                    GcActionKind::RetireImport => CrankKind::RetireImports,
                };
                let vat = batch.vat;
                let computrons = self.deliver(vat, KernelDelivery::Gc(batch))?;
                Ok((kind, computrons.map(|_| vat), computrons.unwrap_or(0)))
            }
            Work::Reap(vat) => {
                let computrons = if self.state.vat_is_alive(vat)? {
                    self.deliver(vat, KernelDelivery::BringOutYourDead)?
                } else {
                    None
                };
                Ok((
                    CrankKind::BringOutYourDead,
                    computrons.map(|_| vat),
                    computrons.unwrap_or(0),
                ))
            }
            Work::Run(entry) => {
                let outcome = match &entry {
                    RunQueueEntry::Send { target, message } => {
                        let delivered = self.route_send(*target, message)?;
                        (CrankKind::Send, delivered)
                    }
                    RunQueueEntry::Notify { vat, kpid } => {
                        let delivered = self.route_notify(*vat, *kpid)?;
                        (CrankKind::Notify, delivered)
                    }
                };
                self.state.release_entry(&entry)?;
                let (kind, delivered) = outcome;
                Ok((
                    kind,
                    delivered.map(|(vat, _)| vat),
                    delivered.map_or(0, |(_, computrons)| computrons),
                ))
            }
        }
    }

    /// Follow `target` through settled promises to where the message should go.
    fn route(&self, target: KernelRef, message: &KernelMessage) -> KernelResult<Route> {
        let mut target = target;
        let mut seen = BTreeSet::new();
        loop {
            if !seen.insert(target) {
                return Ok(Route::Reject(KernelCapData::error("promise resolution cycle")));
            }
            match target {
                KernelRef::Object(_) => {
                    return Ok(match self.state.object_owner(target)? {
                        Some(vat) if self.state.vat_is_alive(vat)? => {
                            Route::Deliver { vat, target }
                        }
                        _ => Route::Reject(vat_terminated()),
                    });
                }
                KernelRef::Promise(_) => match self.state.promise_state_required(target)? {
                    PromiseState::Fulfilled { data } => match data.as_reference() {
                        Some(next) => target = *next,
                        None => return Ok(Route::Reject(not_callable(message))),
                    },
                    PromiseState::Rejected { data } => return Ok(Route::Reject(data)),
                    PromiseState::Unresolved { decider, .. } => {
                        let Some(vat) = decider else {
                            return Ok(Route::Queue(target));
                        };
                        if !self.state.vat_is_alive(vat)? {
                            return Ok(Route::Reject(vat_terminated()));
                        }
                        let pipelining = self
                            .state
                            .vat_info(vat)?
                            .is_some_and(|info| info.options.enable_pipelining);
                        return Ok(if pipelining {
                            Route::Deliver { vat, target }
                        } else {
                            Route::Queue(target)
                        });
                    }
                },
            }
        }
    }

    /// Deliver, queue or reject a send. Returns the receiving vat and its computrons when
    /// a delivery happened.
    fn route_send(
        &mut self,
        target: KernelRef,
        message: &KernelMessage,
    ) -> KernelResult<Option<(VatId, u64)>> {
        match self.route(target, message)? {
            Route::Deliver { vat, target } => {
                let computrons = self.deliver(
                    vat,
                    KernelDelivery::Message {
                        target,
                        message: message.clone(),
                    },
                )?;
                Ok(computrons.map(|computrons| (vat, computrons)))
            }
            Route::Queue(kpid) => {
                log::debug!("queueing {:?} on {kpid}", message.methargs.method());
                self.state.hold_message(message)?;
                self.state.queue_on_promise(kpid, message.clone())?;
                Ok(None)
            }
            Route::Reject(reason) => {
                log::debug!("send to {target} rejected: {}", reason.body);
                self.state.reject_result(message, reason)?;
                Ok(None)
            }
        }
    }

    fn route_notify(&mut self, vat: VatId, kpid: KernelRef) -> KernelResult<Option<(VatId, u64)>> {
        if !self.state.vat_is_alive(vat)? {
            log::warn!("dropping notify of {kpid} to terminated {vat}");
            return Ok(None);
        }
        let computrons = self.deliver(vat, KernelDelivery::Notify { kpid })?;
        Ok(computrons.map(|computrons| (vat, computrons)))
    }
}

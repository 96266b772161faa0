use serde::{Deserialize, Serialize};
use swingset_store::KvStore;

use super::{KernelState, RefStrength, keys};
use crate::error::{KernelError, KernelResult};
use crate::message::{KernelCapData, KernelMessage};
use crate::refs::{KernelRef, VatId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PromiseState {
    Unresolved {
        /// Vat allowed to resolve it; `None` while the kernel holds that right (for
        /// example while the message it is the result of sits in a queue).
        decider: Option<VatId>,
        /// In subscription order, without repeats.
        subscribers: Vec<VatId>,
        /// Messages sent to the promise before it resolved, in arrival order.
        queue: Vec<KernelMessage>,
    },
    Fulfilled {
        data: KernelCapData,
    },
    Rejected {
        data: KernelCapData,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseStatus {
    Unresolved,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    pub fn status(&self) -> PromiseStatus {
        match self {
            PromiseState::Unresolved { .. } => PromiseStatus::Unresolved,
            PromiseState::Fulfilled { .. } => PromiseStatus::Fulfilled,
            PromiseState::Rejected { .. } => PromiseStatus::Rejected,
        }
    }

    pub fn decider(&self) -> Option<VatId> {
        match self {
            PromiseState::Unresolved { decider, .. } => *decider,
            _ => None,
        }
    }

    /// `(rejected, data)` once settled.
    pub fn resolution(&self) -> Option<(bool, &KernelCapData)> {
        match self {
            PromiseState::Unresolved { .. } => None,
            PromiseState::Fulfilled { data } => Some((false, data)),
            PromiseState::Rejected { data } => Some((true, data)),
        }
    }
}

impl<S: KvStore> KernelState<S> {
    pub(crate) fn add_kernel_promise(&mut self, decider: Option<VatId>) -> KernelResult<KernelRef> {
        let kpid = KernelRef::Promise(self.next_id(keys::KP_NEXT_ID)?);
        self.set(
            &keys::promise_state(kpid),
            &PromiseState::Unresolved {
                decider,
                subscribers: Vec::new(),
                queue: Vec::new(),
            },
        )?;
        self.set(&keys::refcount(kpid), &0u64)?;
        Ok(kpid)
    }

    pub fn promise_state(&self, kpid: KernelRef) -> KernelResult<Option<PromiseState>> {
        if !kpid.is_promise() {
            return Ok(None);
        }
        self.get(&keys::promise_state(kpid))
    }

    pub(crate) fn promise_state_required(&self, kpid: KernelRef) -> KernelResult<PromiseState> {
        self.promise_state(kpid)?
            .ok_or_else(|| KernelError::consistency(format!("unknown promise {kpid}")))
    }

    fn set_promise_state(&mut self, kpid: KernelRef, state: &PromiseState) -> KernelResult<()> {
        self.set(&keys::promise_state(kpid), state)
    }

    pub(crate) fn set_decider(&mut self, kpid: KernelRef, new: Option<VatId>) -> KernelResult<()> {
        let mut state = self.promise_state_required(kpid)?;
        match &mut state {
            PromiseState::Unresolved { decider, .. } => *decider = new,
            _ => {
                return Err(KernelError::consistency(format!(
                    "cannot change decider of settled promise {kpid}"
                )));
            }
        }
        self.set_promise_state(kpid, &state)
    }

    /// Ask for a notify when `kpid` settles. Already-settled promises notify right away.
    pub(crate) fn subscribe(&mut self, kpid: KernelRef, vat: VatId) -> KernelResult<()> {
        let mut state = self.promise_state_required(kpid)?;
        match &mut state {
            PromiseState::Unresolved { subscribers, .. } => {
                if !subscribers.contains(&vat) {
                    subscribers.push(vat);
                    self.set_promise_state(kpid, &state)?;
                }
                Ok(())
            }
            _ => self.enqueue_notify(vat, kpid),
        }
    }

    /// Park a message on an unresolved promise. The promise queue takes over the message's
    /// references to its result and slots.
    pub(crate) fn queue_on_promise(
        &mut self,
        kpid: KernelRef,
        message: KernelMessage,
    ) -> KernelResult<()> {
        let mut state = self.promise_state_required(kpid)?;
        match &mut state {
            PromiseState::Unresolved { queue, .. } => {
                queue.push(message);
                self.set_promise_state(kpid, &state)
            }
            _ => Err(KernelError::consistency(format!(
                "cannot queue on settled promise {kpid}"
            ))),
        }
    }

    /// Settle a promise. Allowed once; a second call is a consistency violation and
    /// leaves the first resolution untouched.
    ///
    /// Subscribers get one notify each, in subscription order. Queued messages are sent
    /// again, in their original order, to the resolution's object or promise when
    /// fulfilled to one; routing then follows promise chains. Otherwise their result
    /// promises are rejected here.
    pub(crate) fn resolve_promise(
        &mut self,
        kpid: KernelRef,
        rejected: bool,
        data: KernelCapData,
    ) -> KernelResult<()> {
        let state = self.promise_state_required(kpid)?;
        let PromiseState::Unresolved {
            subscribers, queue, ..
        } = state
        else {
            return Err(KernelError::consistency(format!(
                "promise {kpid} resolved twice"
            )));
        };
        log::debug!(
            "resolve {kpid} {} {}",
            if rejected { "rejected" } else { "fulfilled" },
            data.body
        );
        for slot in &data.slots {
            self.incref(*slot, RefStrength::Strong)?;
        }
        let target = if rejected {
            None
        } else {
            data.as_reference().copied()
        };
        let settled = if rejected {
            PromiseState::Rejected { data: data.clone() }
        } else {
            PromiseState::Fulfilled { data: data.clone() }
        };
        self.set_promise_state(kpid, &settled)?;

        for vat in subscribers {
            self.enqueue_notify(vat, kpid)?;
        }
        for message in queue {
            match target {
                Some(next) => self.enqueue_send(next, message.clone())?,
                None => {
                    let reason = if rejected {
                        data.clone()
                    } else {
                        not_callable(&message)
                    };
                    self.reject_result(&message, reason)?;
                }
            }
            self.release_message(&message)?;
        }
        Ok(())
    }

    /// Reject a message's result promise because the message will never be delivered.
    /// Results that are absent or already settled are left alone.
    pub(crate) fn reject_result(
        &mut self,
        message: &KernelMessage,
        reason: KernelCapData,
    ) -> KernelResult<()> {
        match message.result {
            Some(result)
                if self.promise_state_required(result)?.status() == PromiseStatus::Unresolved =>
            {
                self.resolve_promise(result, true, reason)
            }
            _ => Ok(()),
        }
    }

    /// Release the references a queued message holds on its result and slots.
    pub(crate) fn release_message(&mut self, message: &KernelMessage) -> KernelResult<()> {
        for kref in message.krefs() {
            self.decref(kref, RefStrength::Strong)?;
        }
        Ok(())
    }

    pub(crate) fn hold_message(&mut self, message: &KernelMessage) -> KernelResult<()> {
        for kref in message.krefs() {
            self.incref(kref, RefStrength::Strong)?;
        }
        Ok(())
    }

    /// Remove a promise with no remaining references, dropping what it held.
    pub(crate) fn delete_promise(&mut self, kpid: KernelRef) -> KernelResult<()> {
        match self.promise_state_required(kpid)? {
            PromiseState::Unresolved { queue, .. } => {
                for message in &queue {
                    self.release_message(message)?;
                }
            }
            PromiseState::Fulfilled { data } | PromiseState::Rejected { data } => {
                for slot in data.slots {
                    self.decref(slot, RefStrength::Strong)?;
                }
            }
        }
        self.delete(&keys::promise_state(kpid));
        self.delete(&keys::refcount(kpid));
        Ok(())
    }
}

pub(crate) fn not_callable(message: &KernelMessage) -> KernelCapData {
    let method = message.methargs.method().unwrap_or_else(|| "?".into());
    KernelCapData::error(&format!("data is not callable, has no method {method}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CapData;
    use crate::state::RunQueueEntry;
    use crate::state::test_support::fresh_state;
    use serde_json::json;

    #[test]
    fn second_resolution_fails_and_keeps_first() {
        let mut state = fresh_state();
        let kp = state.add_kernel_promise(None).unwrap();
        state
            .resolve_promise(kp, false, CapData::data(&json!(42)))
            .unwrap();
        let err = state
            .resolve_promise(kp, true, CapData::data(&json!("nope")))
            .unwrap_err();
        assert!(matches!(err, KernelError::Consistency(_)));
        let settled = state.promise_state(kp).unwrap().unwrap();
        assert_eq!(settled.resolution(), Some((false, &CapData::data(&json!(42)))));
    }

    #[test]
    fn subscribers_notified_in_order_once() {
        let mut state = fresh_state();
        let kp = state.add_kernel_promise(Some(VatId(2))).unwrap();
        state.subscribe(kp, VatId(3)).unwrap();
        state.subscribe(kp, VatId(4)).unwrap();
        state.subscribe(kp, VatId(3)).unwrap();
        state
            .resolve_promise(kp, false, CapData::data(&json!(42)))
            .unwrap();
        assert_eq!(
            state.run_queue_entries().unwrap(),
            vec![
                RunQueueEntry::Notify { vat: VatId(3), kpid: kp },
                RunQueueEntry::Notify { vat: VatId(4), kpid: kp },
            ]
        );
    }

    #[test]
    fn subscribing_to_settled_promise_notifies_immediately() {
        let mut state = fresh_state();
        let kp = state.add_kernel_promise(None).unwrap();
        state
            .resolve_promise(kp, true, CapData::error("boom"))
            .unwrap();
        state.subscribe(kp, VatId(5)).unwrap();
        assert_eq!(
            state.run_queue_entries().unwrap(),
            vec![RunQueueEntry::Notify { vat: VatId(5), kpid: kp }]
        );
    }

    #[test]
    fn queued_messages_follow_the_resolution_in_order() {
        let mut state = fresh_state();
        let target = state.add_kernel_object(VatId(2)).unwrap();
        let kp = state.add_kernel_promise(Some(VatId(2))).unwrap();
        for method in ["bar", "baz"] {
            let message = KernelMessage::new(CapData::methargs(method, vec![], vec![]), None);
            state.queue_on_promise(kp, message).unwrap();
        }
        state
            .resolve_promise(kp, false, CapData::reference(target, "Y"))
            .unwrap();
        let methods: Vec<String> = state
            .run_queue_entries()
            .unwrap()
            .into_iter()
            .map(|entry| match entry {
                RunQueueEntry::Send { target: t, message } => {
                    assert_eq!(t, target);
                    message.methargs.method().unwrap()
                }
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        assert_eq!(methods, vec!["bar", "baz"]);
    }

    #[test]
    fn queued_messages_move_to_a_promise_resolution() {
        let mut state = fresh_state();
        let kp = state.add_kernel_promise(Some(VatId(2))).unwrap();
        let next = state.add_kernel_promise(Some(VatId(2))).unwrap();
        let result = state.add_kernel_promise(None).unwrap();
        let message = KernelMessage::new(CapData::methargs("bar", vec![], vec![]), Some(result));
        state.hold_message(&message).unwrap();
        state.queue_on_promise(kp, message).unwrap();
        state
            .resolve_promise(kp, false, CapData::reference(next, "Q"))
            .unwrap();

        match state.run_queue_entries().unwrap().as_slice() {
            [RunQueueEntry::Send { target, message }] => {
                assert_eq!(*target, next);
                assert_eq!(message.methargs.method().as_deref(), Some("bar"));
                assert_eq!(message.result, Some(result));
            }
            other => panic!("unexpected entries {other:?}"),
        }
        assert_eq!(
            state.promise_state(result).unwrap().unwrap().status(),
            PromiseStatus::Unresolved
        );
    }

    #[test]
    fn queued_messages_to_data_reject_their_results() {
        let mut state = fresh_state();
        let kp = state.add_kernel_promise(None).unwrap();
        let result = state.add_kernel_promise(None).unwrap();
        let message = KernelMessage::new(CapData::methargs("foo", vec![], vec![]), Some(result));
        state.hold_message(&message).unwrap();
        state.queue_on_promise(kp, message).unwrap();
        state
            .resolve_promise(kp, false, CapData::data(&json!(42)))
            .unwrap();

        let (rejected, data) = state
            .promise_state(result)
            .unwrap()
            .unwrap()
            .resolution()
            .map(|(r, d)| (r, d.clone()))
            .unwrap();
        assert!(rejected);
        assert!(data.body.contains("has no method foo"));
        assert!(state.run_queue_entries().unwrap().is_empty());
    }
}

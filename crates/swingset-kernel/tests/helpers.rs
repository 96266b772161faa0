//! Test helpers: a scripted in-process vat manager and message builders.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use swingset_kernel::{
    CapData, DeliveryOutcome, Kernel, KernelConfig, KernelRef, SyscallHandler, VatCapData,
    VatDelivery, VatId, VatManager, VatManagerError, VatMessage, VatRef, VatResolution,
    VatSyscall, VatSyscallResult, open_kernel,
};
use swingset_store::{KvStore, MemKvStore};

/// How a scripted vat reacts to one delivery. Behaviors are pure functions of the
/// delivery (plus whatever they read back through syscalls) so that replay reproduces
/// exactly the same syscalls.
pub type Behavior =
    Arc<dyn Fn(&VatDelivery, &mut dyn SyscallHandler) -> DeliveryOutcome + Send + Sync>;

#[derive(Default)]
struct MockInner {
    behaviors: BTreeMap<VatId, Behavior>,
    /// Deliveries seen by each running worker; the worker "heap" is its count.
    workers: BTreeMap<VatId, u64>,
    deliveries: Vec<(VatId, VatDelivery)>,
    starts: Vec<(VatId, Option<Vec<u8>>)>,
    stops: Vec<VatId>,
    fail_snapshots: bool,
}

/// A vat manager whose vats run closures. Clones share state, so a test keeps one clone
/// to script and inspect while the kernel owns the other.
#[derive(Clone, Default)]
pub struct MockVatManager {
    inner: Arc<Mutex<MockInner>>,
}

impl MockVatManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap()
    }

    pub fn set_behavior(
        &self,
        vat: VatId,
        behavior: impl Fn(&VatDelivery, &mut dyn SyscallHandler) -> DeliveryOutcome
        + Send
        + Sync
        + 'static,
    ) {
        self.lock().behaviors.insert(vat, Arc::new(behavior));
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    /// Every delivery made so far, replays included.
    pub fn deliveries(&self) -> Vec<(VatId, VatDelivery)> {
        self.lock().deliveries.clone()
    }

    pub fn deliveries_to(&self, vat: VatId) -> Vec<VatDelivery> {
        self.lock()
            .deliveries
            .iter()
            .filter(|(to, _)| *to == vat)
            .map(|(_, delivery)| delivery.clone())
            .collect()
    }

    /// Method names of the messages delivered to `vat`, in order.
    pub fn methods_to(&self, vat: VatId) -> Vec<String> {
        self.deliveries_to(vat)
            .iter()
            .filter_map(|delivery| match delivery {
                VatDelivery::Message { message, .. } => message.methargs.method(),
                _ => None,
            })
            .collect()
    }

    pub fn starts(&self) -> Vec<(VatId, Option<Vec<u8>>)> {
        self.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<VatId> {
        self.lock().stops.clone()
    }

    pub fn clear_log(&self) {
        let mut inner = self.lock();
        inner.deliveries.clear();
        inner.starts.clear();
        inner.stops.clear();
    }
}

impl VatManager for MockVatManager {
    fn start_worker(&mut self, vat: VatId, snapshot: Option<&[u8]>) -> Result<(), VatManagerError> {
        let heap = match snapshot {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                text.rsplit(':')
                    .next()
                    .and_then(|count| count.parse().ok())
                    .ok_or_else(|| VatManagerError::Worker {
                        vat,
                        reason: format!("unreadable snapshot {text:?}"),
                    })?
            }
            None => 0,
        };
        let mut inner = self.lock();
        inner.workers.insert(vat, heap);
        inner.starts.push((vat, snapshot.map(<[u8]>::to_vec)));
        Ok(())
    }

    fn deliver(
        &mut self,
        vat: VatId,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<DeliveryOutcome, VatManagerError> {
        let behavior = {
            let mut inner = self.lock();
            let Some(count) = inner.workers.get_mut(&vat) else {
                return Err(VatManagerError::NoWorker(vat));
            };
            *count += 1;
            inner.deliveries.push((vat, delivery.clone()));
            inner.behaviors.get(&vat).cloned()
        };
        Ok(match behavior {
            Some(behavior) => behavior(delivery, syscalls),
            None => DeliveryOutcome::ok(1),
        })
    }

    fn make_snapshot(&mut self, vat: VatId) -> Result<Vec<u8>, VatManagerError> {
        let inner = self.lock();
        if inner.fail_snapshots {
            return Err(VatManagerError::Snapshot {
                vat,
                reason: "snapshots disabled".into(),
            });
        }
        let count = inner.workers.get(&vat).ok_or(VatManagerError::NoWorker(vat))?;
        Ok(format!("heap:{vat}:{count}").into_bytes())
    }

    fn stop_worker(&mut self, vat: VatId) {
        let mut inner = self.lock();
        inner.workers.remove(&vat);
        inner.stops.push(vat);
    }
}

pub fn mem_kernel(config: KernelConfig) -> (Kernel<MemKvStore>, MockVatManager, Arc<MemKvStore>) {
    let store = Arc::new(MemKvStore::new());
    let manager = MockVatManager::new();
    let kernel = open_kernel(store.clone(), Box::new(manager.clone()), config).unwrap();
    (kernel, manager, store)
}

/// Config that never snapshots, so tests see every delivery in one span.
pub fn no_snapshots() -> KernelConfig {
    KernelConfig {
        snapshot_initial: 0,
        snapshot_interval: 0,
        ..KernelConfig::default()
    }
}

pub fn reopen<S: KvStore>(
    store: Arc<S>,
    manager: &MockVatManager,
    config: KernelConfig,
) -> Kernel<S> {
    open_kernel(store, Box::new(manager.clone()), config).unwrap()
}

pub fn kmethargs(method: &str, slots: Vec<KernelRef>) -> CapData<KernelRef> {
    CapData::methargs(method, Vec::new(), slots)
}

pub fn vmethargs(method: &str, args: Vec<Value>, slots: Vec<VatRef>) -> VatCapData {
    CapData::methargs(method, args, slots)
}

/// The parts of a delivered message a behavior usually needs.
pub struct Incoming {
    pub method: String,
    pub target: VatRef,
    pub slots: Vec<VatRef>,
    pub result: Option<VatRef>,
}

pub fn incoming(delivery: &VatDelivery) -> Option<Incoming> {
    match delivery {
        VatDelivery::Message { target, message } => Some(Incoming {
            method: message.methargs.method()?,
            target: *target,
            slots: message.methargs.slots.clone(),
            result: message.result,
        }),
        _ => None,
    }
}

pub fn send(
    syscalls: &mut dyn SyscallHandler,
    target: VatRef,
    method: &str,
    slots: Vec<VatRef>,
    result: Option<VatRef>,
) -> VatSyscallResult {
    syscalls.syscall(VatSyscall::Send {
        target,
        message: VatMessage::new(vmethargs(method, Vec::new(), slots), result),
    })
}

pub fn resolve(
    syscalls: &mut dyn SyscallHandler,
    vpid: VatRef,
    rejected: bool,
    data: VatCapData,
) -> VatSyscallResult {
    syscalls.syscall(VatSyscall::Resolve {
        resolutions: vec![VatResolution {
            vpid,
            rejected,
            data,
        }],
    })
}

pub fn fulfill_with_number(syscalls: &mut dyn SyscallHandler, vpid: VatRef, n: i64) {
    let outcome = resolve(syscalls, vpid, false, CapData::data(&json!(n)));
    assert_eq!(outcome, VatSyscallResult::Ok);
}

pub fn o_plus(id: u64) -> VatRef {
    VatRef::object_export(id)
}

pub fn o_minus(id: u64) -> VatRef {
    VatRef::object_import(id)
}

pub fn p_plus(id: u64) -> VatRef {
    VatRef::promise_export(id)
}

pub fn p_minus(id: u64) -> VatRef {
    VatRef::promise_import(id)
}

pub fn ok() -> DeliveryOutcome {
    DeliveryOutcome::ok(1)
}

/// The JSON value inside a smallcaps body.
pub fn body_json<R>(data: &CapData<R>) -> Value {
    serde_json::from_str(data.body.strip_prefix('#').unwrap()).unwrap()
}

pub fn error_message<R>(data: &CapData<R>) -> String {
    body_json(data)["#error"].as_str().unwrap().to_string()
}

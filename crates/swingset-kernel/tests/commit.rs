mod helpers;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use helpers::*;
use swingset_kernel::{
    ComputronBudget, CrankBudget, DeliveryOutcome, KernelError, RunUntilIdle, VatOptions,
    open_kernel,
};
use swingset_store::{
    FsKvStore, KvStore, MemKvStore, StoreError, StoreResult, WriteBatch,
};
use tempfile::TempDir;

fn contents(store: &impl KvStore) -> BTreeMap<String, Vec<u8>> {
    store.range("", None).unwrap().into_iter().collect()
}

#[test]
fn a_torn_commit_recovers_to_a_crank_boundary() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FsKvStore::open(tmp.path()).unwrap());
    let manager = MockVatManager::new();
    let mut kernel = open_kernel(store.clone(), Box::new(manager.clone()), no_snapshots()).unwrap();
    let alice = kernel.create_vat("alice", VatOptions::default()).unwrap();
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    manager.set_behavior(bob, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery) {
            send(syscalls, msg.slots[0], "echo", vec![o_plus(1)], None);
            fulfill_with_number(syscalls, msg.result.unwrap(), 5);
        }
        ok()
    });
    let alice_root = kernel.vat_root(alice).unwrap();
    kernel
        .queue_to_kref(kernel.vat_root(bob).unwrap(), kmethargs("go", vec![alice_root]), true)
        .unwrap();

    let before_state = contents(store.as_ref());
    let before_log = fs::read(store.log_path()).unwrap();
    kernel.run_one_crank().unwrap().unwrap();
    let after_state = contents(store.as_ref());
    let after_log = fs::read(store.log_path()).unwrap();
    assert!(after_log.len() > before_log.len());
    assert_ne!(before_state, after_state);

    for cut in before_log.len()..=after_log.len() {
        let copy = TempDir::new().unwrap();
        fs::write(copy.path().join("kv.log"), &after_log[..cut]).unwrap();
        let reopened = FsKvStore::open(copy.path()).unwrap();
        let expected = if cut == after_log.len() {
            &after_state
        } else {
            &before_state
        };
        assert_eq!(&contents(&reopened), expected, "cut at {cut}");
    }
}

/// A store whose commits can be made to fail on demand.
#[derive(Default)]
struct FlakyStore {
    inner: MemKvStore,
    failing: AtomicBool,
}

impl KvStore for FlakyStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.inner.range(start, end)
    }

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Poisoned);
        }
        self.inner.commit(batch)
    }
}

#[test]
fn a_failed_commit_halts_the_kernel() {
    let store = Arc::new(FlakyStore::default());
    let manager = MockVatManager::new();
    let mut kernel = open_kernel(store.clone(), Box::new(manager.clone()), no_snapshots()).unwrap();
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    kernel
        .queue_to_kref(kernel.vat_root(bob).unwrap(), kmethargs("go", vec![]), false)
        .unwrap();
    let committed = store.inner.snapshot();

    store.failing.store(true, Ordering::SeqCst);
    let err = kernel.run_one_crank().unwrap_err();
    assert!(matches!(err, KernelError::Store(_)), "{err}");
    assert_eq!(store.inner.snapshot(), committed);

    store.failing.store(false, Ordering::SeqCst);
    assert!(matches!(
        kernel.run_one_crank(),
        Err(KernelError::Panicked(_))
    ));
    assert_eq!(store.inner.snapshot(), committed);
}

#[test]
fn crank_numbers_and_hashes_advance_per_commit() {
    let (mut kernel, _manager, _store) = mem_kernel(no_snapshots());
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    let root = kernel.vat_root(bob).unwrap();
    assert_eq!(kernel.state().crank_number().unwrap(), 0);
    for method in ["a", "b"] {
        kernel.queue_to_kref(root, kmethargs(method, vec![]), false).unwrap();
    }
    // Host operations commit without counting as cranks.
    assert_eq!(kernel.state().crank_number().unwrap(), 0);

    let reports = kernel.run(&mut RunUntilIdle).unwrap();
    assert_eq!(
        reports.iter().map(|r| r.crank_number).collect::<Vec<_>>(),
        [1, 2]
    );
    assert_ne!(reports[0].crank_hash, reports[1].crank_hash);
    assert_eq!(kernel.state().crank_number().unwrap(), 2);
    assert!(kernel.run_one_crank().unwrap().is_none());
    assert_eq!(kernel.state().crank_number().unwrap(), 2);
}

#[test]
fn identical_histories_have_identical_activity_hashes() {
    let run = || {
        let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
        let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
        manager.set_behavior(bob, |delivery, syscalls| {
            if let Some(msg) = incoming(delivery) {
                fulfill_with_number(syscalls, msg.result.unwrap(), 3);
            }
            ok()
        });
        kernel
            .queue_to_kref(kernel.vat_root(bob).unwrap(), kmethargs("go", vec![]), true)
            .unwrap();
        kernel.run(&mut RunUntilIdle).unwrap();
        kernel.state().activity_hash().unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn run_policies_stop_early() {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    manager.set_behavior(bob, |_, _| DeliveryOutcome::ok(10));
    let root = kernel.vat_root(bob).unwrap();
    for _ in 0..5 {
        kernel.queue_to_kref(root, kmethargs("work", vec![]), false).unwrap();
    }

    let reports = kernel.run(&mut CrankBudget::new(2)).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(kernel.run_queue_len().unwrap(), 3);

    let mut budget = ComputronBudget::new(15);
    let reports = kernel.run(&mut budget).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(budget.used(), 20);
    assert_eq!(kernel.run_queue_len().unwrap(), 1);

    kernel.run(&mut RunUntilIdle).unwrap();
    assert!(kernel.is_idle().unwrap());
    assert_eq!(manager.methods_to(bob).len(), 5);
}

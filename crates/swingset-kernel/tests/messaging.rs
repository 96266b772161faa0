mod helpers;

use helpers::*;
use serde_json::json;
use swingset_kernel::state::RunQueueEntry;
use swingset_kernel::{
    CapData, CrankKind, KernelError, PromiseStatus, RunUntilIdle, SyscallHandler, VatDelivery,
    VatId, VatOptions, VatSyscall, VatSyscallResult,
};

#[test]
fn subscribers_are_notified_in_subscription_order() {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let alice = kernel.create_vat("alice", VatOptions::default()).unwrap();
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    let carol = kernel.create_vat("carol", VatOptions::default()).unwrap();
    let dave = kernel.create_vat("dave", VatOptions::default()).unwrap();

    manager.set_behavior(alice, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery)
            && msg.method == "go"
        {
            let &[x, c, d] = msg.slots.as_slice() else {
                panic!("go takes three references");
            };
            send(syscalls, c, "watch", vec![p_plus(1)], None);
            send(syscalls, d, "watch", vec![p_plus(1)], None);
            send(syscalls, x, "foo", vec![], Some(p_plus(1)));
        }
        ok()
    });
    let watcher = |delivery: &VatDelivery, syscalls: &mut dyn SyscallHandler| {
        if let Some(msg) = incoming(delivery)
            && msg.method == "watch"
        {
            let result = syscalls.syscall(VatSyscall::Subscribe { vpid: msg.slots[0] });
            assert_eq!(result, VatSyscallResult::Ok);
        }
        ok()
    };
    manager.set_behavior(carol, watcher);
    manager.set_behavior(dave, watcher);
    manager.set_behavior(bob, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery)
            && msg.method == "foo"
        {
            fulfill_with_number(syscalls, msg.result.unwrap(), 42);
        }
        ok()
    });

    let slots = vec![
        kernel.vat_root(bob).unwrap(),
        kernel.vat_root(carol).unwrap(),
        kernel.vat_root(dave).unwrap(),
    ];
    kernel
        .queue_to_kref(kernel.vat_root(alice).unwrap(), kmethargs("go", slots), false)
        .unwrap();

    // alice's go, then both watches, then bob's foo.
    for _ in 0..4 {
        kernel.run_one_crank().unwrap().unwrap();
    }
    let kpid = kernel
        .state()
        .kref_for_vref(alice, p_plus(1))
        .unwrap()
        .unwrap();
    assert_eq!(kernel.kp_status(kpid).unwrap(), PromiseStatus::Fulfilled);
    assert_eq!(
        kernel.state().run_queue_entries().unwrap(),
        vec![
            RunQueueEntry::Notify { vat: carol, kpid },
            RunQueueEntry::Notify { vat: dave, kpid },
        ]
    );

    let reports = kernel.run(&mut RunUntilIdle).unwrap();
    let notified: Vec<_> = reports
        .iter()
        .filter(|report| report.kind == CrankKind::Notify)
        .map(|report| report.vat)
        .collect();
    assert_eq!(notified, vec![Some(carol), Some(dave)]);

    for vat in [carol, dave] {
        let notifies: Vec<_> = manager
            .deliveries_to(vat)
            .into_iter()
            .filter_map(|delivery| match delivery {
                VatDelivery::Notify { resolutions } => Some(resolutions),
                _ => None,
            })
            .collect();
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0][0].vpid, p_minus(60));
        assert_eq!(body_json(&notifies[0][0].data), json!(42));
    }
    assert!(
        manager
            .deliveries_to(alice)
            .iter()
            .all(|delivery| !matches!(delivery, VatDelivery::Notify { .. }))
    );
    assert!(kernel.is_idle().unwrap());
}

fn pipeline_scenario(options: VatOptions) -> (MockVatManager, VatId) {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let alice = kernel.create_vat("alice", VatOptions::default()).unwrap();
    let bob = kernel.create_vat("bob", options).unwrap();

    manager.set_behavior(alice, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery)
            && msg.method == "go"
        {
            let x = msg.slots[0];
            send(syscalls, x, "make", vec![], Some(p_plus(1)));
            send(syscalls, p_plus(1), "bar", vec![], None);
            send(syscalls, p_plus(1), "baz", vec![], None);
            send(syscalls, x, "finish", vec![p_plus(1)], None);
        }
        ok()
    });
    manager.set_behavior(bob, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery)
            && msg.method == "finish"
        {
            let y = CapData::reference(o_plus(1), "Y");
            let outcome = resolve(syscalls, msg.slots[0], false, y);
            assert_eq!(outcome, VatSyscallResult::Ok);
        }
        ok()
    });

    let bob_root = kernel.vat_root(bob).unwrap();
    kernel
        .queue_to_kref(kernel.vat_root(alice).unwrap(), kmethargs("go", vec![bob_root]), false)
        .unwrap();
    // go, make, bar, baz, finish
    for _ in 0..5 {
        kernel.run_one_crank().unwrap().unwrap();
    }
    if !kernel.state().vat_info(bob).unwrap().unwrap().options.enable_pipelining {
        let y = kernel.state().kref_for_vref(bob, o_plus(1)).unwrap().unwrap();
        let queued: Vec<_> = kernel
            .state()
            .run_queue_entries()
            .unwrap()
            .into_iter()
            .map(|entry| match entry {
                RunQueueEntry::Send { target, message } => (target, message.methargs.method()),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            queued,
            vec![(y, Some("bar".to_string())), (y, Some("baz".to_string()))]
        );
    }
    kernel.run(&mut RunUntilIdle).unwrap();
    (manager, bob)
}

#[test]
fn messages_queued_on_a_promise_follow_its_resolution_in_order() {
    let (manager, bob) = pipeline_scenario(VatOptions::default());
    assert_eq!(manager.methods_to(bob), ["make", "finish", "bar", "baz"]);
    let targets: Vec<_> = manager
        .deliveries_to(bob)
        .into_iter()
        .filter_map(|delivery| incoming(&delivery))
        .filter(|msg| msg.method.starts_with('b'))
        .map(|msg| msg.target)
        .collect();
    assert_eq!(targets, vec![o_plus(1), o_plus(1)]);
}

#[test]
fn pipelining_decider_receives_sends_to_its_promise() {
    let (manager, bob) = pipeline_scenario(VatOptions {
        enable_pipelining: true,
        ..VatOptions::default()
    });
    assert_eq!(manager.methods_to(bob), ["make", "bar", "baz", "finish"]);
    let targets: Vec<_> = manager
        .deliveries_to(bob)
        .into_iter()
        .filter_map(|delivery| incoming(&delivery))
        .filter(|msg| msg.method.starts_with('b'))
        .map(|msg| msg.target)
        .collect();
    assert_eq!(targets, vec![p_minus(60), p_minus(60)]);
}

#[test]
fn a_promise_settles_once() {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    manager.set_behavior(bob, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery) {
            let result = msg.result.unwrap();
            fulfill_with_number(syscalls, result, 1);
            let again = resolve(syscalls, result, false, CapData::data(&json!(2)));
            assert!(again.is_error());
        }
        ok()
    });
    let kp = kernel
        .queue_to_kref(kernel.vat_root(bob).unwrap(), kmethargs("foo", vec![]), true)
        .unwrap()
        .unwrap();
    assert_eq!(kernel.kp_status(kp).unwrap(), PromiseStatus::Unresolved);
    kernel.run(&mut RunUntilIdle).unwrap();

    let (rejected, data) = kernel.kp_resolution(kp).unwrap().unwrap();
    assert!(!rejected);
    assert_eq!(body_json(&data), json!(1));
    assert!(kernel.panic_reason().is_none());
}

#[test]
fn sending_to_a_promise_for_data_rejects() {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    manager.set_behavior(bob, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery) {
            fulfill_with_number(syscalls, msg.result.unwrap(), 42);
        }
        ok()
    });
    let answer = kernel
        .queue_to_kref(kernel.vat_root(bob).unwrap(), kmethargs("answer", vec![]), true)
        .unwrap()
        .unwrap();
    kernel.run(&mut RunUntilIdle).unwrap();

    let followup = kernel
        .queue_to_kref(answer, kmethargs("frobnicate", vec![]), true)
        .unwrap()
        .unwrap();
    kernel.run(&mut RunUntilIdle).unwrap();
    let (rejected, data) = kernel.kp_resolution(followup).unwrap().unwrap();
    assert!(rejected);
    assert!(error_message(&data).contains("frobnicate"));
    assert_eq!(manager.methods_to(bob), ["answer"]);
}

#[test]
fn host_settles_only_kernel_decided_promises() {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    let bob_root = kernel.vat_root(bob).unwrap();

    // Still in the run queue, so nobody decides it yet.
    let early = kernel
        .queue_to_kref(bob_root, kmethargs("early", vec![]), true)
        .unwrap()
        .unwrap();
    kernel.resolve(early, false, CapData::data(&json!(7))).unwrap();

    let held = kernel
        .queue_to_kref(bob_root, kmethargs("hold", vec![]), true)
        .unwrap()
        .unwrap();
    kernel.run(&mut RunUntilIdle).unwrap();

    // bob got "early" without a result and now decides "hold"'s result.
    let early_result = manager
        .deliveries_to(bob)
        .iter()
        .find_map(incoming)
        .map(|msg| msg.result);
    assert_eq!(early_result, Some(None));
    assert_eq!(body_json(&kernel.kp_resolution(early).unwrap().unwrap().1), json!(7));
    assert!(matches!(
        kernel.resolve(held, false, CapData::data(&json!(0))),
        Err(KernelError::NotKernelDecided { decider, .. }) if decider == bob
    ));
    assert_eq!(kernel.kp_status(held).unwrap(), PromiseStatus::Unresolved);
    assert!(kernel.panic_reason().is_none());
}

#[test]
fn queued_messages_follow_a_promise_resolved_to_a_promise() {
    let (mut kernel, manager, _store) = mem_kernel(no_snapshots());
    let alice = kernel.create_vat("alice", VatOptions::default()).unwrap();
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();

    manager.set_behavior(alice, |delivery, syscalls| {
        if let Some(msg) = incoming(delivery)
            && msg.method == "go"
        {
            let x = msg.slots[0];
            send(syscalls, x, "make", vec![], Some(p_plus(1)));
            send(syscalls, p_plus(1), "bar", vec![], Some(p_plus(2)));
            send(syscalls, x, "finish", vec![p_plus(1)], None);
        }
        ok()
    });
    manager.set_behavior(bob, |delivery, syscalls| {
        let Some(msg) = incoming(delivery) else {
            return ok();
        };
        match msg.method.as_str() {
            // Hand the made promise off to one bob decides later.
            "finish" => {
                let q = CapData::reference(p_plus(1), "Q");
                assert_eq!(resolve(syscalls, msg.slots[0], false, q), VatSyscallResult::Ok);
            }
            "settle" => {
                let y = CapData::reference(o_plus(1), "Y");
                assert_eq!(resolve(syscalls, p_plus(1), false, y), VatSyscallResult::Ok);
            }
            "bar" => fulfill_with_number(syscalls, msg.result.unwrap(), 7),
            _ => {}
        }
        ok()
    });

    let bob_root = kernel.vat_root(bob).unwrap();
    kernel
        .queue_to_kref(kernel.vat_root(alice).unwrap(), kmethargs("go", vec![bob_root]), false)
        .unwrap();
    kernel.run(&mut RunUntilIdle).unwrap();

    let bar_result = kernel
        .state()
        .kref_for_vref(alice, p_plus(2))
        .unwrap()
        .unwrap();
    assert_eq!(kernel.kp_status(bar_result).unwrap(), PromiseStatus::Unresolved);
    assert_eq!(manager.methods_to(bob), ["make", "finish"]);

    kernel
        .queue_to_kref(bob_root, kmethargs("settle", vec![]), false)
        .unwrap();
    kernel.run(&mut RunUntilIdle).unwrap();

    assert_eq!(manager.methods_to(bob), ["make", "finish", "settle", "bar"]);
    let bar = manager
        .deliveries_to(bob)
        .iter()
        .filter_map(incoming)
        .find(|msg| msg.method == "bar")
        .unwrap();
    assert_eq!(bar.target, o_plus(1));
    let (rejected, data) = kernel.kp_resolution(bar_result).unwrap().unwrap();
    assert!(!rejected);
    assert_eq!(body_json(&data), json!(7));
    assert!(kernel.panic_reason().is_none());
}

#[test]
fn host_resolution_errors_leave_the_kernel_running() {
    let (mut kernel, _manager, _store) = mem_kernel(no_snapshots());
    let bob = kernel.create_vat("bob", VatOptions::default()).unwrap();
    let kp = kernel
        .queue_to_kref(kernel.vat_root(bob).unwrap(), kmethargs("early", vec![]), true)
        .unwrap()
        .unwrap();

    assert!(matches!(
        kernel.resolve(kp, false, CapData::reference(kp, "P")),
        Err(KernelError::ResolvedToItself(p)) if p == kp
    ));
    assert_eq!(kernel.kp_status(kp).unwrap(), PromiseStatus::Unresolved);

    kernel.resolve(kp, false, CapData::data(&json!(1))).unwrap();
    assert!(matches!(
        kernel.resolve(kp, false, CapData::data(&json!(2))),
        Err(KernelError::AlreadySettled(p)) if p == kp
    ));
    assert!(kernel.panic_reason().is_none());
    assert_eq!(body_json(&kernel.kp_resolution(kp).unwrap().unwrap().1), json!(1));
}

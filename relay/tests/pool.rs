// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Worker-pool protocol: the broker asks for another worker exactly when
//! the pool runs dry, spawned workers register against that request, and
//! flush kicks every parked worker back to user space.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use relay::Broker;
use relay_shared::sys::TransactionFlags;

#[test]
fn spawn_request_and_registered_worker_dispatch() {
    let externs = TestExterns::new();
    let broker = Broker::new(externs.clone());

    let b = broker.open(200, 1000, 0);
    b.map(1 << 20).unwrap();
    b.set_context_manager().unwrap();
    b.set_max_threads(2).unwrap();
    send(&b, 1, &Cmds::new().enter_looper());

    let a = broker.open(100, 1000, 0);
    a.map(1 << 20).unwrap();
    externs.stage(100, 0x5000, &[0u8; 4]);

    // First call: the only worker takes it, so the broker asks for one
    // more by replacing the leading filler.
    let td = call(0, 5, TransactionFlags::empty(), 0x5000, 4);
    let got = roundtrip(&a, 7, &Cmds::new().transaction(&td));
    assert_eq!(got, vec![Ret::Noop, Ret::TransactionComplete]);
    let got = recv(&b, 1);
    assert_eq!(got[0], Ret::SpawnLooper);
    let Ret::Transaction(t1) = &got[1] else {
        panic!("expected the call, got {:?}", got);
    };
    assert_eq!(t1.code, 5);

    // The spawned worker binds against the outstanding request.
    send(&b, 2, &Cmds::new().register_looper());
    broker.with_stats(|s| {
        assert_eq!(s.commands_seen(relay_shared::Command::RegisterLooper as u32), 1)
    });

    // With worker 1 still mid-call, pool work lands on worker 2.
    std::thread::scope(|s| {
        let w2 = s.spawn(|| {
            let got = recv(&b, 2);
            let Ret::Transaction(t2) = &got[1] else {
                panic!("expected dispatch to the spawned worker, got {:?}", got);
            };
            assert_eq!(t2.code, 6);
        });
        let td = call(0, 6, TransactionFlags::ONE_WAY, 0x5000, 4);
        let got = roundtrip(&a, 7, &Cmds::new().transaction(&td));
        assert_eq!(got, vec![Ret::Noop, Ret::TransactionComplete]);
        w2.join().unwrap();
    });
}

#[test]
fn flush_returns_parked_workers() {
    let externs = TestExterns::new();
    let broker = Broker::new(externs.clone());

    let b = broker.open(200, 1000, 0);
    b.map(1 << 20).unwrap();
    send(&b, 1, &Cmds::new().enter_looper());

    std::thread::scope(|s| {
        let parked = s.spawn(|| {
            // Blocks until the flush below; returns with no payload
            // records.
            let got = recv(&b, 1);
            assert!(got.len() <= 1, "flush must not fabricate work: {:?}", got);
        });
        // Let the worker reach its wait, then kick it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        b.flush();
        parked.join().unwrap();
    });
}

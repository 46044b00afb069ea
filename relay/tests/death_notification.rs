// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Death notification lifecycle, including the clear-while-delivered race:
//! the subscriber must see exactly one dead notification and then the
//! clear acknowledgement.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use relay::{Broker, Error};
use relay_shared::sys::{FlatObject, ObjectKind, TransactionFlags};

const COOKIE: u64 = 0xdead_beef;

#[test]
fn death_fires_once_and_clear_is_acknowledged() {
    let externs = TestExterns::new();
    let broker = Broker::new(externs.clone());

    let b = broker.open(200, 1000, 0);
    b.map(1 << 20).unwrap();
    b.set_context_manager().unwrap();
    send(&b, 1, &Cmds::new().enter_looper());

    let a = broker.open(100, 1000, 0);
    a.map(1 << 20).unwrap();
    send(&a, 1, &Cmds::new().enter_looper());

    // A publishes a node; B keeps a strong handle and subscribes.
    externs.stage(100, 0x5000, &flat(ObjectKind::Node, 0, 0x1000, 0x11));
    externs.stage(100, 0x5100, &offsets(&[0]));
    let td = call_with_objects(0, 1, TransactionFlags::empty(), 0x5000, 24, 0x5100, 8);
    let got = roundtrip(&a, 1, &Cmds::new().transaction(&td));
    assert!(got.contains(&Ret::TransactionComplete));
    send(&a, 1, &Cmds::new().increfs_done(0x1000, 0x11).acquire_done(0x1000, 0x11));

    let got = recv(&b, 1);
    let Ret::Transaction(td1) = &got[1] else {
        panic!("expected publication, got {:?}", got);
    };
    let raw = b.read_buffer(td1.data_ptr, FlatObject::WIRE_SIZE).unwrap();
    let h_b = FlatObject::decode(&raw).payload as u32;
    assert_eq!(h_b, 1);
    let ack = call(0, 0, TransactionFlags::empty(), 0, 0);
    let got = roundtrip(
        &b,
        1,
        &Cmds::new()
            .acquire(h_b)
            .free_buffer(td1.data_ptr)
            .reply(&ack)
            .request_death(h_b, COOKIE),
    );
    assert!(got.contains(&Ret::TransactionComplete));
    let got = recv(&a, 1);
    assert!(matches!(got[1], Ret::Reply(_)), "got {:?}", got);

    // The owner goes away.
    a.close();
    a.wait_released();

    // Exactly one dead notification, and the read stops right after it.
    let got = recv(&b, 1);
    assert_eq!(got, vec![Ret::Noop, Ret::DeadNode(COOKIE)]);

    // Clearing now promotes the delivered notification, so the clear
    // acknowledgement follows the ack, not a second dead notification.
    send(&b, 1, &Cmds::new().clear_death(h_b, COOKIE).dead_node_done(COOKIE));
    let got = recv(&b, 1);
    assert_eq!(got, vec![Ret::Noop, Ret::ClearDeathNotificationDone(COOKIE)]);

    // Nothing further is pending.
    assert!(matches!(try_recv(&b, 1), Err(Error::WouldBlock)));
}

#[test]
fn registration_on_orphan_fires_immediately() {
    let externs = TestExterns::new();
    let broker = Broker::new(externs.clone());

    let b = broker.open(200, 1000, 0);
    b.map(1 << 20).unwrap();
    b.set_context_manager().unwrap();
    send(&b, 1, &Cmds::new().enter_looper());

    let a = broker.open(100, 1000, 0);
    a.map(1 << 20).unwrap();
    send(&a, 1, &Cmds::new().enter_looper());

    externs.stage(100, 0x5000, &flat(ObjectKind::Node, 0, 0x1000, 0));
    externs.stage(100, 0x5100, &offsets(&[0]));
    let td = call_with_objects(0, 1, TransactionFlags::empty(), 0x5000, 24, 0x5100, 8);
    roundtrip(&a, 1, &Cmds::new().transaction(&td));
    send(&a, 1, &Cmds::new().increfs_done(0x1000, 0).acquire_done(0x1000, 0));

    let got = recv(&b, 1);
    let Ret::Transaction(td1) = &got[1] else {
        panic!("expected publication, got {:?}", got);
    };
    let ack = call(0, 0, TransactionFlags::empty(), 0, 0);
    roundtrip(
        &b,
        1,
        &Cmds::new().acquire(1).free_buffer(td1.data_ptr).reply(&ack),
    );
    let got = recv(&a, 1);
    assert!(matches!(got[1], Ret::Reply(_)), "got {:?}", got);

    a.close();
    a.wait_released();

    // Subscribing after the owner died fires at once.
    let got = roundtrip(&b, 1, &Cmds::new().request_death(1, COOKIE));
    assert_eq!(got, vec![Ret::Noop, Ret::DeadNode(COOKIE)]);
    send(&b, 1, &Cmds::new().dead_node_done(COOKIE));
    assert!(matches!(try_recv(&b, 1), Err(Error::WouldBlock)));
}

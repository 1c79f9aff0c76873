//! Dispatch ordering: FIFO within a priority, priority preemption, queue
//! timeout reaping, same-bucket batching.

mod common;

use std::time::Duration;

use common::*;
use silo_api::{MessageType, ReturnCode, StorageMessage};

#[test]
fn equal_priority_same_bucket_dispatches_fifo() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x40);
    let m1 = put(b, 100);
    let m2 = put(b, 100);
    let (id1, id2) = (m1.id(), m2.id());
    assert!(h.schedule(m1, 0));
    assert!(h.schedule(m2, 0));

    let first = h.next_message(0, 0).expect("first put runnable");
    assert_eq!(first.message.id(), id1);
    // Second worker: the bucket is exclusively held, nothing else queued.
    assert!(h.next_message(0, 0).is_none());
    drop(first.lock);
    let second = h.next_message(0, 0).expect("second put after release");
    assert_eq!(second.message.id(), id2);
}

#[test]
fn lower_priority_value_preempts_earlier_arrival() {
    let (h, _sender) = handler(1, 1);
    let slow = put(bucket(0x100), 200);
    let urgent = put(bucket(0x200), 100);
    let urgent_id = urgent.id();
    assert!(h.schedule(slow, 0));
    assert!(h.schedule(urgent, 0));

    let first = h.next_message(0, 0).expect("urgent message first");
    assert_eq!(first.message.id(), urgent_id);
}

#[test]
fn priorities_drain_in_order_per_bucket() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x7);
    for priority in [120, 80, 100] {
        assert!(h.schedule(put(b, priority), 0));
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let locked = h.next_message(0, 0).expect("runnable message");
        seen.push(locked.message.priority());
        drop(locked.lock);
    }
    assert_eq!(seen, vec![80, 100, 120]);
}

#[test]
fn expired_message_is_reaped_not_dispatched() {
    let (h, sender) = handler(1, 1);
    let b = bucket(0x9);
    let stale = StorageMessage::new(MessageType::Put, b, 100, Duration::ZERO);
    let stale_id = stale.id();
    assert!(h.schedule(stale, 0));

    assert!(h.next_message(0, 0).is_none());
    let reply = sender.reply_for(stale_id).expect("timeout reply sent");
    assert_eq!(reply.result(), ReturnCode::Timeout);
}

#[test]
fn reaping_does_not_block_runnable_work() {
    let (h, sender) = handler(1, 1);
    let stale = StorageMessage::new(MessageType::Put, bucket(0x1), 50, Duration::ZERO);
    let stale_id = stale.id();
    let live = put(bucket(0x2), 100);
    let live_id = live.id();
    assert!(h.schedule(stale, 0));
    assert!(h.schedule(live, 0));

    let locked = h.next_message(0, 0).expect("live message dispatched");
    assert_eq!(locked.message.id(), live_id);
    let reply = sender.reply_for(stale_id).expect("timeout reply sent");
    assert_eq!(reply.result(), ReturnCode::Timeout);
}

#[test]
fn scan_skips_locked_bucket_and_dispatches_other_work() {
    let (h, _sender) = handler(1, 1);
    let hot = bucket(0x10);
    let cold = bucket(0x20);
    assert!(h.schedule(put(hot, 50), 0));
    assert!(h.schedule(put(hot, 60), 0));
    let behind = put(cold, 200);
    let behind_id = behind.id();
    assert!(h.schedule(behind, 0));

    let first = h.next_message(0, 0).expect("hot bucket put");
    // The second hot put is blocked; the lower-priority cold put runs.
    let second = h.next_message(0, 0).expect("cold bucket put");
    assert_eq!(second.message.id(), behind_id);
    drop(first.lock);
    drop(second.lock);
}

#[test]
fn same_bucket_batching_reuses_the_lock() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x33);
    let m1 = put(b, 100);
    let m2 = put(b, 100);
    let id2 = m2.id();
    assert!(h.schedule(m1, 0));
    assert!(h.schedule(m2, 0));

    let first = h.next_message(0, 0).expect("first put");
    let second = h
        .next_message_for(0, first.lock)
        .expect("second put under the same lock");
    assert_eq!(second.message.id(), id2);
    assert_eq!(second.lock.bucket(), b);
    // Nothing left for the bucket: the batch ends and the lock is released.
    assert!(h.next_message_for(0, second.lock).is_none());

    // The bucket must be free again.
    assert!(h.schedule(put(b, 100), 0));
    assert!(h.next_message(0, 0).is_some());
}

#[test]
fn batching_never_crosses_lock_modes() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x44);
    assert!(h.schedule(put(b, 100), 0));
    assert!(h.schedule(get(b, 100), 0));

    let write = h.next_message(0, 0).expect("put dispatched");
    // Next entry for the bucket is a shared-mode read; the batch ends.
    assert!(h.next_message_for(0, write.lock).is_none());
    let read = h.next_message(0, 0).expect("get dispatched after release");
    assert_eq!(read.message.msg_type(), MessageType::Get);
}

#[test]
fn stripe_routing_is_pure_per_bucket() {
    let (h, _sender) = handler(1, 5);
    let b = bucket(0xbeef);
    let stripe = h.stripe_index(0, b);
    for _ in 0..50 {
        assert_eq!(h.stripe_index(0, b), stripe);
    }
    assert!(h.schedule(put(b, 100), 0));
    // The message is only visible on its home stripe.
    for other in (0..5).filter(|s| *s != stripe) {
        assert!(h.next_message(0, other).is_none());
    }
    assert!(h.next_message(0, stripe).is_some());
}

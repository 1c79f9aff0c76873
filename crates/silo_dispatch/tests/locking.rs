//! Bucket lock semantics: exclusivity, shared stacking, out-of-band locks,
//! release liveness.

mod common;

use std::time::{Duration, Instant};

use common::*;
use silo_api::LockMode;

#[test]
fn exclusive_lock_blocks_same_bucket() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x100);
    assert!(h.schedule(put(b, 100), 0));
    assert!(h.schedule(put(b, 100), 0));

    let first = h.next_message(0, 0).expect("first write");
    assert_eq!(first.lock.lock_mode(), LockMode::Exclusive);
    assert!(h.next_message(0, 0).is_none());
    drop(first.lock);
    assert!(h.next_message(0, 0).is_some());
}

#[test]
fn shared_locks_stack_for_reads() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x200);
    for _ in 0..3 {
        assert!(h.schedule(get(b, 100), 0));
    }

    let r1 = h.next_message(0, 0).expect("first read");
    let r2 = h.next_message(0, 0).expect("second read concurrently");
    let r3 = h.next_message(0, 0).expect("third read concurrently");
    assert_eq!(r1.lock.lock_mode(), LockMode::Shared);

    // A write cannot cut in while any shared holder remains.
    assert!(h.schedule(put(b, 10), 0));
    assert!(h.next_message(0, 0).is_none());
    drop(r1.lock);
    drop(r2.lock);
    assert!(h.next_message(0, 0).is_none());
    drop(r3.lock);
    let write = h.next_message(0, 0).expect("write after all readers");
    assert_eq!(write.lock.lock_mode(), LockMode::Exclusive);
}

#[test]
fn reads_do_not_pass_an_exclusive_holder() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x300);
    assert!(h.schedule(put(b, 100), 0));
    assert!(h.schedule(get(b, 10), 0));

    let write = h.next_message(0, 0).expect("write first");
    assert!(h.next_message(0, 0).is_none());
    drop(write.lock);
    assert!(h.next_message(0, 0).is_some());
}

#[test]
fn out_of_band_lock_participates_in_the_table() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x400);
    let guard = h.lock(b, 0, LockMode::Exclusive);
    assert_eq!(guard.bucket(), b);

    assert!(h.schedule(put(b, 100), 0));
    assert!(h.next_message(0, 0).is_none());
    drop(guard);
    assert!(h.next_message(0, 0).is_some());
}

#[test]
fn out_of_band_shared_locks_coexist() {
    let (h, _sender) = handler(1, 1);
    let b = bucket(0x500);
    let g1 = h.lock(b, 0, LockMode::Shared);
    let g2 = h.lock(b, 0, LockMode::Shared);
    drop(g1);
    drop(g2);
    // Table must be empty again: an exclusive lock is granted immediately.
    let start = Instant::now();
    let g3 = h.lock(b, 0, LockMode::Exclusive);
    assert!(start.elapsed() < Duration::from_millis(80));
    drop(g3);
}

#[test]
fn blocked_worker_wakes_on_release() {
    let (h, _sender) = handler(1, 1);
    h.set_next_message_timeout(Duration::from_secs(5));
    let b = bucket(0x600);
    assert!(h.schedule(put(b, 100), 0));
    assert!(h.schedule(put(b, 100), 0));
    let first = h.next_message(0, 0).expect("first write");

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let start = Instant::now();
            let locked = h.next_message(0, 0);
            (locked.is_some(), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(first.lock);
        let (got_message, waited) = waiter.join().expect("waiter thread");
        assert!(got_message, "release must wake the blocked worker");
        assert!(waited < Duration::from_secs(5), "woke before timeout");
    });
}

#[test]
fn blocked_worker_wakes_on_schedule() {
    let (h, _sender) = handler(1, 1);
    h.set_next_message_timeout(Duration::from_secs(5));
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| h.next_message(0, 0));
        std::thread::sleep(Duration::from_millis(50));
        assert!(h.schedule(put(bucket(0x700), 100), 0));
        let locked = waiter.join().expect("waiter thread");
        assert!(locked.is_some(), "schedule must wake the blocked worker");
    });
}

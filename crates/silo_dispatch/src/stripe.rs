//! Dispatch shard: one queue, one bucket lock table, one monitor.
//!
//! All queue and lock-table state lives behind a single mutex with an
//! associated condvar. Producers push under the monitor and broadcast;
//! workers scan the priority index under the monitor and leave with a
//! [`BucketLock`] installed. Dropping the lock handle is the
//! synchronization edge that publishes a worker's writes to the next
//! holder of the same bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use silo_api::{
    make_reply, next_message_id, AbortBucketOperations, BucketId, LockMode, MessageId,
    MessageSender, MessageType, ReturnCode, StorageMessage, StorageReply,
};

use crate::disk::DiskStateCell;
use crate::metrics::StripeMetrics;
use crate::queue::{MessageEntry, PriorityQueue, Seq};

const CONTENDED_LOCK_WAIT: Duration = Duration::from_millis(100);
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) const TIMEOUT_NOTE: &str = "message waited too long in storage queue";

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One lock holder. `msg_type` is absent for out-of-band control locks
/// taken via [`Stripe::lock`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct LockEntry {
    pub acquired_unix_secs: u64,
    pub priority: u8,
    pub msg_type: Option<MessageType>,
    pub msg_id: MessageId,
}

impl LockEntry {
    fn new(priority: u8, msg_type: Option<MessageType>, msg_id: MessageId) -> Self {
        LockEntry {
            acquired_unix_secs: now_unix_secs(),
            priority,
            msg_type,
            msg_id,
        }
    }
}

/// Lock state of one bucket: a single exclusive holder or any number of
/// shared holders keyed by message id, never both.
#[derive(Default)]
pub(crate) struct MultiLockEntry {
    exclusive: Option<LockEntry>,
    shared: HashMap<MessageId, LockEntry>,
}

pub(crate) struct StripeInner {
    pub(crate) queue: PriorityQueue,
    pub(crate) locks: HashMap<BucketId, MultiLockEntry>,
}

/// Whether a message requiring `mode` on `bucket` may run given the current
/// lock table. The null bucket never conflicts.
fn is_locked(locks: &HashMap<BucketId, MultiLockEntry>, bucket: BucketId, mode: LockMode) -> bool {
    if bucket.is_null() {
        return false;
    }
    let Some(entry) = locks.get(&bucket) else {
        return false;
    };
    if entry.exclusive.is_some() {
        return true;
    }
    // Shared holders stack; only an exclusive request conflicts with them.
    mode == LockMode::Exclusive && !entry.shared.is_empty()
}

fn timed_out_in_queue(message: &StorageMessage, waited: Duration) -> bool {
    // Replies must always be processed and cannot time out.
    !message.is_reply() && waited >= message.timeout()
}

pub struct Stripe {
    inner: Mutex<StripeInner>,
    cond: Condvar,
    disk_state: Arc<DiskStateCell>,
    paused: Arc<AtomicBool>,
    sender: Arc<dyn MessageSender>,
    metrics: Arc<StripeMetrics>,
}

impl Stripe {
    pub(crate) fn new(
        disk_state: Arc<DiskStateCell>,
        paused: Arc<AtomicBool>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Stripe {
            inner: Mutex::new(StripeInner {
                queue: PriorityQueue::new(),
                locks: HashMap::new(),
            }),
            cond: Condvar::new(),
            disk_state,
            paused,
            sender,
            metrics: Arc::new(StripeMetrics::new()),
        }
    }

    pub(crate) fn monitor(&self) -> MutexGuard<'_, StripeInner> {
        self.inner.lock().expect("stripe monitor poisoned")
    }

    pub(crate) fn metrics(&self) -> &StripeMetrics {
        &self.metrics
    }

    pub(crate) fn schedule(&self, entry: MessageEntry) -> bool {
        let mut inner = self.monitor();
        inner.queue.push(entry);
        self.cond.notify_all();
        true
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.monitor().queue.len()
    }

    pub(crate) fn broadcast(&self) {
        let _inner = self.monitor();
        self.cond.notify_all();
    }

    /// Dispatch scan. Blocks until a runnable message is found, the disk is
    /// closed or the handler paused, or `timeout` elapses. Entries that
    /// outlived their own queueing timeout are reaped during the scan and
    /// answered with TIMEOUT instead of being handed to a worker.
    pub(crate) fn next_message(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Option<LockedMessage> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.monitor();
        loop {
            if self.disk_state.is_closed() || self.paused.load(Ordering::Relaxed) {
                return None;
            }

            let mut chosen: Option<Seq> = None;
            let mut expired: Vec<Seq> = Vec::new();
            {
                let StripeInner { queue, locks } = &*inner;
                let now = Instant::now();
                for (seq, entry) in queue.priority_order() {
                    if timed_out_in_queue(&entry.message, now - entry.enqueued_at) {
                        expired.push(seq);
                        continue;
                    }
                    if !is_locked(locks, entry.bucket, entry.message.lock_mode()) {
                        chosen = Some(seq);
                        break;
                    }
                }
            }

            if !expired.is_empty() {
                let mut replies = Vec::with_capacity(expired.len());
                for seq in expired {
                    let entry = inner.queue.remove(seq).expect("expired entry vanished");
                    self.metrics.record_queue_timeout();
                    replies.push(make_reply(&entry.message, ReturnCode::Timeout, TIMEOUT_NOTE));
                }
                self.cond.notify_all();
                drop(inner);
                for reply in replies {
                    self.sender.send_reply(reply);
                }
                // The monitor was released while replying; any candidate
                // found above may have been taken. Rescan.
                inner = self.monitor();
                continue;
            }

            if let Some(seq) = chosen {
                let entry = inner.queue.remove(seq).expect("chosen entry vanished");
                let waited = entry.enqueued_at.elapsed();
                self.metrics.record_dispatch(waited);
                let lock = self.acquire(
                    &mut inner,
                    entry.bucket,
                    entry.message.lock_mode(),
                    entry.priority,
                    Some(entry.message.msg_type()),
                    entry.message.id(),
                );
                drop(inner);
                return Some(LockedMessage {
                    message: entry.message,
                    lock,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .expect("stripe monitor poisoned");
            inner = guard;
        }
    }

    /// Batched follow-up: hand out the oldest queued message for the bucket
    /// a worker already holds locked, keeping the same lock. Ends the batch
    /// (consuming the lock) when the bucket has no more work, the next
    /// entry needs a different lock mode, or the next entry timed out in
    /// queue.
    pub(crate) fn next_for_locked(&self, lock: BucketLock) -> Option<LockedMessage> {
        let mut inner = self.monitor();
        let Some(seq) = inner.queue.front_seq_for_bucket(lock.bucket()) else {
            drop(inner);
            return None;
        };
        // Batching never crosses lock requirement modes.
        let next_mode = inner
            .queue
            .get(seq)
            .expect("front entry vanished")
            .message
            .lock_mode();
        if next_mode != lock.lock_mode() {
            drop(inner);
            return None;
        }
        let entry = inner.queue.remove(seq).expect("front entry vanished");
        let waited = entry.enqueued_at.elapsed();
        self.cond.notify_all();
        if timed_out_in_queue(&entry.message, waited) {
            self.metrics.record_queue_timeout();
            drop(inner);
            self.sender
                .send_reply(make_reply(&entry.message, ReturnCode::Timeout, TIMEOUT_NOTE));
            return None;
        }
        self.metrics.record_dispatch(waited);
        drop(inner);
        Some(LockedMessage {
            message: entry.message,
            lock,
        })
    }

    /// Out-of-band bucket lock, independent of any queued message. Blocks
    /// until the requested mode is compatible with the current holders.
    pub(crate) fn lock(self: &Arc<Self>, bucket: BucketId, mode: LockMode) -> BucketLock {
        let mut inner = self.monitor();
        while is_locked(&inner.locks, bucket, mode) {
            debug!(bucket = %bucket, mode = %mode, "contending for bucket lock");
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(inner, CONTENDED_LOCK_WAIT)
                .expect("stripe monitor poisoned");
            inner = guard;
        }
        let lock = self.acquire(&mut inner, bucket, mode, u8::MAX, None, next_message_id());
        self.cond.notify_all();
        lock
    }

    /// Install a lock-table entry and build the owning handle. The caller
    /// must have verified compatibility under the same monitor guard; the
    /// asserts here are invariant enforcement, not flow control.
    fn acquire(
        self: &Arc<Self>,
        inner: &mut StripeInner,
        bucket: BucketId,
        mode: LockMode,
        priority: u8,
        msg_type: Option<MessageType>,
        msg_id: MessageId,
    ) -> BucketLock {
        if !bucket.is_null() {
            let slot = inner.locks.entry(bucket).or_default();
            assert!(
                slot.exclusive.is_none(),
                "bucket {bucket} already exclusively locked"
            );
            let entry = LockEntry::new(priority, msg_type, msg_id);
            match mode {
                LockMode::Exclusive => {
                    assert!(
                        slot.shared.is_empty(),
                        "bucket {bucket} has shared holders, cannot lock exclusively"
                    );
                    slot.exclusive = Some(entry);
                }
                LockMode::Shared => {
                    let prev = slot.shared.insert(msg_id, entry);
                    assert!(prev.is_none(), "duplicate shared lock for message {msg_id}");
                }
            }
            debug!(bucket = %bucket, msg_id, priority, mode = %mode, "locked bucket");
        }
        BucketLock {
            stripe: Arc::clone(self),
            bucket,
            msg_id,
            mode,
        }
    }

    /// Invoked from [`BucketLock::drop`]. Releasing a lock that is not in
    /// the table is a programming error and panics.
    pub(crate) fn release(&self, bucket: BucketId, mode: LockMode, msg_id: MessageId) {
        let mut inner = self.monitor();
        let entry = inner
            .locks
            .get_mut(&bucket)
            .unwrap_or_else(|| panic!("release of {bucket} which holds no locks"));
        match mode {
            LockMode::Exclusive => {
                let held = entry
                    .exclusive
                    .take()
                    .unwrap_or_else(|| panic!("exclusive release of {bucket} without holder"));
                assert_eq!(
                    held.msg_id, msg_id,
                    "exclusive release of {bucket} by wrong message"
                );
            }
            LockMode::Shared => {
                assert!(
                    entry.exclusive.is_none(),
                    "shared release of {bucket} while exclusively held"
                );
                entry
                    .shared
                    .remove(&msg_id)
                    .unwrap_or_else(|| panic!("shared release of {bucket} for unknown message"));
            }
        }
        if entry.exclusive.is_none() && entry.shared.is_empty() {
            inner.locks.remove(&bucket);
        }
        self.cond.notify_all();
    }

    /// Flush every queued entry for `bucket` with `code`. Active (locked)
    /// work is untouched. DeleteBucket entries stay queued: the bucket
    /// database has already been updated and the delete must reach the
    /// provider.
    pub(crate) fn fail_operations(&self, bucket: BucketId, code: ReturnCode, note: &str) {
        let mut inner = self.monitor();
        let mut replies = Vec::new();
        let mut removed = 0u64;
        for seq in inner.queue.bucket_seqs(bucket) {
            let keep = inner
                .queue
                .get(seq)
                .map(|e| e.message.msg_type() == MessageType::DeleteBucket)
                .unwrap_or(true);
            if keep {
                continue;
            }
            let entry = inner.queue.remove(seq).expect("indexed entry vanished");
            removed += 1;
            if !entry.message.is_reply() {
                replies.push(make_reply(&entry.message, code, note));
            }
        }
        if removed > 0 {
            self.metrics.record_failed(removed);
            self.cond.notify_all();
        }
        drop(inner);
        for reply in replies {
            self.sender.send_reply(reply);
        }
    }

    /// Drain the entire queue with `code`. Used when the owning disk leaves
    /// the OPEN state.
    pub(crate) fn fail_all(&self, code: ReturnCode, note: &str) {
        let mut inner = self.monitor();
        let mut replies = Vec::new();
        let seqs: Vec<Seq> = inner.queue.priority_order().map(|(seq, _)| seq).collect();
        for seq in seqs {
            let entry = inner.queue.remove(seq).expect("indexed entry vanished");
            self.metrics.record_failed(1);
            if !entry.message.is_reply() {
                replies.push(make_reply(&entry.message, code, note));
            }
        }
        self.cond.notify_all();
        drop(inner);
        for reply in replies {
            self.sender.send_reply(reply);
        }
    }

    /// Remove every queued entry the abort command matches and push the
    /// replies to send into `aborted`. Active work is left to finish; use
    /// [`Stripe::wait_inactive`] afterwards for a quiescent point.
    pub(crate) fn abort(&self, aborted: &mut Vec<StorageReply>, cmd: &AbortBucketOperations, note: &str) {
        let mut inner = self.monitor();
        let seqs: Vec<Seq> = inner
            .queue
            .priority_order()
            .filter(|(_, e)| e.message.may_be_aborted() && cmd.should_abort(e.bucket))
            .map(|(seq, _)| seq)
            .collect();
        if seqs.is_empty() {
            return;
        }
        self.metrics.record_aborted(seqs.len() as u64);
        for seq in seqs {
            let entry = inner.queue.remove(seq).expect("indexed entry vanished");
            aborted.push(make_reply(&entry.message, ReturnCode::Aborted, note));
        }
        self.cond.notify_all();
    }

    /// Block until no active (locked) bucket matches the abort command.
    pub(crate) fn wait_inactive(&self, cmd: &AbortBucketOperations) {
        let mut inner = self.monitor();
        while inner.locks.keys().any(|b| cmd.should_abort(*b)) {
            inner = self.cond.wait(inner).expect("stripe monitor poisoned");
        }
    }

    pub(crate) fn wait_until_no_locks(&self) {
        let mut inner = self.monitor();
        while !inner.locks.is_empty() {
            inner = self.cond.wait(inner).expect("stripe monitor poisoned");
        }
    }

    /// Block until both the queue and the lock table are empty.
    pub(crate) fn flush(&self) {
        let mut inner = self.monitor();
        while !(inner.queue.is_empty() && inner.locks.is_empty()) {
            debug!(
                queued = inner.queue.len(),
                locked = inner.locks.len(),
                "waiting for stripe to drain"
            );
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(inner, FLUSH_POLL_INTERVAL)
                .expect("stripe monitor poisoned");
            inner = guard;
        }
    }

    pub(crate) fn queue_snapshot(&self) -> Vec<QueuedEntrySnapshot> {
        let inner = self.monitor();
        inner
            .queue
            .priority_order()
            .map(|(_, e)| QueuedEntrySnapshot {
                bucket: e.bucket,
                msg_type: e.message.msg_type(),
                msg_id: e.message.id(),
                priority: e.priority,
                waited_ms: e.enqueued_at.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
            })
            .collect()
    }

    pub(crate) fn lock_snapshot(&self) -> Vec<HeldLockSnapshot> {
        let inner = self.monitor();
        let mut held = Vec::new();
        for (bucket, entry) in &inner.locks {
            if let Some(excl) = &entry.exclusive {
                held.push(HeldLockSnapshot::new(*bucket, LockMode::Exclusive, excl));
            }
            for shared in entry.shared.values() {
                held.push(HeldLockSnapshot::new(*bucket, LockMode::Shared, shared));
            }
        }
        held.sort_by_key(|h| (h.bucket, h.msg_id));
        held
    }
}

/// Scoped bucket lock handed to a worker. Dropping it releases the lock and
/// wakes the stripe. Movable, not clonable: the handle is the single proof
/// that the operation is in flight.
pub struct BucketLock {
    stripe: Arc<Stripe>,
    bucket: BucketId,
    msg_id: MessageId,
    mode: LockMode,
}

impl BucketLock {
    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }

    pub(crate) fn stripe(&self) -> &Arc<Stripe> {
        &self.stripe
    }
}

impl Drop for BucketLock {
    fn drop(&mut self) {
        if !self.bucket.is_null() {
            self.stripe.release(self.bucket, self.mode, self.msg_id);
            debug!(bucket = %self.bucket, msg_id = self.msg_id, mode = %self.mode, "unlocked bucket");
        }
    }
}

/// A dispatched message together with the bucket lock that protects it.
pub struct LockedMessage {
    pub message: StorageMessage,
    pub lock: BucketLock,
}

/// One queued entry as seen by the status page.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEntrySnapshot {
    pub bucket: BucketId,
    pub msg_type: MessageType,
    pub msg_id: MessageId,
    pub priority: u8,
    pub waited_ms: u64,
}

/// One held lock as seen by the status page.
#[derive(Debug, Clone, Serialize)]
pub struct HeldLockSnapshot {
    pub bucket: BucketId,
    pub mode: LockMode,
    pub msg_type: Option<MessageType>,
    pub msg_id: MessageId,
    pub priority: u8,
    pub acquired_unix_secs: u64,
}

impl HeldLockSnapshot {
    fn new(bucket: BucketId, mode: LockMode, entry: &LockEntry) -> Self {
        HeldLockSnapshot {
            bucket,
            mode,
            msg_type: entry.msg_type,
            msg_id: entry.msg_id,
            priority: entry.priority,
            acquired_unix_secs: entry.acquired_unix_secs,
        }
    }
}

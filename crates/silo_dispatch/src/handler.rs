//! Top-level dispatch facade.
//!
//! Owns every disk, routes scheduled messages to the right stripe, and
//! implements the cross-stripe operations: pause/resume, close, queue
//! remapping on bucket split/join/move, abort, and merge-status tracking.
//!
//! Lock hierarchy: at most one stripe monitor is held at a time, except in
//! [`DispatchHandler::remap_queue`] which takes all participating stripe
//! monitors in ascending address order. The pause monitor and the merge
//! map mutex are independent and never held while entering a stripe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, ensure};
use tracing::{debug, warn};

use silo_api::{
    make_reply, AbortBucketOperations, BucketId, BucketIdFactory, LockMode, MessageSender,
    MessageType, PartitionStateList, ReturnCode, StorageMessage, StorageReply,
};

use crate::disk::{Disk, DiskState};
use crate::merge::MergeStatus;
use crate::metrics::{DiskMetricsSnapshot, HandlerMetricsSnapshot, StripeMetricsSnapshot};
use crate::stripe::{BucketLock, LockedMessage, Stripe};
use crate::DispatchConfig;

const PAUSE_RECHECK_WAIT: Duration = Duration::from_millis(100);

const ABORT_NOTE: &str =
    "sending distributor no longer owns the bucket the operation was bound to, \
     or the storage node is going down";
const SHUTDOWN_NOTE: &str = "storage node is shutting down";
const DISK_DISABLED_NOTE: &str = "disk disabled";

/// Which bucket-tree operation a queue remap accompanies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RemapOp {
    Move,
    Split,
    Join,
}

fn split_or_join(op: RemapOp) -> &'static str {
    match op {
        RemapOp::Join => "bucket was just joined",
        _ => "bucket was just split",
    }
}

/// Source or target of a queue remap. `found_in_queue` is set on the target
/// a split remap actually routed entries to, so the caller knows which
/// children received pending work.
#[derive(Clone, Copy, Debug)]
pub struct RemapInfo {
    pub bucket: BucketId,
    pub disk: usize,
    pub found_in_queue: bool,
}

impl RemapInfo {
    pub fn new(bucket: BucketId, disk: usize) -> Self {
        RemapInfo {
            bucket,
            disk,
            found_in_queue: false,
        }
    }
}

enum Disposition {
    Requeue {
        bucket: BucketId,
        disk: usize,
    },
    Fail {
        code: ReturnCode,
        note: &'static str,
        clear_merge: bool,
    },
    Drop,
}

pub struct DispatchHandler {
    disks: Vec<Disk>,
    sender: Arc<dyn MessageSender>,
    factory: Arc<dyn BucketIdFactory>,
    merges: Mutex<HashMap<BucketId, MergeStatus>>,
    paused: Arc<AtomicBool>,
    pause_gate: Mutex<()>,
    pause_cond: Condvar,
    next_message_timeout_ms: AtomicU64,
}

impl DispatchHandler {
    pub fn new(
        config: &DispatchConfig,
        partitions: &PartitionStateList,
        sender: Arc<dyn MessageSender>,
        factory: Arc<dyn BucketIdFactory>,
    ) -> anyhow::Result<Self> {
        ensure!(!partitions.is_empty(), "no disks configured");
        ensure!(
            config.stripes_per_disk > 0,
            "stripes_per_disk must be positive"
        );
        let paused = Arc::new(AtomicBool::new(false));
        let disks = partitions
            .iter()
            .map(|p| {
                let initial = if p.up {
                    DiskState::Open
                } else {
                    DiskState::DisabledByMaintenance
                };
                Disk::new(
                    config.stripes_per_disk,
                    initial,
                    Arc::clone(&paused),
                    Arc::clone(&sender),
                )
            })
            .collect();
        debug!(
            disks = partitions.len(),
            stripes_per_disk = config.stripes_per_disk,
            "dispatch handler initialized"
        );
        Ok(DispatchHandler {
            disks,
            sender,
            factory,
            merges: Mutex::new(HashMap::new()),
            paused,
            pause_gate: Mutex::new(()),
            pause_cond: Condvar::new(),
            next_message_timeout_ms: AtomicU64::new(config.next_message_timeout.as_millis() as u64),
        })
    }

    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    pub fn stripe_count(&self, disk: usize) -> usize {
        self.disks[disk].stripe_count()
    }

    /// Which stripe a bucket routes to on a disk. Pure in the bucket and the
    /// stripe count; exposed so workers and tests can reason about routing.
    pub fn stripe_index(&self, disk: usize, bucket: BucketId) -> usize {
        self.disks[disk].stripe_index(bucket)
    }

    /// Round-robin starting stripe for a worker with no preference. Workers
    /// should still iterate all stripes before blocking so a full stripe is
    /// never starved behind an empty preferred one.
    pub fn next_stripe_id(&self, disk: usize) -> usize {
        self.disks[disk].next_stripe_id()
    }

    pub fn set_next_message_timeout(&self, timeout: Duration) {
        self.next_message_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn next_message_timeout(&self) -> Duration {
        Duration::from_millis(self.next_message_timeout_ms.load(Ordering::Relaxed))
    }

    /// Enqueue a message on `disk`. Returns false (after emitting the
    /// rejection reply) when the disk is not open.
    pub fn schedule(&self, message: StorageMessage, disk: usize) -> bool {
        assert!(disk < self.disks.len(), "disk index {disk} out of range");
        match self.disks[disk].schedule(message) {
            Ok(()) => true,
            Err(message) => {
                let state = self.disks[disk].state();
                let (code, note) = match state {
                    DiskState::DisabledByMaintenance => {
                        (ReturnCode::DiskFailure, DISK_DISABLED_NOTE)
                    }
                    _ => (ReturnCode::Rejected, SHUTDOWN_NOTE),
                };
                debug!(
                    message = %message,
                    disk,
                    state = state.name(),
                    "rejecting schedule on unavailable disk"
                );
                if !message.is_reply() {
                    self.sender.send_reply(make_reply(&message, code, note));
                }
                false
            }
        }
    }

    /// Worker entry point: the highest-priority runnable message on the
    /// given stripe, with its bucket lock already held. Returns `None` on
    /// timeout, pause, or disk close; the worker run loop uses that to
    /// register ticks.
    pub fn next_message(&self, disk: usize, stripe_id: usize) -> Option<LockedMessage> {
        assert!(disk < self.disks.len(), "disk index {disk} out of range");
        if !self.try_handle_pause(disk) {
            return None; // Still paused; let the worker tick.
        }
        self.disks[disk].next_message(stripe_id, self.next_message_timeout())
    }

    /// Batched follow-up under a lock the worker already holds: the oldest
    /// queued message for the same bucket, if its lock mode matches.
    /// Consumes (releases) the lock otherwise.
    pub fn next_message_for(&self, disk: usize, lock: BucketLock) -> Option<LockedMessage> {
        assert!(disk < self.disks.len(), "disk index {disk} out of range");
        if self.disks[disk].state() == DiskState::Closed {
            return None;
        }
        let stripe = Arc::clone(lock.stripe());
        stripe.next_for_locked(lock)
    }

    /// Out-of-band bucket lock for work that does not flow through the
    /// queue (external bucket manipulation). Blocks until compatible.
    pub fn lock(&self, bucket: BucketId, disk: usize, mode: LockMode) -> BucketLock {
        assert!(disk < self.disks.len(), "disk index {disk} out of range");
        Stripe::lock(self.disks[disk].stripe_of(bucket), bucket, mode)
    }

    /// Flush every queued operation for `bucket` with `code`. Active work
    /// is not touched.
    pub fn fail_operations(&self, bucket: BucketId, disk: usize, code: ReturnCode, note: &str) {
        assert!(disk < self.disks.len(), "disk index {disk} out of range");
        self.disks[disk]
            .stripe_of(bucket)
            .fail_operations(bucket, code, note);
    }

    /// Flush queued operations matching the abort command, then wait for
    /// matching active operations to drain. Two passes so disk threads can
    /// finish running operations in parallel with the queue sweep.
    pub fn abort_queued_operations(&self, cmd: &AbortBucketOperations) {
        let mut aborted = Vec::new();
        for disk in &self.disks {
            disk.abort(&mut aborted, cmd, ABORT_NOTE);
        }
        for reply in aborted {
            self.sender.send_reply(reply);
        }
        for disk in &self.disks {
            disk.wait_inactive(cmd);
        }
    }

    pub fn disk_state(&self, disk: usize) -> DiskState {
        self.disks[disk].state()
    }

    /// Transition a disk. Leaving OPEN fails everything still queued:
    /// NOT_READY on close, DISK_FAILURE on maintenance-disable. Upstream
    /// retries re-drive the work once the disk is back.
    pub fn set_disk_state(&self, disk: usize, state: DiskState) {
        assert!(disk < self.disks.len(), "disk index {disk} out of range");
        let d = &self.disks[disk];
        d.set_state(state);
        match state {
            DiskState::Open => {}
            DiskState::DisabledByMaintenance => d.fail_all(ReturnCode::DiskFailure, DISK_DISABLED_NOTE),
            DiskState::Closed => d.fail_all(ReturnCode::NotReady, SHUTDOWN_NOTE),
        }
        d.broadcast();
    }

    /// Close every disk and wake all blocked workers so they observe the
    /// CLOSED state and exit.
    pub fn close(&self) {
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.state() == DiskState::Open {
                debug!(disk = i, "open -> closed");
                self.set_disk_state(i, DiskState::Closed);
            } else {
                disk.broadcast();
            }
        }
    }

    /// Block until every queue and lock table is empty. With
    /// `kill_pending_merges` every tracked merge is failed with ABORTED and
    /// its parked replies are sent.
    pub fn flush(&self, kill_pending_merges: bool) {
        for (i, disk) in self.disks.iter().enumerate() {
            debug!(disk = i, "waiting for queues and bucket locks to drain");
            disk.flush();
        }
        if kill_pending_merges {
            let drained: Vec<MergeStatus> = {
                let mut merges = self.merges.lock().expect("merge map mutex poisoned");
                merges.drain().map(|(_, status)| status).collect()
            };
            for mut status in drained {
                for mut reply in status.take_pending() {
                    reply.set_result(ReturnCode::Aborted, SHUTDOWN_NOTE);
                    self.sender.send_reply(reply);
                }
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.disks.iter().map(|d| d.queue_len()).sum()
    }

    pub fn queue_len_disk(&self, disk: usize) -> usize {
        self.disks[disk].queue_len()
    }

    /// Process-wide dispatch gate for coordinated maintenance. Workers
    /// block on the pause monitor before consulting stripes; the returned
    /// guard resumes on drop. Does not return until in-flight work has
    /// drained.
    pub fn pause(&self) -> ResumeGuard<'_> {
        self.paused.store(true, Ordering::Relaxed);
        for disk in &self.disks {
            disk.wait_until_no_locks();
        }
        ResumeGuard { handler: self }
    }

    fn resume(&self) {
        let _gate = self.pause_gate.lock().expect("pause monitor poisoned");
        self.paused.store(false, Ordering::Relaxed);
        self.pause_cond.notify_all();
    }

    /// No data or synchronization dependencies ride on the pause flag, so
    /// relaxed reads suffice.
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// When paused, wait a single bounded interval for a resume, then
    /// re-check. Returning false lets the worker tick instead of camping on
    /// the pause monitor.
    fn try_handle_pause(&self, disk: usize) -> bool {
        if !self.is_paused() {
            return true;
        }
        if self.disks[disk].state() != DiskState::Closed {
            let gate = self.pause_gate.lock().expect("pause monitor poisoned");
            if self.is_paused() {
                let _unused = self
                    .pause_cond
                    .wait_timeout(gate, PAUSE_RECHECK_WAIT)
                    .expect("pause monitor poisoned");
            }
        }
        !self.is_paused()
    }

    // ---- merge status tracking -------------------------------------------

    pub fn add_merge_status(&self, bucket: BucketId, status: MergeStatus) {
        let mut merges = self.merges.lock().expect("merge map mutex poisoned");
        if merges.insert(bucket, status).is_some() {
            warn!(bucket = %bucket, "a merge status already existed, overwriting");
        }
    }

    /// Access the merge status for `bucket` under the merge-map mutex.
    /// Errors if no merge is tracked for the bucket.
    pub fn edit_merge_status<R>(
        &self,
        bucket: BucketId,
        edit: impl FnOnce(&mut MergeStatus) -> R,
    ) -> anyhow::Result<R> {
        let mut merges = self.merges.lock().expect("merge map mutex poisoned");
        match merges.get_mut(&bucket) {
            Some(status) => Ok(edit(status)),
            None => bail!("no merge state exists for {bucket}"),
        }
    }

    pub fn is_merging(&self, bucket: BucketId) -> bool {
        self.merges
            .lock()
            .expect("merge map mutex poisoned")
            .contains_key(&bucket)
    }

    pub fn active_merge_count(&self) -> usize {
        self.merges.lock().expect("merge map mutex poisoned").len()
    }

    /// Remove a tracked merge. With `fail_with` set, every parked reply is
    /// stamped with the code and sent; without it the replies are dropped
    /// (the merge handler already answered them).
    pub fn clear_merge_status(&self, bucket: BucketId, fail_with: Option<ReturnCode>) {
        let status = {
            let mut merges = self.merges.lock().expect("merge map mutex poisoned");
            merges.remove(&bucket)
        };
        let Some(mut status) = status else {
            debug!(bucket = %bucket, "no merge state to clear");
            return;
        };
        if let Some(code) = fail_with {
            for mut reply in status.take_pending() {
                debug!(bucket = %bucket, code = %code, "aborting merge, replying to parked stage");
                reply.set_result(code, "merge aborted");
                self.sender.send_reply(reply);
            }
        }
    }

    // ---- remap on split/join/move ----------------------------------------

    /// Re-route every queued entry for the source bucket after a bucket-tree
    /// operation: one target for MOVE and JOIN, two for SPLIT. Locked
    /// (in-flight) messages are never touched; abort them first if needed.
    pub fn remap_queue(&self, source: RemapInfo, targets: &mut [RemapInfo], op: RemapOp) {
        let expected = match op {
            RemapOp::Split => 2,
            RemapOp::Move | RemapOp::Join => 1,
        };
        assert_eq!(
            targets.len(),
            expected,
            "{op:?} remap takes {expected} target(s)"
        );
        assert!(source.disk < self.disks.len(), "source disk out of range");
        for t in targets.iter() {
            assert!(t.disk < self.disks.len(), "target disk out of range");
        }

        let src_stripe = Arc::clone(self.disks[source.disk].stripe_of(source.bucket));
        let mut participants: Vec<Arc<Stripe>> = vec![Arc::clone(&src_stripe)];
        for t in targets.iter() {
            if !t.bucket.is_null() {
                participants.push(Arc::clone(self.disks[t.disk].stripe_of(t.bucket)));
            }
        }
        // Source and target stripes may coincide; dedup, then take the
        // monitors in ascending address order so concurrent remaps cannot
        // deadlock.
        participants.sort_by_key(|s| Arc::as_ptr(s) as usize);
        participants.dedup_by(|a, b| Arc::ptr_eq(a, b));
        let mut guards: Vec<_> = participants.iter().map(|s| s.monitor()).collect();
        let guard_index = |stripe: &Arc<Stripe>| -> usize {
            participants
                .iter()
                .position(|s| Arc::ptr_eq(s, stripe))
                .expect("remap target stripe not in lock set")
        };

        let drained = guards[guard_index(&src_stripe)]
            .queue
            .take_bucket(source.bucket);

        let mut replies = Vec::new();
        let mut clear_merge = false;
        let mut failed = 0u64;
        for mut entry in drained {
            match remap_message(&entry.message, &source, targets, op, self.factory.as_ref()) {
                Disposition::Requeue { bucket, disk } => {
                    debug!(
                        message = %entry.message,
                        new_bucket = %bucket,
                        disk,
                        "remapping queued operation"
                    );
                    entry.message.remap_bucket(bucket);
                    entry.bucket = bucket;
                    let stripe = self.disks[disk].stripe_of(bucket);
                    guards[guard_index(stripe)].queue.push(entry);
                }
                Disposition::Fail {
                    code,
                    note,
                    clear_merge: clear,
                } => {
                    debug!(message = %entry.message, code = %code, "failing queued operation during remap");
                    clear_merge |= clear;
                    failed += 1;
                    if !entry.message.is_reply() {
                        replies.push(make_reply(&entry.message, code, note));
                    }
                }
                Disposition::Drop => {
                    debug!(message = %entry.message, "dropping bucket info refresh during remap");
                }
            }
        }
        drop(guards);
        if failed > 0 {
            src_stripe.metrics().record_failed(failed);
        }
        for stripe in &participants {
            stripe.broadcast();
        }
        if clear_merge {
            self.clear_merge_status(source.bucket, Some(ReturnCode::BucketDeleted));
        }
        for reply in replies {
            self.sender.send_reply(reply);
        }
    }

    // ---- plumbing ----------------------------------------------------------

    pub(crate) fn disks(&self) -> &[Disk] {
        &self.disks
    }

    /// (bucket, seconds since the merge started) for every tracked merge.
    pub(crate) fn merge_summaries(&self) -> Vec<(BucketId, u64)> {
        let merges = self.merges.lock().expect("merge map mutex poisoned");
        let mut out: Vec<(BucketId, u64)> = merges
            .iter()
            .map(|(bucket, status)| (*bucket, status.started.elapsed().as_secs()))
            .collect();
        out.sort_by_key(|(bucket, _)| *bucket);
        out
    }

    pub fn get_status(&self, path: &str) -> String {
        crate::status::render(self, path)
    }

    pub fn dump_queue(&self, disk: usize) -> String {
        crate::status::dump_queue(&self.disks[disk])
    }

    pub fn metrics(&self) -> HandlerMetricsSnapshot {
        let disks = self
            .disks
            .iter()
            .map(|d| {
                let stripes: Vec<StripeMetricsSnapshot> = d
                    .stripes()
                    .iter()
                    .map(|s| s.metrics().snapshot())
                    .collect();
                let mut totals = StripeMetricsSnapshot::default();
                for s in &stripes {
                    totals.merge(s);
                }
                DiskMetricsSnapshot {
                    queue_len: d.queue_len(),
                    totals,
                    stripes,
                }
            })
            .collect();
        HandlerMetricsSnapshot {
            pending_merges: self.active_merge_count(),
            disks,
        }
    }
}

impl MessageSender for DispatchHandler {
    fn send_reply(&self, reply: StorageReply) {
        self.sender.send_reply(reply);
    }

    fn send_command(&self, command: StorageMessage) {
        self.sender.send_command(command);
    }
}

/// Clears the pause gate and wakes blocked workers when dropped.
pub struct ResumeGuard<'a> {
    handler: &'a DispatchHandler,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        self.handler.resume();
    }
}

/// Decide where one queued entry goes after a bucket-tree operation. The
/// full policy is per message type: document operations follow their
/// document, merge traffic is torn down unless simply moved, bucket
/// lifecycle commands stay with the source, info refreshes are dropped.
fn remap_message(
    msg: &StorageMessage,
    source: &RemapInfo,
    targets: &mut [RemapInfo],
    op: RemapOp,
    factory: &dyn BucketIdFactory,
) -> Disposition {
    use MessageType::*;
    match msg.msg_type() {
        Put | Update | Remove | Get => match op {
            RemapOp::Split => match target_for_document(msg, targets, factory) {
                Some(idx) => {
                    targets[idx].found_in_queue = true;
                    Disposition::Requeue {
                        bucket: targets[idx].bucket,
                        disk: targets[idx].disk,
                    }
                }
                None => Disposition::Fail {
                    code: ReturnCode::BucketNotFound,
                    note: "document belongs to neither child after split",
                    clear_merge: false,
                },
            },
            RemapOp::Move | RemapOp::Join => Disposition::Requeue {
                bucket: targets[0].bucket,
                disk: targets[0].disk,
            },
        },
        MergeBucket | GetBucketDiff | GetBucketDiffReply | ApplyBucketDiff
        | ApplyBucketDiffReply => match op {
            RemapOp::Move => Disposition::Requeue {
                bucket: targets[0].bucket,
                disk: targets[0].disk,
            },
            // A merge cannot be remapped; tear it down so the distributor
            // restarts it against the new buckets.
            RemapOp::Split | RemapOp::Join => Disposition::Fail {
                code: ReturnCode::BucketDeleted,
                note: split_or_join(op),
                clear_merge: true,
            },
        },
        SplitBucket => match op {
            RemapOp::Move => Disposition::Requeue {
                bucket: targets[0].bucket,
                disk: targets[0].disk,
            },
            RemapOp::Split => Disposition::Fail {
                code: ReturnCode::BucketDeleted,
                note: "bucket split while operation enqueued",
                clear_merge: false,
            },
            RemapOp::Join => Disposition::Fail {
                code: ReturnCode::BucketDeleted,
                note: "bucket was just joined",
                clear_merge: false,
            },
        },
        Stat | Revert | RemoveLocation | SetBucketState => match op {
            RemapOp::Move => Disposition::Requeue {
                bucket: targets[0].bucket,
                disk: targets[0].disk,
            },
            RemapOp::Split => Disposition::Fail {
                code: ReturnCode::BucketNotFound,
                note: "bucket was just split",
                clear_merge: false,
            },
            RemapOp::Join => Disposition::Fail {
                code: ReturnCode::BucketDeleted,
                note: "bucket was just joined",
                clear_merge: false,
            },
        },
        // Already reflected in the bucket database when scheduled; they
        // follow a move and otherwise stay with the source bucket.
        CreateBucket | DeleteBucket | JoinBuckets => match op {
            RemapOp::Move => Disposition::Requeue {
                bucket: targets[0].bucket,
                disk: targets[0].disk,
            },
            RemapOp::Split | RemapOp::Join => Disposition::Requeue {
                bucket: source.bucket,
                disk: source.disk,
            },
        },
        // Info refreshes are re-driven by the bucket database owner; there
        // is nothing useful to route.
        ReadBucketInfo | RecheckBucketInfo => Disposition::Drop,
    }
}

/// Index of the target whose bucket contains the message's document, if the
/// message carries one.
fn target_for_document(
    msg: &StorageMessage,
    targets: &[RemapInfo],
    factory: &dyn BucketIdFactory,
) -> Option<usize> {
    let doc = msg.document()?;
    let location = factory.bucket_of(doc);
    targets
        .iter()
        .position(|t| !t.bucket.is_null() && t.bucket.contains(location))
}

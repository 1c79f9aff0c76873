//! One dispatch unit per backing disk: a fixed vector of stripes plus the
//! disk state gate.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use silo_api::{AbortBucketOperations, BucketId, MessageSender, ReturnCode, StorageMessage, StorageReply};

use crate::queue::MessageEntry;
use crate::stripe::{LockedMessage, Stripe};

/// 64-bit FNV-1 prime. Bucket ids have strongly biased bits (the used-bit
/// count sits in the high bits and sibling structure in the low bits), so a
/// raw modulo would cluster adjacent siblings on the same stripe;
/// multiplying by the prime disperses them first.
const STRIPE_DISPERSION_PRIME: u64 = 1_099_511_628_211;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[repr(u8)]
pub enum DiskState {
    Open = 0,
    DisabledByMaintenance = 1,
    Closed = 2,
}

impl DiskState {
    pub fn name(self) -> &'static str {
        match self {
            DiskState::Open => "OPEN",
            DiskState::DisabledByMaintenance => "DISABLED_BY_MAINTENANCE",
            DiskState::Closed => "CLOSED",
        }
    }
}

/// Disk state shared between the disk and its stripes. Loads and stores are
/// relaxed; no happens-before assumptions should be made around them.
/// Writers that need causality (close-then-broadcast) re-establish it under
/// the stripe monitors via the broadcast itself.
pub(crate) struct DiskStateCell(AtomicU8);

impl DiskStateCell {
    pub(crate) fn new(state: DiskState) -> Self {
        DiskStateCell(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> DiskState {
        match self.0.load(Ordering::Relaxed) {
            0 => DiskState::Open,
            1 => DiskState::DisabledByMaintenance,
            _ => DiskState::Closed,
        }
    }

    pub(crate) fn set(&self, state: DiskState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.get() == DiskState::Closed
    }
}

pub(crate) struct Disk {
    state: Arc<DiskStateCell>,
    stripes: Vec<Arc<Stripe>>,
    next_stripe: AtomicU32,
}

impl Disk {
    pub(crate) fn new(
        stripe_count: usize,
        initial: DiskState,
        paused: Arc<AtomicBool>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        assert!(stripe_count > 0, "disk needs at least one stripe");
        let state = Arc::new(DiskStateCell::new(initial));
        let stripes = (0..stripe_count)
            .map(|_| {
                Arc::new(Stripe::new(
                    Arc::clone(&state),
                    Arc::clone(&paused),
                    Arc::clone(&sender),
                ))
            })
            .collect();
        Disk {
            state,
            stripes,
            next_stripe: AtomicU32::new(0),
        }
    }

    pub(crate) fn state(&self) -> DiskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: DiskState) {
        self.state.set(state);
    }

    pub(crate) fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub(crate) fn stripe_index(&self, bucket: BucketId) -> usize {
        let dispersed = bucket.raw().wrapping_mul(STRIPE_DISPERSION_PRIME);
        (dispersed % self.stripes.len() as u64) as usize
    }

    pub(crate) fn stripe_of(&self, bucket: BucketId) -> &Arc<Stripe> {
        &self.stripes[self.stripe_index(bucket)]
    }

    pub(crate) fn stripes(&self) -> &[Arc<Stripe>] {
        &self.stripes
    }

    /// Round-robin starting point for workers with no stripe preference.
    pub(crate) fn next_stripe_id(&self) -> usize {
        self.next_stripe.fetch_add(1, Ordering::Relaxed) as usize % self.stripes.len()
    }

    /// Refuses with the message handed back when the disk is not open; the
    /// handler turns that into a rejection reply.
    pub(crate) fn schedule(&self, message: StorageMessage) -> Result<(), StorageMessage> {
        if self.state() != DiskState::Open {
            return Err(message);
        }
        let entry = MessageEntry::new(message);
        self.stripe_of(entry.bucket).schedule(entry);
        Ok(())
    }

    pub(crate) fn next_message(&self, stripe_id: usize, timeout: Duration) -> Option<LockedMessage> {
        assert!(
            stripe_id < self.stripes.len(),
            "stripe id {stripe_id} out of range ({} stripes)",
            self.stripes.len()
        );
        Stripe::next_message(&self.stripes[stripe_id], timeout)
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.stripes.iter().map(|s| s.queue_len()).sum()
    }

    pub(crate) fn broadcast(&self) {
        for stripe in &self.stripes {
            stripe.broadcast();
        }
    }

    pub(crate) fn flush(&self) {
        for stripe in &self.stripes {
            stripe.flush();
        }
    }

    pub(crate) fn fail_all(&self, code: ReturnCode, note: &str) {
        for stripe in &self.stripes {
            stripe.fail_all(code, note);
        }
    }

    pub(crate) fn abort(
        &self,
        aborted: &mut Vec<StorageReply>,
        cmd: &AbortBucketOperations,
        note: &str,
    ) {
        for stripe in &self.stripes {
            stripe.abort(aborted, cmd, note);
        }
    }

    pub(crate) fn wait_inactive(&self, cmd: &AbortBucketOperations) {
        for stripe in &self.stripes {
            stripe.wait_inactive(cmd);
        }
    }

    pub(crate) fn wait_until_no_locks(&self) {
        for stripe in &self.stripes {
            stripe.wait_until_no_locks();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_api::StorageReply;

    struct NullSender;
    impl MessageSender for NullSender {
        fn send_reply(&self, _reply: StorageReply) {}
        fn send_command(&self, _command: StorageMessage) {}
    }

    fn disk(stripes: usize) -> Disk {
        Disk::new(
            stripes,
            DiskState::Open,
            Arc::new(AtomicBool::new(false)),
            Arc::new(NullSender),
        )
    }

    #[test]
    fn stripe_routing_is_stable() {
        let d = disk(7);
        let bucket = BucketId::new(20, 0x5a5a5);
        let first = d.stripe_index(bucket);
        for _ in 0..100 {
            assert_eq!(d.stripe_index(bucket), first);
        }
    }

    #[test]
    fn sibling_buckets_do_not_all_cluster() {
        // Sibling structure lives in the low bits; without dispersion every
        // even/odd sibling pair would land on the same two stripes.
        let d = disk(8);
        let parent = BucketId::new(16, 0x1234);
        let mut seen = std::collections::HashSet::new();
        let mut bucket = parent;
        for _ in 0..16 {
            let (left, right) = bucket.split();
            seen.insert(d.stripe_index(left));
            seen.insert(d.stripe_index(right));
            bucket = left;
        }
        assert!(seen.len() > 2, "dispersion left siblings clustered: {seen:?}");
    }

    #[test]
    fn round_robin_hint_cycles_all_stripes() {
        let d = disk(4);
        let ids: Vec<usize> = (0..8).map(|_| d.next_stripe_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn schedule_refused_when_not_open() {
        let d = disk(2);
        d.set_state(DiskState::Closed);
        let msg = StorageMessage::new(
            silo_api::MessageType::Put,
            BucketId::new(8, 1),
            100,
            Duration::from_secs(1),
        );
        assert!(d.schedule(msg).is_err());
    }
}

//! Per-stripe pending-message container, indexed three ways: insertion
//! order, (priority, insertion) order, and by bucket.
//!
//! Entries are stored once in a sequence-keyed map; the two auxiliary
//! indexes hold sequence numbers only. The dispatch scan walks the priority
//! index ascending, so equal-priority entries come out in insertion order.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use silo_api::{BucketId, StorageMessage};

/// Monotonic per-queue insertion sequence number.
pub(crate) type Seq = u64;

/// A pending message together with the routing state the queue indexes on.
/// `bucket` and `priority` are denormalized from the message so remapping
/// can rewrite the routing bucket in one place.
#[derive(Debug)]
pub struct MessageEntry {
    pub message: StorageMessage,
    pub bucket: BucketId,
    pub priority: u8,
    pub enqueued_at: Instant,
}

impl MessageEntry {
    pub fn new(message: StorageMessage) -> Self {
        let bucket = message.bucket();
        let priority = message.priority();
        MessageEntry {
            message,
            bucket,
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    next_seq: Seq,
    entries: HashMap<Seq, MessageEntry>,
    by_priority: BTreeSet<(u8, Seq)>,
    by_bucket: HashMap<BucketId, BTreeSet<Seq>>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: MessageEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_priority.insert((entry.priority, seq));
        self.by_bucket.entry(entry.bucket).or_default().insert(seq);
        self.entries.insert(seq, entry);
    }

    pub(crate) fn get(&self, seq: Seq) -> Option<&MessageEntry> {
        self.entries.get(&seq)
    }

    /// Iterate entries in dispatch order: ascending priority, insertion
    /// order within a priority.
    pub(crate) fn priority_order(&self) -> impl Iterator<Item = (Seq, &MessageEntry)> + '_ {
        self.by_priority
            .iter()
            .map(move |&(_, seq)| (seq, &self.entries[&seq]))
    }

    pub(crate) fn remove(&mut self, seq: Seq) -> Option<MessageEntry> {
        let entry = self.entries.remove(&seq)?;
        self.by_priority.remove(&(entry.priority, seq));
        if let Some(seqs) = self.by_bucket.get_mut(&entry.bucket) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.by_bucket.remove(&entry.bucket);
            }
        }
        Some(entry)
    }

    /// Sequence numbers of all entries for `bucket`, oldest first.
    pub(crate) fn bucket_seqs(&self, bucket: BucketId) -> Vec<Seq> {
        self.by_bucket
            .get(&bucket)
            .map(|seqs| seqs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Oldest queued entry for `bucket`, if any.
    pub(crate) fn front_seq_for_bucket(&self, bucket: BucketId) -> Option<Seq> {
        self.by_bucket
            .get(&bucket)
            .and_then(|seqs| seqs.iter().next().copied())
    }

    /// Remove and return every entry for `bucket`, oldest first.
    pub(crate) fn take_bucket(&mut self, bucket: BucketId) -> Vec<MessageEntry> {
        self.bucket_seqs(bucket)
            .into_iter()
            .filter_map(|seq| self.remove(seq))
            .collect()
    }
}

//! Storage messages as seen by the dispatch layer.
//!
//! The dispatch core never looks inside message payloads; it only needs the
//! routing bucket, the priority, the queueing timeout, the optional document
//! id (for split remapping) and the per-type properties exposed here.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bucket::{BucketId, DocumentId};

/// Process-unique message identifier.
pub type MessageId = u64;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh process-unique message id. Also used for out-of-band
/// bucket locks so every live lock entry has a distinct id.
pub fn next_message_id() -> MessageId {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lock mode a message requires on its bucket while executing.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum LockMode {
    /// Sole holder; required by anything that modifies bucket state.
    Exclusive,
    /// Multi-holder; permitted for non-modifying operations.
    Shared,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Shared => "shared",
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum MessageType {
    Put,
    Update,
    Remove,
    Get,
    Revert,
    RemoveLocation,
    Stat,
    CreateBucket,
    DeleteBucket,
    SplitBucket,
    JoinBuckets,
    SetBucketState,
    MergeBucket,
    GetBucketDiff,
    GetBucketDiffReply,
    ApplyBucketDiff,
    ApplyBucketDiffReply,
    ReadBucketInfo,
    RecheckBucketInfo,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Put => "put",
            MessageType::Update => "update",
            MessageType::Remove => "remove",
            MessageType::Get => "get",
            MessageType::Revert => "revert",
            MessageType::RemoveLocation => "removelocation",
            MessageType::Stat => "stat",
            MessageType::CreateBucket => "createbucket",
            MessageType::DeleteBucket => "deletebucket",
            MessageType::SplitBucket => "splitbucket",
            MessageType::JoinBuckets => "joinbuckets",
            MessageType::SetBucketState => "setbucketstate",
            MessageType::MergeBucket => "mergebucket",
            MessageType::GetBucketDiff => "getbucketdiff",
            MessageType::GetBucketDiffReply => "getbucketdiff-reply",
            MessageType::ApplyBucketDiff => "applybucketdiff",
            MessageType::ApplyBucketDiffReply => "applybucketdiff-reply",
            MessageType::ReadBucketInfo => "readbucketinfo",
            MessageType::RecheckBucketInfo => "recheckbucketinfo",
        }
    }

    /// Replies flow through the same queues as commands (merge diff replies
    /// are processed by the persistence threads) but never time out in queue
    /// and never get synthetic replies of their own.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::GetBucketDiffReply | MessageType::ApplyBucketDiffReply
        )
    }

    pub fn lock_mode(self) -> LockMode {
        match self {
            MessageType::Get
            | MessageType::Stat
            | MessageType::ReadBucketInfo
            | MessageType::RecheckBucketInfo => LockMode::Shared,
            _ => LockMode::Exclusive,
        }
    }

    /// Whether an abort command may flush this message from the queue.
    /// Create/DeleteBucket have already updated the bucket database before
    /// being scheduled and must be allowed through to keep the service layer
    /// and the provider in sync.
    pub fn may_be_aborted(self) -> bool {
        matches!(
            self,
            MessageType::Put
                | MessageType::Update
                | MessageType::Remove
                | MessageType::Revert
                | MessageType::RemoveLocation
                | MessageType::SplitBucket
                | MessageType::JoinBuckets
                | MessageType::SetBucketState
                | MessageType::MergeBucket
                | MessageType::GetBucketDiff
                | MessageType::ApplyBucketDiff
        )
    }

    /// Whether the message carries a document id that split remapping can
    /// route on.
    pub fn is_document_operation(self) -> bool {
        matches!(
            self,
            MessageType::Put | MessageType::Update | MessageType::Remove | MessageType::Get
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pending storage operation. Owned by the queue until dispatched, then by
/// the worker executing it.
#[derive(Debug)]
pub struct StorageMessage {
    id: MessageId,
    msg_type: MessageType,
    bucket: BucketId,
    priority: u8,
    timeout: Duration,
    document: Option<DocumentId>,
}

impl StorageMessage {
    pub fn new(msg_type: MessageType, bucket: BucketId, priority: u8, timeout: Duration) -> Self {
        StorageMessage {
            id: next_message_id(),
            msg_type,
            bucket,
            priority,
            timeout,
            document: None,
        }
    }

    pub fn with_document(mut self, doc: DocumentId) -> Self {
        self.document = Some(doc);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn document(&self) -> Option<&DocumentId> {
        self.document.as_ref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.msg_type.lock_mode()
    }

    pub fn is_reply(&self) -> bool {
        self.msg_type.is_reply()
    }

    pub fn may_be_aborted(&self) -> bool {
        self.msg_type.may_be_aborted()
    }

    /// Rewrite the routing bucket after a split/join/move decided the
    /// operation now belongs to a different bucket.
    pub fn remap_bucket(&mut self, bucket: BucketId) {
        self.bucket = bucket;
    }
}

impl fmt::Display for StorageMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.msg_type, self.id, self.bucket)
    }
}

/// Selects which buckets an abort should flush queued operations for.
#[derive(Clone)]
pub struct AbortBucketOperations {
    selector: Selector,
}

#[derive(Clone)]
enum Selector {
    Explicit(Arc<HashSet<BucketId>>),
    Predicate(Arc<dyn Fn(BucketId) -> bool + Send + Sync>),
}

impl AbortBucketOperations {
    pub fn of_buckets(buckets: impl IntoIterator<Item = BucketId>) -> Self {
        AbortBucketOperations {
            selector: Selector::Explicit(Arc::new(buckets.into_iter().collect())),
        }
    }

    pub fn matching(pred: impl Fn(BucketId) -> bool + Send + Sync + 'static) -> Self {
        AbortBucketOperations {
            selector: Selector::Predicate(Arc::new(pred)),
        }
    }

    pub fn should_abort(&self, bucket: BucketId) -> bool {
        match &self.selector {
            Selector::Explicit(set) => set.contains(&bucket),
            Selector::Predicate(pred) => pred(bucket),
        }
    }
}

impl fmt::Debug for AbortBucketOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::Explicit(set) => write!(f, "AbortBucketOperations({} buckets)", set.len()),
            Selector::Predicate(_) => write!(f, "AbortBucketOperations(predicate)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique() {
        let a = StorageMessage::new(
            MessageType::Put,
            BucketId::new(8, 1),
            100,
            Duration::from_secs(1),
        );
        let b = StorageMessage::new(
            MessageType::Put,
            BucketId::new(8, 1),
            100,
            Duration::from_secs(1),
        );
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn reads_take_shared_locks() {
        assert_eq!(MessageType::Get.lock_mode(), LockMode::Shared);
        assert_eq!(MessageType::Stat.lock_mode(), LockMode::Shared);
        assert_eq!(MessageType::Put.lock_mode(), LockMode::Exclusive);
        assert_eq!(MessageType::SplitBucket.lock_mode(), LockMode::Exclusive);
    }

    #[test]
    fn bucket_lifecycle_commands_are_not_abortable() {
        assert!(!MessageType::CreateBucket.may_be_aborted());
        assert!(!MessageType::DeleteBucket.may_be_aborted());
        assert!(!MessageType::Get.may_be_aborted());
        assert!(!MessageType::GetBucketDiffReply.may_be_aborted());
        assert!(MessageType::Put.may_be_aborted());
        assert!(MessageType::MergeBucket.may_be_aborted());
    }

    #[test]
    fn abort_selector_variants() {
        let b1 = BucketId::new(8, 1);
        let b2 = BucketId::new(8, 2);
        let explicit = AbortBucketOperations::of_buckets([b1]);
        assert!(explicit.should_abort(b1));
        assert!(!explicit.should_abort(b2));
        let pred = AbortBucketOperations::matching(move |b| b == b2);
        assert!(pred.should_abort(b2));
        assert!(!pred.should_abort(b1));
    }
}

//! Replies and return codes emitted back towards the RPC layer.

use std::fmt;

use serde::Serialize;

use crate::bucket::BucketId;
use crate::message::{MessageId, MessageType, StorageMessage};

/// Storage return codes the dispatch layer emits. Mirrors the node-wide
/// return code set; only the codes this layer produces are listed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum ReturnCode {
    Ok,
    /// Message exceeded its own timeout while queued.
    Timeout,
    /// An abort command matched the message while it was queued.
    Aborted,
    /// Scheduled against a closed disk.
    Rejected,
    /// Remap found no valid target for the message.
    BucketNotFound,
    /// The bucket ceased to exist (split/join) while the message was queued.
    BucketDeleted,
    DiskFailure,
    NotReady,
    InternalFailure,
}

impl ReturnCode {
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }

    pub fn name(self) -> &'static str {
        match self {
            ReturnCode::Ok => "OK",
            ReturnCode::Timeout => "TIMEOUT",
            ReturnCode::Aborted => "ABORTED",
            ReturnCode::Rejected => "REJECTED",
            ReturnCode::BucketNotFound => "BUCKET_NOT_FOUND",
            ReturnCode::BucketDeleted => "BUCKET_DELETED",
            ReturnCode::DiskFailure => "DISK_FAILURE",
            ReturnCode::NotReady => "NOT_READY",
            ReturnCode::InternalFailure => "INTERNAL_FAILURE",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply to a storage command. The dispatch layer only ever synthesizes
/// these for commands it refuses to deliver (timeout, abort, remap failure,
/// disk down); successful operations are replied to by the worker itself.
#[derive(Clone, Debug)]
pub struct StorageReply {
    request_id: MessageId,
    request_type: MessageType,
    bucket: BucketId,
    result: ReturnCode,
    note: String,
}

impl StorageReply {
    pub fn request_id(&self) -> MessageId {
        self.request_id
    }

    pub fn request_type(&self) -> MessageType {
        self.request_type
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn result(&self) -> ReturnCode {
        self.result
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    /// Stamp a result onto a reply that was parked waiting for an outcome
    /// (merge completion replies).
    pub fn set_result(&mut self, result: ReturnCode, note: impl Into<String>) {
        self.result = result;
        self.note = note.into();
    }
}

/// Synthesize a reply for `msg`. Must only be called for commands; replies
/// cannot be replied to.
pub fn make_reply(msg: &StorageMessage, result: ReturnCode, note: impl Into<String>) -> StorageReply {
    debug_assert!(!msg.is_reply(), "cannot synthesize a reply to a reply");
    StorageReply {
        request_id: msg.id(),
        request_type: msg.msg_type(),
        bucket: msg.bucket(),
        result,
        note: note.into(),
    }
}

/// Outbound channel towards the RPC layer. Delivery failures are the
/// sender's concern; by the time a synthetic reply is handed over the
/// dispatch layer has already relinquished the message.
pub trait MessageSender: Send + Sync {
    fn send_reply(&self, reply: StorageReply);
    fn send_command(&self, command: StorageMessage);
}

//! Shared storage-node API types consumed and exposed by the dispatch core.
//!
//! Kept dependency-light because these types cross every layer boundary of
//! the node: the RPC decoding layer constructs [`StorageMessage`]s, the
//! dispatch core routes and locks them, and persistence workers execute
//! them and emit [`StorageReply`]s.

pub mod bucket;
pub mod message;
pub mod partition;
pub mod reply;

pub use bucket::{BucketId, BucketIdFactory, DocumentId, HashBucketIdFactory, MAX_USED_BITS};
pub use message::{
    next_message_id, AbortBucketOperations, LockMode, MessageId, MessageType, StorageMessage,
};
pub use partition::{PartitionState, PartitionStateList};
pub use reply::{make_reply, MessageSender, ReturnCode, StorageReply};

//! Shared helpers for dispatch integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use silo_api::{
    BucketId, BucketIdFactory, DocumentId, HashBucketIdFactory, MessageSender, MessageType,
    PartitionStateList, ReturnCode, StorageMessage, StorageReply, MAX_USED_BITS,
};
use silo_dispatch::{DispatchConfig, DispatchHandler};

/// Generous per-message timeout so queue-timeout reaping never fires unless
/// a test asks for it.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Dispatch wait short enough to assert "no runnable message" quickly.
pub const SHORT_WAIT: Duration = Duration::from_millis(50);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Captures everything the handler sends upstream.
#[derive(Default)]
pub struct RecordingSender {
    replies: Mutex<Vec<StorageReply>>,
    commands: Mutex<Vec<StorageMessage>>,
}

impl RecordingSender {
    pub fn replies(&self) -> Vec<StorageReply> {
        self.replies.lock().expect("reply log poisoned").clone()
    }

    pub fn reply_for(&self, request_id: u64) -> Option<StorageReply> {
        self.replies()
            .into_iter()
            .find(|r| r.request_id() == request_id)
    }

    pub fn results(&self) -> Vec<ReturnCode> {
        self.replies().iter().map(|r| r.result()).collect()
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().expect("reply log poisoned").len()
    }
}

impl MessageSender for RecordingSender {
    fn send_reply(&self, reply: StorageReply) {
        self.replies.lock().expect("reply log poisoned").push(reply);
    }

    fn send_command(&self, command: StorageMessage) {
        self.commands
            .lock()
            .expect("command log poisoned")
            .push(command);
    }
}

/// Factory with explicit document placements, so remap tests control which
/// child a document routes to.
#[derive(Default)]
pub struct TableFactory {
    map: HashMap<String, BucketId>,
}

impl TableFactory {
    pub fn with(mut self, doc: &str, location: BucketId) -> Self {
        self.map.insert(doc.to_string(), location);
        self
    }
}

impl BucketIdFactory for TableFactory {
    fn bucket_of(&self, doc: &DocumentId) -> BucketId {
        self.map
            .get(doc.as_str())
            .copied()
            .unwrap_or_else(|| HashBucketIdFactory.bucket_of(doc))
    }
}

pub fn handler(disks: usize, stripes: usize) -> (Arc<DispatchHandler>, Arc<RecordingSender>) {
    handler_with_factory(disks, stripes, Arc::new(HashBucketIdFactory))
}

pub fn handler_with_factory(
    disks: usize,
    stripes: usize,
    factory: Arc<dyn BucketIdFactory>,
) -> (Arc<DispatchHandler>, Arc<RecordingSender>) {
    init_tracing();
    let sender = Arc::new(RecordingSender::default());
    let config = DispatchConfig {
        stripes_per_disk: stripes,
        next_message_timeout: SHORT_WAIT,
    };
    let handler = DispatchHandler::new(
        &config,
        &PartitionStateList::all_up(disks),
        sender.clone(),
        factory,
    )
    .expect("handler construction");
    (Arc::new(handler), sender)
}

pub fn bucket(data: u64) -> BucketId {
    BucketId::new(16, data)
}

/// A location with the full used-bit count, for factory tables.
pub fn location(data: u64) -> BucketId {
    BucketId::new(MAX_USED_BITS, data)
}

pub fn msg(msg_type: MessageType, bucket: BucketId, priority: u8) -> StorageMessage {
    StorageMessage::new(msg_type, bucket, priority, LONG_TIMEOUT)
}

pub fn put(bucket: BucketId, priority: u8) -> StorageMessage {
    msg(MessageType::Put, bucket, priority)
}

pub fn put_doc(bucket: BucketId, priority: u8, doc: &str) -> StorageMessage {
    put(bucket, priority).with_document(DocumentId::new(doc))
}

pub fn get(bucket: BucketId, priority: u8) -> StorageMessage {
    msg(MessageType::Get, bucket, priority)
}

pub fn get_doc(bucket: BucketId, priority: u8, doc: &str) -> StorageMessage {
    get(bucket, priority).with_document(DocumentId::new(doc))
}

//! Dispatch and bucket-locking core between the asynchronous message source
//! and the persistence worker threads.
//!
//! This crate implements all queueing and locking shared between the
//! persistence threads of a storage node. Scheduled messages land in one of
//! several independent dispatch stripes per disk; worker threads pull the
//! highest-priority runnable message from a stripe and receive it together
//! with a scoped bucket lock. Operations on the same bucket never run
//! concurrently except under shared read locks, disks can be closed or
//! paused with in-flight work draining cleanly, and queued operations are
//! remapped without loss when buckets split, join, or move.
//!
//! The queue is in-memory only: a restart discards pending work, which
//! upstream retries re-drive.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod disk;
pub mod handler;
pub mod merge;
pub mod metrics;
pub mod queue;
pub mod status;
pub mod stripe;

pub use disk::DiskState;
pub use handler::{DispatchHandler, RemapInfo, RemapOp, ResumeGuard};
pub use merge::MergeStatus;
pub use metrics::{DiskMetricsSnapshot, HandlerMetricsSnapshot, StripeMetricsSnapshot};
pub use queue::MessageEntry;
pub use stripe::{BucketLock, LockedMessage};

/// Handler construction knobs. A plain record: the node loads it from its
/// config file and hands it over once.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Dispatch stripes per disk. Typically at least the number of worker
    /// threads per disk; no power-of-two requirement.
    pub stripes_per_disk: usize,
    /// How long a worker blocks in `next_message` before returning empty to
    /// register a tick.
    pub next_message_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            stripes_per_disk: 4,
            next_message_timeout: Duration::from_millis(100),
        }
    }
}

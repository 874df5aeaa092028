//! Operation queue: ordered, expiring items per chunk.
//!
//! Callers append opaque payloads to a chunk and read them back in arrival
//! order. Items expire after a fixed TTL, a chunk can be cleared in one call,
//! and its live contents can be written to blob storage as an immutable
//! snapshot.
//!
//! # Design
//!
//! - `OperationQueue` runs every operation under the `WriterGuard`
//! - Items live in a `KvStore`, snapshots in a `BlobStore`
//! - Sort keys are fixed-width counters derived from the clock, strictly
//!   increasing per chunk
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = OperationQueue::from_settings(&settings, store, blobs);
//!
//! queue.enqueue("TEST_OPE", r#"{"m":"insert","d":{}}"#.to_string()).await?;
//! let items = queue.list("TEST_OPE").await?;
//! let snapshot = queue.snapshot("TEST_OPE").await?;
//! ```

pub mod engine;
pub mod guard;
pub mod models;

pub use engine::{
    snapshot_path, snapshot_prefix, validate_chunk_key, EngineConfig, OperationQueue,
    SNAPSHOT_ROOT,
};
pub use guard::{GuardPermit, GuardScope, WriterGuard};
pub use models::{
    expiry_from_epoch, DeleteReport, FailedDelete, QueueError, QueueItem, Snapshot,
    SnapshotDocument, SortKey,
};

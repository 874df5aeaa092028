//! Blob storage for chunk snapshots.
//!
//! Snapshots are immutable JSON documents addressed by path. Two backends are
//! available:
//!
//! - `MemoryBlobStore`: in-process storage (default)
//! - `FsBlobStore`: files under a local directory
//!
//! Use `create_blob_store()` to pick one from configuration.

pub mod backend;
mod factory;
pub mod fs_backend;
pub mod memory_backend;

pub use backend::{BlobError, BlobObject, BlobStore};
pub use factory::create_blob_store;
pub use fs_backend::FsBlobStore;
pub use memory_backend::MemoryBlobStore;

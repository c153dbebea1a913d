//! picroll Core Library
//!
//! This crate keeps a rolling, bounded cache of gallery items: it fetches
//! metadata batches, downloads content with bounded parallelism, tracks
//! progress and cancellation of every task, and retains a short history for
//! backward navigation. It is UI-agnostic; a frontend polls
//! [`CacheHandle::snapshot`] and sends [`CacheCommand`]s.

pub mod downloader;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod gallery;
mod history;
pub mod manager;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ErrorEvent, ErrorKind, Result};
pub use fetcher::FetchOutcome;
pub use gallery::{ChunkStream, ContentResponse, Gallery, HttpGallery, MetadataQuery};
pub use manager::{CacheCommand, CacheHandle, CacheService, CoreEvent};
pub use registry::{ProgressSnapshot, TaskProgress, TaskRegistry};
pub use types::*;

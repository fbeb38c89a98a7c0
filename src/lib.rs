//! Chunked backup and restore of a byte stream into size-capped object
//! storage.
//!
//! A [`BackupPipeline`] splits a stream into chunks that fit the
//! [`Folder`]'s object size cap, runs each through a [`Processor`]
//! (compress+encrypt) concurrently, and stores it under a name that encodes
//! its position. A [`RestorePipeline`] lists the folder, sorts the names,
//! and writes the reversed chunks back out in order.

pub mod backup;
pub mod chunker;
pub mod error;
pub mod folder;
pub mod manifest;
pub mod naming;
pub mod processor;
pub mod restore;

pub use backup::{BackupConfig, BackupPipeline, BackupSummary};
pub use error::{Error, Result};
pub use folder::{DirFolder, Folder, MemoryFolder};
pub use naming::{ChunkName, ChunkNamer, ObjectName, RunId};
pub use processor::{Processor, SealedProcessor, XorProcessor, ZstdProcessor};
pub use restore::{RestoreConfig, RestorePipeline, RestoreSummary};

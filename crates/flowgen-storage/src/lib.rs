//! # Flowgen Storage
//!
//! Durable state for resumable pipelines:
//!
//! - [`checkpoint`] - per-node progress, the single source of truth on
//!   resume
//! - [`manifest`] - the runtime manifest: a topology snapshot whose
//!   paths are authoritative over code-level configuration
//!
//! Both documents are JSON files written with write-temp, fsync, rename
//! semantics so readers never observe a partial write, even across a
//! mid-write crash.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod atomic;

/// Durable per-node progress.
pub mod checkpoint;

/// The runtime manifest.
pub mod manifest;

use thiserror::Error;

pub use checkpoint::{CheckpointSnapshot, CheckpointStore, NodeCheckpoint};
pub use manifest::{ManifestStore, NodeManifest, RuntimeManifest};

/// Errors from durable-state persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure while persisting or loading.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The document on disk could not be decoded.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

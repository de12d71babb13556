//! # Flowgen Bus
//!
//! Concrete stream implementations for Flowgen pipelines:
//!
//! - [`jsonl`] / [`csv`] - file-backed storage with `.done` seal markers
//! - [`memory`] - in-memory storage and the bounded bridge buffer
//! - [`reader`] / [`writer`] - the generic annealing reader and the
//!   sync/async batch writer
//! - [`stream`] - the `DataStream` endpoint tying storage to signaling
//! - [`registry`] - URI resolution with extension auto-completion
//!
//! All implementations satisfy the traits in `flowgen-core`; nodes and
//! pipelines never name a concrete backend.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::unreadable_literal
    )
)]

/// CSV file storage with embedded-newline-aware parsing.
pub mod csv;

/// JSONL file storage.
pub mod jsonl;

/// In-memory storage and the streaming bridge buffer.
pub mod memory;

/// The generic stream reader.
pub mod reader;

/// URI resolution and the stream registry.
pub mod registry;

/// Data-available signaling between writer and reader.
pub mod signal;

/// The physical storage backend contract.
pub mod storage;

/// The concrete stream endpoint.
pub mod stream;

/// Shared filesystem helpers.
pub mod util;

/// The stream writer.
pub mod writer;

pub use csv::CsvStorage;
pub use jsonl::JsonlStorage;
pub use memory::{BridgeBuffer, MemoryStorage};
pub use reader::StreamReader;
pub use registry::{resolve_uri, ResolvedUri, Scheme, StreamRegistry};
pub use signal::SignalChannel;
pub use storage::RecordStorage;
pub use stream::BusStream;
pub use writer::StreamWriter;

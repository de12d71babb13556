//! URI resolution and the stream registry.
//!
//! URIs take the form `<scheme>://<path>` with `jsonl`, `csv`, and
//! `memory` schemes. Resolution auto-completes in both directions: a
//! bare path with a known extension resolves to the matching scheme, and
//! a scheme URI without an extension gains the scheme's default one, so
//! `output.jsonl` and `jsonl://output` name the same stream.

use std::path::Path;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use flowgen_core::{DataStream, StreamError};

use crate::stream::BusStream;

/// A URI scheme the bus can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// JSONL file stream.
    Jsonl,
    /// CSV file stream.
    Csv,
    /// In-memory stream.
    Memory,
}

impl Scheme {
    /// The scheme name as it appears in URIs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Jsonl => "jsonl",
            Scheme::Csv => "csv",
            Scheme::Memory => "memory",
        }
    }

    /// The default file extension for this scheme, empty for memory.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Scheme::Jsonl => ".jsonl",
            Scheme::Csv => ".csv",
            Scheme::Memory => "",
        }
    }

    /// Returns `true` for file-backed schemes.
    #[must_use]
    pub fn is_file(self) -> bool {
        !matches!(self, Scheme::Memory)
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "jsonl" => Some(Scheme::Jsonl),
            "csv" => Some(Scheme::Csv),
            "memory" => Some(Scheme::Memory),
            _ => None,
        }
    }

    fn for_extension(path: &str) -> Option<Self> {
        if path.ends_with(".jsonl") {
            Some(Scheme::Jsonl)
        } else if path.ends_with(".csv") {
            Some(Scheme::Csv)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of resolving a URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUri {
    /// The routed scheme.
    pub scheme: Scheme,
    /// The path part, extension-completed for file schemes.
    pub path: String,
    /// The canonical URI: `<scheme>://<path>`. Two spellings of the
    /// same endpoint share one canonical form.
    pub canonical: String,
}

/// Resolves a URI to a scheme and canonical form.
///
/// # Errors
///
/// Returns [`StreamError::ProtocolUnknown`] for an unknown scheme, or a
/// bare path whose extension maps to no scheme.
pub fn resolve_uri(uri: &str) -> Result<ResolvedUri, StreamError> {
    let (scheme, mut path) = match uri.split_once("://") {
        Some((name, rest)) => {
            let scheme =
                Scheme::parse(name).ok_or_else(|| StreamError::ProtocolUnknown(uri.to_string()))?;
            (scheme, rest.to_string())
        }
        None => {
            let scheme = Scheme::for_extension(uri)
                .ok_or_else(|| StreamError::ProtocolUnknown(uri.to_string()))?;
            (scheme, uri.to_string())
        }
    };

    if scheme.is_file() && Scheme::for_extension(&path).is_none() {
        path.push_str(scheme.extension());
    }

    let canonical = format!("{scheme}://{path}");
    Ok(ResolvedUri {
        scheme,
        path,
        canonical,
    })
}

/// Caches one stream object per canonical URI.
///
/// Welded adjacent nodes resolve the same URI to the same `Arc`, which
/// is what lets a writer's signal reach the downstream reader.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<FxHashMap<String, Arc<dyn DataStream>>>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `uri` and returns the shared stream for it, creating
    /// the implementation on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ProtocolUnknown`] if the URI cannot be
    /// routed.
    pub fn get_or_create(&self, uri: &str) -> Result<Arc<dyn DataStream>, StreamError> {
        let resolved = resolve_uri(uri)?;
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(&resolved.canonical) {
            return Ok(Arc::clone(stream));
        }
        let stream: Arc<dyn DataStream> = match resolved.scheme {
            Scheme::Jsonl => Arc::new(BusStream::jsonl(
                resolved.canonical.clone(),
                Path::new(&resolved.path),
            )),
            Scheme::Csv => Arc::new(BusStream::csv(
                resolved.canonical.clone(),
                Path::new(&resolved.path),
            )),
            Scheme::Memory => Arc::new(BusStream::memory(resolved.canonical.clone())),
        };
        streams.insert(resolved.canonical, Arc::clone(&stream));
        Ok(stream)
    }

    /// Number of distinct streams created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Returns `true` when no streams have been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_from_extension() {
        let r = resolve_uri("output.jsonl").unwrap();
        assert_eq!(r.scheme, Scheme::Jsonl);
        assert_eq!(r.canonical, "jsonl://output.jsonl");

        let r = resolve_uri("data/table.csv").unwrap();
        assert_eq!(r.scheme, Scheme::Csv);
    }

    #[test]
    fn test_extension_from_scheme() {
        let r = resolve_uri("jsonl://output").unwrap();
        assert_eq!(r.path, "output.jsonl");
        assert_eq!(r.canonical, "jsonl://output.jsonl");
    }

    #[test]
    fn test_both_spellings_are_identical() {
        let a = resolve_uri("output.jsonl").unwrap();
        let b = resolve_uri("jsonl://output").unwrap();
        assert_eq!(a.canonical, b.canonical);
    }

    #[test]
    fn test_memory_uri_untouched() {
        let r = resolve_uri("memory://staging").unwrap();
        assert_eq!(r.scheme, Scheme::Memory);
        assert_eq!(r.path, "staging");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(matches!(
            resolve_uri("ftp://host/file").unwrap_err(),
            StreamError::ProtocolUnknown(_)
        ));
        assert!(matches!(
            resolve_uri("plain-path-no-extension").unwrap_err(),
            StreamError::ProtocolUnknown(_)
        ));
    }

    #[test]
    fn test_registry_shares_stream_objects() {
        let registry = StreamRegistry::new();
        let a = registry.get_or_create("memory://x").unwrap();
        let b = registry.get_or_create("memory://x").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let c = registry.get_or_create("memory://y").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_welds_spellings() {
        let registry = StreamRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().display();
        let a = registry
            .get_or_create(&format!("jsonl://{base}/out"))
            .unwrap();
        let b = registry
            .get_or_create(&format!("{base}/out.jsonl"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

//! JSONL file storage: one JSON object per line, UTF-8, LF-terminated.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flowgen_core::{Envelope, StreamError};

use crate::storage::RecordStorage;
use crate::util::{done_path, sync_file, write_done_marker};

/// JSONL-backed record storage with a sibling `.done` seal marker.
#[derive(Debug)]
pub struct JsonlStorage {
    path: PathBuf,
    done: PathBuf,
}

impl JsonlStorage {
    /// Creates a storage over the given payload path. Parent
    /// directories are created lazily on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let done = done_path(&path);
        Self { path, done }
    }

    /// The payload path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<(), StreamError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl RecordStorage for JsonlStorage {
    fn append(&self, batch: &[Envelope]) -> Result<(), StreamError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut out = BufWriter::new(file);
        for env in batch {
            let line = serde_json::to_string(&env.to_json())
                .map_err(|e| StreamError::Malformed {
                    ordinal: env.anchor,
                    detail: e.to_string(),
                })?;
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    fn read(&self, offset: u64, limit: usize) -> Result<Vec<Envelope>, StreamError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut results = Vec::new();
        for (ordinal, line) in reader.lines().enumerate() {
            let ordinal = ordinal as u64;
            if ordinal < offset {
                // Seek by line: the line ordinal is the record ordinal.
                line?;
                continue;
            }
            if results.len() >= limit {
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => results.push(Envelope::from_json(value, ordinal)?),
                Err(e) => {
                    // A torn trailing line from a crash is tolerated;
                    // the checkpoint, not the payload, decides resume.
                    tracing::warn!(
                        "skipping unparsable line {ordinal} in {}: {e}",
                        self.path.display()
                    );
                }
            }
        }
        Ok(results)
    }

    fn len(&self) -> Result<u64, StreamError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut count = 0u64;
        for line in reader.lines() {
            line?;
            count += 1;
        }
        Ok(count)
    }

    fn clear(&self) -> Result<(), StreamError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        self.unseal()
    }

    fn seal(&self, record_count: u64) -> Result<(), StreamError> {
        if self.path.exists() {
            sync_file(&self.path)?;
        }
        self.ensure_parent()?;
        write_done_marker(&self.done, record_count)
    }

    fn unseal(&self) -> Result<(), StreamError> {
        if self.done.exists() {
            std::fs::remove_file(&self.done)?;
        }
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.done.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgen_core::Record;

    fn env(anchor: u64, v: u64) -> Envelope {
        Envelope::new(anchor, Record::new().with("v", v))
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlStorage::new(dir.path().join("data.jsonl"));

        storage.append(&[env(0, 1), env(1, 2), env(2, 3)]).unwrap();
        assert_eq!(storage.len().unwrap(), 3);

        let batch = storage.read(1, 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].anchor, 1);
        assert_eq!(batch[1].anchor, 2);
    }

    #[test]
    fn test_read_beyond_end_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlStorage::new(dir.path().join("data.jsonl"));
        assert!(storage.read(0, 10).unwrap().is_empty());

        storage.append(&[env(0, 1)]).unwrap();
        assert!(storage.read(5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_wire_format_is_flat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let storage = JsonlStorage::new(&path);
        storage.append(&[env(0, 10)]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\"_i\":0,\"v\":10}\n");
    }

    #[test]
    fn test_input_without_anchor_gets_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.jsonl");
        std::fs::write(&path, "{\"v\":1}\n{\"v\":2}\n{\"v\":3}\n").unwrap();

        let storage = JsonlStorage::new(&path);
        let batch = storage.read(0, 10).unwrap();
        let anchors: Vec<_> = batch.iter().map(|e| e.anchor).collect();
        assert_eq!(anchors, vec![0, 1, 2]);
    }

    #[test]
    fn test_seal_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let storage = JsonlStorage::new(&path);
        storage.append(&[env(0, 1)]).unwrap();

        assert!(!storage.is_sealed());
        storage.seal(1).unwrap();
        assert!(storage.is_sealed());
        assert!(dir.path().join("data.jsonl.done").exists());

        storage.unseal().unwrap();
        assert!(!storage.is_sealed());
    }

    #[test]
    fn test_clear_removes_payload_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let storage = JsonlStorage::new(&path);
        storage.append(&[env(0, 1)]).unwrap();
        storage.seal(1).unwrap();

        storage.clear().unwrap();
        assert!(!path.exists());
        assert!(!storage.is_sealed());
        assert_eq!(storage.len().unwrap(), 0);
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(&path, "{\"_i\":0,\"v\":1}\n{\"_i\":1,\"v\":").unwrap();

        let storage = JsonlStorage::new(&path);
        let batch = storage.read(0, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].anchor, 0);
    }
}

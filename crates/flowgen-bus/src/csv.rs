//! CSV file storage with a header row and an `_i` column.
//!
//! The parser is quote-aware end to end: values containing the
//! delimiter, quotes, or newlines are quoted on write, and row scanning
//! handles newlines embedded inside quoted fields, so resume counting
//! stays correct on multi-line values.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use flowgen_core::{Envelope, Record, StreamError, ANCHOR_KEY};

use crate::storage::RecordStorage;
use crate::util::{done_path, sync_file, write_done_marker};

/// CSV-backed record storage with a sibling `.done` seal marker.
#[derive(Debug)]
pub struct CsvStorage {
    path: PathBuf,
    done: PathBuf,
    delimiter: char,
    header: Mutex<Option<Vec<String>>>,
}

impl CsvStorage {
    /// Creates a storage over the given payload path with a comma
    /// delimiter.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let done = done_path(&path);
        Self {
            path,
            done,
            delimiter: ',',
            header: Mutex::new(None),
        }
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

    /// Loads rows from disk: the header plus every data row, with
    /// embedded newlines honored.
    fn load_rows(&self) -> Result<Option<(Vec<String>, Vec<Vec<String>>)>, StreamError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        let mut rows = split_rows(&text)
            .into_iter()
            .filter(|row| !row.trim().is_empty());
        let Some(header_row) = rows.next() else {
            return Ok(None);
        };
        let header = split_fields(&header_row, self.delimiter);
        let data: Vec<Vec<String>> = rows
            .map(|row| split_fields(&row, self.delimiter))
            .collect();
        Ok(Some((header, data)))
    }

    /// The column set for this file: cached, read from disk, or derived
    /// from the first record written.
    fn resolve_header(&self, first: &Envelope) -> Result<Vec<String>, StreamError> {
        let mut cached = self.header.lock();
        if let Some(header) = cached.as_ref() {
            return Ok(header.clone());
        }
        let header = if let Some((header, _)) = self.load_rows()? {
            header
        } else {
            let mut cols = vec![ANCHOR_KEY.to_string()];
            cols.extend(first.record.iter().map(|(k, _)| k.clone()));
            cols
        };
        *cached = Some(header.clone());
        Ok(header)
    }
}

impl RecordStorage for CsvStorage {
    fn append(&self, batch: &[Envelope]) -> Result<(), StreamError> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        self.ensure_parent()?;
        let header = self.resolve_header(first)?;

        let fresh = !self.path.exists()
            || std::fs::metadata(&self.path)?.len() == 0;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut out = BufWriter::new(file);

        if fresh {
            let line = header
                .iter()
                .map(|c| escape_field(c, self.delimiter))
                .collect::<Vec<_>>()
                .join(&self.delimiter.to_string());
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }

        let empty = Map::new();
        for env in batch {
            let wire = env.to_json();
            let obj = wire.as_object().unwrap_or(&empty);
            let line = header
                .iter()
                .map(|col| escape_field(&value_to_field(obj.get(col)), self.delimiter))
                .collect::<Vec<_>>()
                .join(&self.delimiter.to_string());
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    fn read(&self, offset: u64, limit: usize) -> Result<Vec<Envelope>, StreamError> {
        let Some((header, rows)) = self.load_rows()? else {
            return Ok(Vec::new());
        };
        let mut results = Vec::new();
        for (ordinal, fields) in rows.into_iter().enumerate() {
            let ordinal = ordinal as u64;
            if ordinal < offset {
                continue;
            }
            if results.len() >= limit {
                break;
            }
            let mut anchor = None;
            let mut obj = Map::new();
            for (col, raw) in header.iter().zip(fields) {
                // The anchor column is the framework's and is parsed;
                // business fields stay exactly the strings they were.
                if col == ANCHOR_KEY {
                    anchor = raw.parse::<u64>().ok();
                } else {
                    obj.insert(col.clone(), field_to_value(&raw));
                }
            }
            results.push(Envelope::new(
                anchor.unwrap_or(ordinal),
                Record::from_map(obj),
            ));
        }
        Ok(results)
    }

    fn len(&self) -> Result<u64, StreamError> {
        match self.load_rows()? {
            Some((_, rows)) => Ok(rows.len() as u64),
            None => Ok(0),
        }
    }

    fn clear(&self) -> Result<(), StreamError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        *self.header.lock() = None;
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

/// Splits CSV text into logical rows, keeping newlines that fall inside
/// quoted fields.
fn split_rows(text: &str) -> Vec<String> {
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in text.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '\n' if !in_quotes => {
                if !current.is_empty() {
                    rows.push(std::mem::take(&mut current));
                } else {
                    rows.push(String::new());
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        rows.push(current);
    }
    rows
}

/// Splits one row into fields, respecting quotes and unescaping doubled
/// quote characters.
fn split_fields(row: &str, delimiter: char) -> Vec<String> {
    let row = row.strip_suffix('\r').unwrap_or(row);
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = row.chars().peekable();
    let mut in_quotes = false;
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
            }
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Quotes a field when it contains the delimiter, quotes, or newlines.
fn escape_field(field: &str, delimiter: char) -> String {
    if field.contains(delimiter)
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r')
    {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Renders a JSON value as a CSV field.
fn value_to_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Returns a CSV business field as a JSON value. CSV is untyped: every
/// non-empty field reads back as a string, never re-typed by guessing
/// (a zero-padded id must not come back as a number). Empty fields are
/// null, the inverse of how null is written.
fn field_to_value(field: &str) -> Value {
    if field.is_empty() {
        Value::Null
    } else {
        Value::String(field.to_string())
    }
}

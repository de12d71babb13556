//! Shared filesystem helpers for file-backed streams.

use std::path::{Path, PathBuf};

use flowgen_core::StreamError;

/// Returns the sibling seal marker path: `<payload>.done`.
#[must_use]
pub fn done_path(payload: &Path) -> PathBuf {
    let mut os = payload.as_os_str().to_os_string();
    os.push(".done");
    PathBuf::from(os)
}

/// Fsync a file so its contents are durable on disk.
///
/// Opened with write access: Windows requires it for `FlushFileBuffers`.
pub fn sync_file(path: &Path) -> Result<(), StreamError> {
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()?;
    Ok(())
}

/// Writes the seal marker. The content (record count and seal time) is
/// informational; presence alone means sealed.
pub fn write_done_marker(done: &Path, record_count: u64) -> Result<(), StreamError> {
    let sealed_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    std::fs::write(done, format!("records={record_count} sealed_at={sealed_at}\n"))?;
    Ok(())
}

//! Atomic JSON file persistence: write-temp, fsync, rename, fsync dir.

use std::path::Path;

use crate::StoreError;

/// Fsync a file to ensure its contents are durable on disk.
///
/// Opened with write access: Windows requires it for `FlushFileBuffers`.
fn sync_file(path: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()
}

/// Fsync a directory to make rename operations durable.
///
/// On Unix this flushes directory metadata (new/renamed entries). On
/// Windows directory sync is not supported; the OS handles durability.
#[allow(clippy::unnecessary_wraps)]
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Writes `content` to `path` atomically: a reader either sees the
/// previous version or the new one, never a partial file.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    sync_file(&tmp)?;
    std::fs::rename(&tmp, path)?;
    sync_dir(dir)?;
    Ok(())
}

//! Atomic whole-file replacement shared by the JSON-backed stores.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{StorageError, StorageResult};

/// Replace `path` with `text`: temp file in the same directory, fsync, rename.
///
/// On failure the previous contents stay on disk and the temp file is
/// removed.
pub(crate) fn write_atomically(path: &Path, text: &str) -> StorageResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
    temp.write_all(text.as_bytes())
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| StorageError::io(temp.path(), e))?;

    temp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

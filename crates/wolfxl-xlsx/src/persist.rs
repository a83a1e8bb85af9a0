//! Write-then-rename persistence for flush targets.
//!
//! The package is written to a temp file next to the destination, synced, and renamed
//! over the destination. A failure at any step leaves the destination untouched.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::XlsxError;

fn parent_dir_or_dot(path: &Path) -> &Path {
    // `Path::parent` is `Some("")` for a bare file name.
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Atomically replace `dest` with whatever `write_fn` writes.
///
/// Errors from `write_fn` pass through unchanged; I/O errors from the temp file and the
/// rename are reported as [`XlsxError::WriteFailure`].
pub(crate) fn atomic_write<T>(
    dest: &Path,
    write_fn: impl FnOnce(&mut File) -> Result<T, XlsxError>,
) -> Result<T, XlsxError> {
    let failure = |source: io::Error| XlsxError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    };
    let dir = parent_dir_or_dot(dest);
    fs::create_dir_all(dir).map_err(failure)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(failure)?;
    let out = write_fn(tmp.as_file_mut()).map_err(|err| err.into_write_failure(dest))?;

    tmp.as_file_mut().flush().map_err(failure)?;
    tmp.as_file().sync_all().map_err(failure)?;
    tmp.persist(dest).map_err(|err| failure(err.error))?;

    // The file is already in place; a failed directory sync is not a write failure.
    let _ = sync_parent_dir(dest);
    log::debug!("persisted {}", dest.display());
    Ok(out)
}

fn sync_parent_dir(path: &Path) -> io::Result<()> {
    File::open(parent_dir_or_dot(path))?.sync_all()
}

//! Reading an image into memory and writing it back.

use log::debug;
use snafu::{ensure, ResultExt};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{MissingFile, ReadImage, Result, WriteImage};

/// Read the whole image at `path`.
pub(crate) fn load(path: &Path) -> Result<Vec<u8>> {
    ensure!(path.exists(), MissingFile { path });
    let data = fs::read(path).context(ReadImage { path })?;
    debug!("Loaded {} bytes from {}", data.len(), path.display());
    Ok(data)
}

/// Replace the file at `path` with `data`.
///
/// Symlinks are followed, so the file they point to is the one replaced. The new contents go to
/// a fresh sibling of that file carrying its permissions, which is synced and then renamed over
/// it, so readers see either the old image or the new one. An existing file with the temporary
/// name is never overwritten; the save fails instead.
pub(crate) fn save(path: &Path, data: &[u8]) -> Result<()> {
    let target = fs::canonicalize(path).context(WriteImage { path })?;
    let permissions = fs::metadata(&target)
        .context(WriteImage { path })?
        .permissions();

    let tmp_path = temp_path(&target);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .context(WriteImage { path: &tmp_path })?;

    let result =
        write_synced(file, data, permissions).and_then(|()| fs::rename(&tmp_path, &target));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.context(WriteImage { path })?;

    debug!("Wrote {} bytes to {}", data.len(), target.display());
    Ok(())
}

fn write_synced(mut file: File, data: &[u8], permissions: Permissions) -> std::io::Result<()> {
    file.write_all(data)?;
    file.set_permissions(permissions)?;
    file.sync_all()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("image"));
    name.push(".tmp");
    path.with_file_name(name)
}

//! JSON file helpers shared by the index and thread files.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Serialize `value` and replace `path` with it (write to temp, then rename).
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    pretty: bool,
) -> Result<()> {
    let json = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };

    write_bytes_atomic(path, &json)
}

/// Replace `path` with `bytes` via `<path>.tmp`. A failed write leaves the
/// previous file untouched.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = temp_path(path);
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// `<path>.tmp`, the staging file used by the atomic writers.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Outcome of reading a JSON file that may be absent or damaged.
pub(crate) enum JsonFile<T> {
    Missing,
    Corrupt(serde_json::Error),
    Loaded(T),
}

/// Read and parse a JSON file. IO errors other than "not found" propagate.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<JsonFile<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(JsonFile::Missing),
        Err(e) => return Err(e.into()),
    };

    Ok(match serde_json::from_slice(&bytes) {
        Ok(value) => JsonFile::Loaded(value),
        Err(e) => JsonFile::Corrupt(e),
    })
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

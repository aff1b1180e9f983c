//! Persisted metadata: one [`FolderSummary`] per folder and one [`StoreSummary`] per store.
//!
//! Both are JSON documents replaced atomically on save.

use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

mod folder;
pub use self::folder::{FolderSummary, MessageInfo};

mod store;
pub use self::store::{FolderFlag, FolderFlags, FolderRecord, StoreSummary};

/// Replace `path` with `value` serialized as JSON, via a temporary file in the same directory.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| Error::summary(path, e))?;
    let data = serde_json::to_vec(value).map_err(|e| Error::summary(path, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::summary(path, e))?;
    tmp.write_all(&data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::summary(path, e))?;
    tmp.persist(path).map_err(|e| Error::summary(path, e.error))?;
    Ok(())
}

/// Read a JSON document; a missing file yields `None`.
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::summary(path, e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| Error::summary(path, e))
}

//! The per-folder on-disk message cache.
//!
//! Each entry is one file named `<uid>.<part>` in the folder's cache directory; the full
//! message uses the empty part and is stored as `<uid>.`. Entries are written to a temporary
//! file and renamed into place, so a reader sees either the old entry, no entry, or the
//! complete new one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, Result, ValidateError};
use crate::types::{MessageId, Uid};

const TEMP_SUFFIX: &str = ".tmp~";

/// Maps `(message, part)` to bytes on disk.
#[derive(Debug)]
pub struct MessageCache {
    dir: PathBuf,
    index: Mutex<BTreeMap<MessageId, BTreeSet<String>>>,
}

fn check_part(part: &str) -> Result<()> {
    match part.chars().find(|&c| c == '/' || c == '\0' || c == '\\') {
        Some(c) => Err(Error::Validate(ValidateError(c))),
        None => Ok(()),
    }
}

fn file_name(uid: &MessageId, part: &str) -> String {
    format!("{}.{}", uid, part)
}

impl MessageCache {
    /// Open (creating if needed) the cache rooted at `dir` and index what is already there.
    /// Leftover temporary files from an interrupted write are removed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<MessageCache> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::cache(&dir, e))?;
        let mut index: BTreeMap<MessageId, BTreeSet<String>> = BTreeMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::cache(&dir, e))? {
            let entry = entry.map_err(|e| Error::cache(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let Some((uid, part)) = name.split_once('.') else {
                continue;
            };
            match uid.parse::<MessageId>() {
                Ok(uid) => {
                    index.entry(uid).or_default().insert(part.to_string());
                }
                Err(_) => debug!("ignoring stray cache file {}", name),
            }
        }
        Ok(MessageCache {
            dir,
            index: Mutex::new(index),
        })
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, uid: &MessageId, part: &str) -> PathBuf {
        self.dir.join(file_name(uid, part))
    }

    fn index(&self) -> std::sync::MutexGuard<'_, BTreeMap<MessageId, BTreeSet<String>>> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether `(uid, part)` is cached.
    pub fn contains(&self, uid: &MessageId, part: &str) -> bool {
        self.index()
            .get(uid)
            .map(|parts| parts.contains(part))
            .unwrap_or(false)
    }

    /// A readable handle to the cached entry, if present.
    pub fn get(&self, uid: &MessageId, part: &str) -> Result<Option<File>> {
        let index = self.index();
        if !index.get(uid).map(|p| p.contains(part)).unwrap_or(false) {
            return Ok(None);
        }
        let path = self.path(uid, part);
        match File::open(&path) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::cache(path, e)),
        }
    }

    /// The cached bytes, if present.
    pub fn get_bytes(&self, uid: &MessageId, part: &str) -> Result<Option<Vec<u8>>> {
        match self.get(uid, part)? {
            Some(mut f) => {
                let mut data = Vec::new();
                f.read_to_end(&mut data)
                    .map_err(|e| Error::cache(self.path(uid, part), e))?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Store `data` as `(uid, part)`, replacing any previous entry, and return a handle to read
    /// it back.
    pub fn insert(&self, uid: &MessageId, part: &str, data: &[u8]) -> Result<File> {
        check_part(part)?;
        let mut index = self.index();
        let path = self.path(uid, part);
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| Error::cache(&path, e))?;
        tmp.write_all(data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::cache(&path, e))?;
        tmp.persist(&path).map_err(|e| Error::cache(&path, e.error))?;
        index.entry(*uid).or_default().insert(part.to_string());
        File::open(&path).map_err(|e| Error::cache(path, e))
    }

    /// Drop every part cached for `uid`.
    pub fn remove(&self, uid: &MessageId) -> Result<()> {
        let mut index = self.index();
        if let Some(parts) = index.remove(uid) {
            for part in parts {
                let path = self.path(uid, &part);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::cache(path, e)),
                }
            }
        }
        Ok(())
    }

    /// Move all parts of `from` to `to`, used when a synthetic id is resolved to a real UID.
    pub fn rename(&self, from: &MessageId, to: &MessageId) -> Result<()> {
        let mut index = self.index();
        let Some(parts) = index.remove(from) else {
            return Ok(());
        };
        for part in &parts {
            let src = self.path(from, part);
            let dst = self.path(to, part);
            if let Err(e) = fs::rename(&src, &dst) {
                warn!("could not move cached {} to {}: {}", src.display(), dst.display(), e);
            }
        }
        index.entry(*to).or_default().extend(parts);
        Ok(())
    }

    /// Duplicate every part of `src_uid` in `src` as `dst_uid` in `dst`.
    pub fn copy(
        src: &MessageCache,
        src_uid: &MessageId,
        dst: &MessageCache,
        dst_uid: &MessageId,
    ) -> Result<()> {
        let parts: Vec<String> = match src.index().get(src_uid) {
            Some(parts) => parts.iter().cloned().collect(),
            None => return Ok(()),
        };
        for part in parts {
            if let Some(data) = src.get_bytes(src_uid, &part)? {
                dst.insert(dst_uid, &part, &data)?;
            }
        }
        Ok(())
    }

    /// The highest real UID with anything cached.
    pub fn max_uid(&self) -> Option<Uid> {
        self.index().keys().filter_map(MessageId::real).max()
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        let mut index = self.index();
        for (uid, parts) in std::mem::take(&mut *index) {
            for part in parts {
                let path = self.path(&uid, &part);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(Error::cache(path, e));
                    }
                }
            }
        }
        Ok(())
    }

    /// Every message with at least one cached part.
    pub fn uids(&self) -> Vec<MessageId> {
        self.index().keys().copied().collect()
    }
}

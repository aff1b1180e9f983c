//! The disconnected-operation diary: a durable log of mutations made while offline, replayed
//! in order once the store is back online.
//!
//! The diary is a JSON-lines file. Each line is either an action or the resolution of a
//! synthetic id to the UID the server assigned on replay. Resolutions are kept until the diary
//! is empty, since later actions may still refer to the synthetic ids.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{MessageId, SyntheticId, Uid};

/// One mutation made while offline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiaryAction {
    /// A message was appended to `folder` as `uid`; its bytes are in that folder's cache and its
    /// flags in its summary.
    Append { folder: String, uid: MessageId },
    /// `uids` were copied (or moved, if `delete_originals`) from `source` to `dest`, where they
    /// became `dest_uids`. Real UIDs in `uids` belong to the source's `uid_validity`.
    Transfer {
        source: String,
        dest: String,
        uids: Vec<MessageId>,
        dest_uids: Vec<MessageId>,
        delete_originals: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid_validity: Option<u32>,
    },
    /// `uids` were expunged from `folder` while it had `uid_validity`.
    Expunge {
        folder: String,
        uids: Vec<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid_validity: Option<u32>,
    },
}

impl DiaryAction {
    /// The folders this action touches.
    pub fn folders(&self) -> Vec<&str> {
        match self {
            DiaryAction::Append { folder, .. } | DiaryAction::Expunge { folder, .. } => {
                vec![folder.as_str()]
            }
            DiaryAction::Transfer { source, dest, .. } => vec![source.as_str(), dest.as_str()],
        }
    }
}

/// An action and when it was logged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub action: DiaryAction,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Entry(DiaryEntry),
    Resolved {
        folder: String,
        synthetic: MessageId,
        real: Uid,
    },
}

/// Replays diary actions against the server.
pub trait Replay {
    /// Perform `action` online. Retryable errors stop the replay with the action kept;
    /// any other error drops the action.
    fn replay(&self, diary: &Diary, action: &DiaryAction) -> Result<()>;
}

/// What a replay pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Actions performed.
    pub replayed: usize,
    /// Actions dropped after a permanent failure.
    pub dropped: usize,
}

struct State {
    file: File,
    entries: VecDeque<DiaryEntry>,
    uidmap: HashMap<(String, SyntheticId), Uid>,
}

/// The durable queue of offline actions plus the synthetic-to-real UID map.
pub struct Diary {
    path: PathBuf,
    state: Mutex<State>,
    replaying: Mutex<()>,
}

impl std::fmt::Debug for Diary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diary").field("path", &self.path).finish()
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::summary(path, e))
}

impl Diary {
    /// Open the diary at `path`, loading any actions left from a previous run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Diary> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Error::summary(&path, e))?;
        }
        let mut entries = VecDeque::new();
        let mut uidmap = HashMap::new();
        let mut torn = false;
        match File::open(&path) {
            Ok(f) => {
                for (n, line) in BufReader::new(f).lines().enumerate() {
                    let line = line.map_err(|e| Error::summary(&path, e))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Record>(&line) {
                        Ok(Record::Entry(entry)) => entries.push_back(entry),
                        Ok(Record::Resolved {
                            folder,
                            synthetic: MessageId::Synthetic(id),
                            real,
                        }) => {
                            uidmap.insert((folder, id), real);
                        }
                        Ok(Record::Resolved { synthetic, .. }) => {
                            debug!("ignoring resolution of real uid {}", synthetic)
                        }
                        // most likely a write torn by a crash
                        Err(e) => {
                            warn!("skipping unreadable diary line {}: {}", n + 1, e);
                            torn = true;
                        }
                    }
                }
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(Error::summary(&path, e)),
        }
        if !entries.is_empty() {
            info!(pending = entries.len(), "diary has actions to replay");
        }
        let file = open_append(&path)?;
        let diary = Diary {
            path,
            state: Mutex::new(State {
                file,
                entries,
                uidmap,
            }),
            replaying: Mutex::new(()),
        };
        if torn {
            diary.compact()?;
        }
        Ok(diary)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_record(&self, state: &mut State, record: &Record) -> Result<()> {
        let mut line = serde_json::to_vec(record).map_err(|e| Error::summary(&self.path, e))?;
        line.push(b'\n');
        state
            .file
            .write_all(&line)
            .and_then(|_| state.file.sync_data())
            .map_err(|e| Error::summary(&self.path, e))
    }

    /// Make every later write fail, as a full disk would.
    #[cfg(test)]
    pub(crate) fn break_writes(&self) {
        let mut state = self.state();
        if let Ok(file) = File::open(&self.path) {
            state.file = file;
        }
    }

    /// Record `action`. It is on disk when this returns.
    pub fn log(&self, action: DiaryAction) -> Result<()> {
        let entry = DiaryEntry {
            action,
            logged_at: Utc::now(),
        };
        let mut state = self.state();
        let record = Record::Entry(entry);
        self.write_record(&mut state, &record)?;
        if let Record::Entry(entry) = record {
            debug!(action = ?entry.action, "logged offline action");
            state.entries.push_back(entry);
        }
        Ok(())
    }

    /// Pending actions, oldest first.
    pub fn entries(&self) -> Vec<DiaryEntry> {
        self.state().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Remember that `synthetic` in `folder` is now `real` on the server.
    pub fn uidmap_add(&self, folder: &str, synthetic: SyntheticId, real: Uid) -> Result<()> {
        let mut state = self.state();
        let record = Record::Resolved {
            folder: folder.to_string(),
            synthetic: MessageId::Synthetic(synthetic),
            real,
        };
        self.write_record(&mut state, &record)?;
        state.uidmap.insert((folder.to_string(), synthetic), real);
        Ok(())
    }

    /// The real UID `synthetic` was resolved to, if known.
    pub fn uidmap_lookup(&self, folder: &str, synthetic: &SyntheticId) -> Option<Uid> {
        self.state()
            .uidmap
            .get(&(folder.to_string(), *synthetic))
            .copied()
    }

    /// The server UID for `id`: itself if real, its resolution if synthetic.
    pub fn resolve(&self, folder: &str, id: &MessageId) -> Option<Uid> {
        match id {
            MessageId::Real(uid) => Some(*uid),
            MessageId::Synthetic(synthetic) => self.uidmap_lookup(folder, synthetic),
        }
    }

    /// Replay every pending action in order.
    ///
    /// Stops at the first retryable failure, leaving that action and the ones after it in the
    /// diary. Actions that fail permanently are logged and dropped. The file is compacted
    /// afterwards either way.
    pub fn replay_all(&self, replayer: &impl Replay) -> Result<ReplayOutcome> {
        let _replaying = match self.replaying.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut outcome = ReplayOutcome::default();
        let result = loop {
            let Some(entry) = self.state().entries.front().cloned() else {
                break Ok(outcome);
            };
            match replayer.replay(self, &entry.action) {
                Ok(()) => {
                    outcome.replayed += 1;
                }
                Err(e) if e.is_retryable() => {
                    info!("diary replay interrupted: {}", e);
                    break Err(e);
                }
                Err(e) => {
                    warn!(action = ?entry.action, "dropping diary action: {}", e);
                    outcome.dropped += 1;
                }
            }
            self.state().entries.pop_front();
        };
        self.compact()?;
        if result.is_ok() {
            info!(
                replayed = outcome.replayed,
                dropped = outcome.dropped,
                "diary replay finished"
            );
        }
        result
    }

    /// Rewrite the file with only what is still needed.
    fn compact(&self) -> Result<()> {
        let mut state = self.state();
        if state.entries.is_empty() {
            state.uidmap.clear();
        }
        let mut data = Vec::new();
        let resolved: Vec<Record> = state
            .uidmap
            .iter()
            .map(|((folder, synthetic), real)| Record::Resolved {
                folder: folder.clone(),
                synthetic: MessageId::Synthetic(*synthetic),
                real: *real,
            })
            .collect();
        let pending = state.entries.iter().cloned().map(Record::Entry);
        for record in resolved.into_iter().chain(pending) {
            serde_json::to_writer(&mut data, &record).map_err(|e| Error::summary(&self.path, e))?;
            data.push(b'\n');
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::summary(&self.path, e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::summary(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::summary(&self.path, e.error))?;
        state.file = open_append(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyntheticKind;
    use std::cell::RefCell;

    fn append(serial: u32) -> DiaryAction {
        DiaryAction::Append {
            folder: "INBOX".into(),
            uid: MessageId::Synthetic(SyntheticId {
                kind: SyntheticKind::Append,
                serial,
            }),
        }
    }

    struct Script {
        results: RefCell<Vec<Result<()>>>,
        seen: RefCell<Vec<DiaryAction>>,
    }

    impl Script {
        fn new(results: Vec<Result<()>>) -> Self {
            Script {
                results: RefCell::new(results),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Replay for Script {
        fn replay(&self, _diary: &Diary, action: &DiaryAction) -> Result<()> {
            self.seen.borrow_mut().push(action.clone());
            self.results.borrow_mut().remove(0)
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diary.jsonl");
        {
            let diary = Diary::open(&path).unwrap();
            diary.log(append(1)).unwrap();
            diary.log(append(2)).unwrap();
            let syn = SyntheticId {
                kind: SyntheticKind::Append,
                serial: 1,
            };
            diary.uidmap_add("INBOX", syn, 77).unwrap();
        }
        let diary = Diary::open(&path).unwrap();
        let actions: Vec<_> = diary.entries().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![append(1), append(2)]);
        let syn = SyntheticId {
            kind: SyntheticKind::Append,
            serial: 1,
        };
        assert_eq!(diary.uidmap_lookup("INBOX", &syn), Some(77));
        assert_eq!(diary.uidmap_lookup("Sent", &syn), None);
        assert_eq!(
            diary.resolve("INBOX", &MessageId::Synthetic(syn)),
            Some(77)
        );
        assert_eq!(diary.resolve("INBOX", &MessageId::Real(5)), Some(5));
    }

    #[test]
    fn torn_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diary.jsonl");
        {
            let diary = Diary::open(&path).unwrap();
            diary.log(append(1)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"record\":\"entry\",\"act").unwrap();
        let diary = Diary::open(&path).unwrap();
        assert_eq!(diary.len(), 1);
        diary.log(append(2)).unwrap();
        drop(diary);
        assert_eq!(Diary::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn permanent_failures_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diary.jsonl");
        let diary = Diary::open(&path).unwrap();
        for n in 1..=3 {
            diary.log(append(n)).unwrap();
        }
        let script = Script::new(vec![
            Ok(()),
            Err(Error::InconsistentState("append-2 is gone".into())),
            Ok(()),
        ]);
        let outcome = diary.replay_all(&script).unwrap();
        assert_eq!(
            outcome,
            ReplayOutcome {
                replayed: 2,
                dropped: 1
            }
        );
        assert!(diary.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn retryable_failure_keeps_remaining_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diary.jsonl");
        let diary = Diary::open(&path).unwrap();
        for n in 1..=3 {
            diary.log(append(n)).unwrap();
        }
        let script = Script::new(vec![Ok(()), Err(Error::ConnectionLost)]);
        let err = diary.replay_all(&script).unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
        assert_eq!(script.seen.borrow().len(), 2);

        let reopened = Diary::open(&path).unwrap();
        let actions: Vec<_> = reopened.entries().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![append(2), append(3)]);
    }

    #[test]
    fn action_json_shape() {
        let json = serde_json::to_value(&DiaryAction::Expunge {
            folder: "Trash".into(),
            uids: vec![MessageId::Real(4)],
            uid_validity: Some(1200),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "expunge", "folder": "Trash", "uids": ["4"], "uid_validity": 1200})
        );
        // entries written before the field existed still load
        let old: DiaryAction =
            serde_json::from_str(r#"{"op":"expunge","folder":"Trash","uids":["4"]}"#).unwrap();
        assert_eq!(
            old,
            DiaryAction::Expunge {
                folder: "Trash".into(),
                uids: vec![MessageId::Real(4)],
                uid_validity: None,
            }
        );
    }
}

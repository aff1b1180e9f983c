//! The store: one account's connection, folder hierarchy, folder registry and diary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::authenticator::CredentialProvider;
use crate::cancel::Cancellable;
use crate::config::StoreConfig;
use crate::conn::Connector;
use crate::diary::{Diary, DiaryAction, Replay, ReplayOutcome};
use crate::error::{Error, ErrorKind, Result};
use crate::folder::{Folder, FolderSyncState, ImapFolder};
use crate::summary::{FolderFlag, FolderFlags, FolderRecord, StoreSummary};
use crate::types::{Capabilities, DiscoMode, MailboxStatus, MessageId};

pub mod namespace;
pub(crate) mod session;

pub use self::namespace::Namespace;
use self::namespace::wildcard_match;
use self::session::Session;

const STORE_SUMMARY_FILE: &str = "store-summary.json";
const DIARY_FILE: &str = "diary.jsonl";
const FOLDERS_DIR: &str = "folders";
const SUBFOLDERS_DIR: &str = "subfolders";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    connector: Box<dyn Connector>,
    credentials: Box<dyn CredentialProvider>,
    mode: RwLock<DiscoMode>,
    /// The command lock. `None` while offline.
    session: Mutex<Option<Session>>,
    summary: Mutex<StoreSummary>,
    namespace: RwLock<Namespace>,
    folders: Mutex<HashMap<String, ImapFolder>>,
    diary: Diary,
    /// Background housekeeping, such as folder list refreshes.
    workers: ThreadPool,
    cancel: Cancellable,
}

impl StoreInner {
    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn diary(&self) -> &Diary {
        &self.diary
    }

    pub(crate) fn cancel(&self) -> &Cancellable {
        &self.cancel
    }

    pub(crate) fn mode(&self) -> DiscoMode {
        match self.mode.read() {
            Ok(m) => *m,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_mode(&self, mode: DiscoMode) {
        match self.mode.write() {
            Ok(mut m) => *m = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
    }

    fn namespace(&self) -> Namespace {
        match self.namespace.read() {
            Ok(ns) => ns.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn summary_path(&self) -> PathBuf {
        self.config.data_dir.join(STORE_SUMMARY_FILE)
    }

    /// Run `f` with the session locked. A transport failure drops the session and takes the
    /// store offline.
    pub(crate) fn command<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.session);
        let Some(session) = guard.as_mut() else {
            return Err(Error::Offline("not connected".to_string()));
        };
        let result = f(session);
        if let Err(ref e) = result {
            if e.kind() == ErrorKind::Connection {
                guard.take();
                drop(guard);
                warn!("connection lost: {}", e);
                self.went_offline();
            }
        }
        result
    }

    fn went_offline(&self) {
        self.set_mode(DiscoMode::Offline);
        let folders: Vec<ImapFolder> = lock(&self.folders).values().cloned().collect();
        for folder in folders {
            folder.set_sync_state(FolderSyncState::Disconnected);
        }
    }

    /// Another folder got selected while `path` had updates we could not apply.
    pub(crate) fn mark_needs_rescan(&self, path: &str) {
        if let Some(folder) = lock(&self.folders).get(path) {
            debug!(folder = path, "sequence mapping lost, will rescan");
            folder.set_sync_state(FolderSyncState::NeedsRescan);
        }
    }

    /// Remember a folder's counts in the store summary.
    pub(crate) fn record_counts(&self, path: &str, total: u32, unread: u32, uid_validity: Option<u32>) {
        let mut summary = lock(&self.summary);
        let changed = summary.update(path, |r| {
            r.total = total;
            r.unread = unread;
            r.uid_validity = uid_validity;
        });
        if changed {
            if let Err(e) = summary.save(&self.summary_path()) {
                warn!("could not save store summary: {}", e);
            }
        }
    }

    /// Where a folder's summary and cache live: `folders/A/subfolders/B`.
    fn folder_dir(&self, path: &str) -> PathBuf {
        let mut dir = self.config.data_dir.join(FOLDERS_DIR);
        for (i, component) in path.split('/').enumerate() {
            if i > 0 {
                dir.push(SUBFOLDERS_DIR);
            }
            match component {
                "." => dir.push("%2E"),
                ".." => dir.push("%2E%2E"),
                c => dir.push(c),
            }
        }
        dir
    }

    /// Drop registry entries at or below `path`.
    fn forget_folders(&self, path: &str) {
        let mut folders = lock(&self.folders);
        let doomed: Vec<String> = folders
            .keys()
            .filter(|p| in_subtree(p, path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(folder) = folders.remove(&p) {
                folder.set_sync_state(FolderSyncState::Disconnected);
            }
        }
    }
}

fn in_subtree(path: &str, top: &str) -> bool {
    top.is_empty()
        || path == top
        || (path.starts_with(top) && path[top.len()..].starts_with('/'))
}

/// Whether `path` is `top` itself or one level below it.
fn within_depth(path: &str, top: &str) -> bool {
    if top.is_empty() {
        return !path.contains('/');
    }
    path == top || path[top.len() + 1..].find('/').is_none()
}

/// One IMAP account mirrored to disk. Clones share the same store.
///
/// The store starts offline; [`connect`](ImapStore::connect) brings it online and replays
/// anything done in between.
#[derive(Clone)]
pub struct ImapStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ImapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapStore")
            .field("host", &self.inner.config.host)
            .field("mode", &self.inner.mode())
            .finish()
    }
}

impl ImapStore {
    /// Open the mirror in `config.data_dir`. Nothing is sent to the server yet.
    pub fn new(
        config: StoreConfig,
        connector: impl Connector + 'static,
        credentials: impl CredentialProvider + 'static,
    ) -> Result<ImapStore> {
        fs::create_dir_all(&config.data_dir).map_err(|e| Error::cache(&config.data_dir, e))?;
        let summary = StoreSummary::load(&config.data_dir.join(STORE_SUMMARY_FILE))?;
        let namespace = match (&config.namespace, &summary.namespace) {
            (Some(prefix), _) => Namespace::new(prefix, summary.separator),
            (None, Some(prefix)) => Namespace::new(prefix, summary.separator),
            (None, None) => Namespace::default(),
        };
        let diary = Diary::open(config.data_dir.join(DIARY_FILE))?;
        let workers = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.max(1))
            .thread_name(|i| format!("imap-store-{}", i))
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(ImapStore {
            inner: Arc::new(StoreInner {
                config,
                connector: Box::new(connector),
                credentials: Box::new(credentials),
                mode: RwLock::new(DiscoMode::Offline),
                session: Mutex::new(None),
                summary: Mutex::new(summary),
                namespace: RwLock::new(namespace),
                folders: Mutex::new(HashMap::new()),
                diary,
                workers,
                cancel: Cancellable::new(),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> DiscoMode {
        self.inner.mode()
    }

    /// The flag long operations poll. Cancelling it makes them stop at the next batch.
    pub fn cancellable(&self) -> Cancellable {
        self.inner.cancel.clone()
    }

    pub fn namespace(&self) -> Namespace {
        self.inner.namespace()
    }

    /// The offline actions not yet replayed.
    pub fn diary(&self) -> &Diary {
        &self.inner.diary
    }

    /// What the server advertised after login, while connected.
    pub fn capabilities(&self) -> Option<Capabilities> {
        lock(&self.inner.session)
            .as_ref()
            .map(|s| s.capabilities.clone())
    }

    /// Log in, learn the namespace, replay the diary and go online.
    ///
    /// If the replay is interrupted by another connection failure the store stays offline and
    /// the remaining actions are kept for next time.
    pub fn connect(&self) -> Result<ReplayOutcome> {
        {
            let mut guard = lock(&self.inner.session);
            if guard.is_some() && self.mode() == DiscoMode::Online {
                return Ok(ReplayOutcome::default());
            }
            let session = Session::open(
                &self.inner.config,
                self.inner.connector.as_ref(),
                self.inner.credentials.as_ref(),
                &self.inner.cancel,
            )?;
            *guard = Some(session);
        }
        if let Err(e) = self.resolve_namespace() {
            self.drop_session();
            return Err(e);
        }
        self.inner.set_mode(DiscoMode::Resyncing);
        match self.inner.diary.replay_all(self) {
            Ok(outcome) => {
                self.inner.set_mode(DiscoMode::Online);
                info!(host = %self.inner.config.host, "online");
                Ok(outcome)
            }
            Err(e) => {
                self.drop_session();
                Err(e)
            }
        }
    }

    fn drop_session(&self) {
        if let Some(session) = lock(&self.inner.session).take() {
            session.logout();
        }
        self.inner.went_offline();
    }

    /// Log out and go offline.
    pub fn disconnect(&self) -> Result<()> {
        self.drop_session();
        info!(host = %self.inner.config.host, "offline");
        lock(&self.inner.summary).save(&self.inner.summary_path())
    }

    /// Push pending flag changes in every open folder, then disconnect.
    pub fn set_offline(&self) -> Result<()> {
        if self.mode() == DiscoMode::Online {
            let folders: Vec<ImapFolder> = lock(&self.inner.folders).values().cloned().collect();
            for folder in folders {
                if let Err(e) = folder.sync(false) {
                    warn!(folder = %folder.path(), "could not sync before going offline: {}", e);
                }
            }
        }
        self.disconnect()
    }

    /// Learn the personal namespace and hierarchy separator.
    pub fn resolve_namespace(&self) -> Result<Namespace> {
        let configured = self.inner.config.namespace.clone();
        let namespace = self.inner.command(|session| {
            let (prefix, delimiter) = match configured {
                Some(prefix) => (prefix, None),
                None if session.has("NAMESPACE") => {
                    match session.namespace()?.into_iter().next() {
                        Some(entry) => (entry.prefix, entry.delimiter),
                        None => (String::new(), None),
                    }
                }
                None => (String::new(), None),
            };
            let delimiter = match delimiter {
                Some(d) => Some(d),
                None => session
                    .list("", &prefix)?
                    .first()
                    .and_then(|n| n.delimiter()),
            };
            Ok(Namespace::new(&prefix, delimiter))
        })?;
        debug!(prefix = namespace.prefix(), separator = %namespace.separator(), "namespace");
        match self.inner.namespace.write() {
            Ok(mut ns) => *ns = namespace.clone(),
            Err(poisoned) => *poisoned.into_inner() = namespace.clone(),
        }
        let mut summary = lock(&self.inner.summary);
        summary.set_namespace(namespace.prefix().to_string(), Some(namespace.separator()));
        summary.save(&self.inner.summary_path())?;
        Ok(namespace)
    }

    /// The folder at `path`, creating it on the server if `create` is set.
    pub fn get_folder(&self, path: &str, create: bool) -> Result<ImapFolder> {
        if let Some(folder) = lock(&self.inner.folders).get(path) {
            return Ok(folder.clone());
        }
        let namespace = self.namespace();
        let known = lock(&self.inner.summary).get(path).cloned();
        let record = match known {
            Some(record) => record,
            None if self.mode() == DiscoMode::Offline => {
                return Err(Error::NoSuchFolder(path.to_string()))
            }
            None => {
                let full = namespace.path_to_full(path);
                let record = self.inner.command(|session| {
                    let mut names = list(session, &full)?;
                    if names.is_empty() && create {
                        info!(folder = path, "creating folder");
                        session.create(&full)?;
                        names = list(session, &full)?;
                    }
                    Ok(names.into_iter().next().map(|flags| {
                        let mut record = FolderRecord::new(path, full.as_str());
                        record.flags = flags;
                        record
                    }))
                })?;
                let record = record.ok_or_else(|| Error::NoSuchFolder(path.to_string()))?;
                let mut summary = lock(&self.inner.summary);
                summary.insert(record.clone());
                summary.save(&self.inner.summary_path())?;
                record
            }
        };
        let folder = ImapFolder::open(
            Arc::downgrade(&self.inner),
            path,
            &record.full_name,
            self.inner.folder_dir(path),
        )?;
        let mut folders = lock(&self.inner.folders);
        Ok(folders.entry(path.to_string()).or_insert(folder).clone())
    }

    /// The folders at or below `top` (all of them for `""`). Online this asks the server and
    /// updates the store summary; offline it answers from the summary.
    pub fn list_folders(&self, top: &str, recursive: bool) -> Result<Vec<FolderRecord>> {
        let namespace = self.namespace();
        let patterns = namespace.list_patterns(top, recursive);
        if self.mode() == DiscoMode::Offline {
            let summary = lock(&self.inner.summary);
            return Ok(summary
                .folders()
                .filter(|r| {
                    patterns
                        .iter()
                        .any(|p| wildcard_match(p, &r.full_name, namespace.separator()))
                })
                .cloned()
                .collect());
        }

        let use_lsub = self.inner.config.use_lsub;
        let (listed, subscribed) = self.inner.command(|session| {
            let mut listed: BTreeMap<String, FolderFlags> = BTreeMap::new();
            for pattern in &patterns {
                for name in session.list("", pattern)? {
                    let flags = name
                        .attributes()
                        .iter()
                        .filter_map(FolderFlag::from_attribute)
                        .collect();
                    listed.entry(name.name().to_string()).or_insert(flags);
                }
            }
            let subscribed = if use_lsub {
                let mut subscribed = BTreeSet::new();
                for pattern in &patterns {
                    subscribed.extend(
                        session
                            .lsub("", pattern)?
                            .into_iter()
                            .map(|n| n.name().to_string()),
                    );
                }
                Some(subscribed)
            } else {
                None
            };
            Ok((listed, subscribed))
        })?;

        let mut summary = lock(&self.inner.summary);
        let mut out = Vec::with_capacity(listed.len());
        let mut seen = BTreeSet::new();
        for (full, mut flags) in listed {
            let path = namespace.full_to_path(&full);
            let existing = summary.get(&path).cloned();
            let is_subscribed = match &subscribed {
                Some(set) => set.contains(&full),
                None => existing.as_ref().is_some_and(|r| r.is_subscribed()),
            };
            if is_subscribed {
                flags |= FolderFlag::Subscribed;
            }
            let mut record = existing.unwrap_or_else(|| FolderRecord::new(path.as_str(), full.as_str()));
            record.full_name = full;
            record.flags = flags;
            summary.insert(record.clone());
            seen.insert(path);
            out.push(record);
        }
        let gone: Vec<String> = summary
            .subtree(top)
            .filter(|r| recursive || within_depth(&r.path, top))
            .filter(|r| !seen.contains(&r.path))
            .map(|r| r.path.clone())
            .collect();
        for path in gone {
            debug!(folder = %path, "folder no longer on the server");
            summary.remove(&path);
        }
        summary.save(&self.inner.summary_path())?;
        Ok(out)
    }

    /// Refresh the whole folder list on a background thread. The result arrives on the
    /// returned channel.
    pub fn spawn_folder_list_refresh(&self) -> Result<Receiver<Result<Vec<FolderRecord>>>> {
        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&self.inner);
        self.inner.workers.spawn(move || {
            let result = match weak.upgrade() {
                Some(inner) => ImapStore { inner }.list_folders("", true),
                None => Err(Error::Offline("the store has been closed".to_string())),
            };
            if let Err(ref e) = result {
                warn!("background folder refresh failed: {}", e);
            }
            // the caller may have stopped listening
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    pub fn subscribe(&self, path: &str) -> Result<()> {
        self.set_subscribed(path, true)
    }

    pub fn unsubscribe(&self, path: &str) -> Result<()> {
        self.set_subscribed(path, false)
    }

    fn set_subscribed(&self, path: &str, subscribed: bool) -> Result<()> {
        self.require_online("change subscriptions")?;
        let full = self.namespace().path_to_full(path);
        self.inner.command(|session| {
            if subscribed {
                session.subscribe(&full)
            } else {
                session.unsubscribe(&full)
            }
        })?;
        let mut summary = lock(&self.inner.summary);
        let updated = summary.update(path, |r| {
            if subscribed {
                r.flags |= FolderFlag::Subscribed;
            } else {
                r.flags -= FolderFlag::Subscribed;
            }
        });
        if !updated && subscribed && summary.get(path).is_none() {
            let mut record = FolderRecord::new(path, full.as_str());
            record.flags |= FolderFlag::Subscribed;
            summary.insert(record);
        }
        summary.save(&self.inner.summary_path())
    }

    /// Rename a folder and everything below it.
    pub fn rename_folder(&self, old: &str, new: &str) -> Result<()> {
        self.require_online("rename folders")?;
        let namespace = self.namespace();
        let old_full = namespace.path_to_full(old);
        let new_full = namespace.path_to_full(new);
        let was_subscribed = lock(&self.inner.summary)
            .get(old)
            .is_some_and(|r| r.is_subscribed());
        // a folder being renamed must not be saving into its old directory meanwhile
        self.inner.forget_folders(old);
        self.inner.command(|session| {
            session.rename(&old_full, &new_full)?;
            if session.selected.as_deref().is_some_and(|s| in_subtree(s, old)) {
                session.set_selected(None);
            }
            if was_subscribed {
                if let Err(e) = session
                    .unsubscribe(&old_full)
                    .and_then(|_| session.subscribe(&new_full))
                {
                    warn!(folder = old, "could not move subscription: {}", e);
                }
            }
            Ok(())
        })?;
        info!(old, new, "renamed folder");

        let mut summary = lock(&self.inner.summary);
        let moved: Vec<FolderRecord> = summary.subtree(old).cloned().collect();
        for record in moved {
            summary.remove(&record.path);
            let path = format!("{}{}", new, &record.path[old.len()..]);
            let mut renamed = record;
            renamed.full_name = namespace.path_to_full(&path);
            renamed.path = path;
            summary.insert(renamed);
        }
        summary.save(&self.inner.summary_path())?;
        drop(summary);

        let from = self.inner.folder_dir(old);
        let to = self.inner.folder_dir(new);
        if from.exists() {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::cache(parent, e))?;
            }
            fs::rename(&from, &to).map_err(|e| Error::cache(&from, e))?;
        }
        Ok(())
    }

    /// Delete a folder on the server and its local mirror.
    pub fn delete_folder(&self, path: &str) -> Result<()> {
        self.require_online("delete folders")?;
        let full = self.namespace().path_to_full(path);
        let was_subscribed = lock(&self.inner.summary)
            .get(path)
            .is_some_and(|r| r.is_subscribed());
        self.inner.forget_folders(path);
        self.inner.command(|session| {
            session.delete(&full)?;
            if session.selected.as_deref() == Some(path) {
                session.set_selected(None);
            }
            if was_subscribed {
                if let Err(e) = session.unsubscribe(&full) {
                    warn!(folder = path, "could not unsubscribe: {}", e);
                }
            }
            Ok(())
        })?;
        info!(folder = path, "deleted folder");
        let mut summary = lock(&self.inner.summary);
        summary.remove(path);
        summary.save(&self.inner.summary_path())?;
        drop(summary);

        // children keep their own directories under subfolders/
        let dir = self.inner.folder_dir(path);
        for leftover in [dir.join("summary.json"), dir.join("cache")] {
            let removed = if leftover.is_dir() {
                fs::remove_dir_all(&leftover)
            } else if leftover.exists() {
                fs::remove_file(&leftover)
            } else {
                Ok(())
            };
            removed.map_err(|e| Error::cache(&leftover, e))?;
        }
        if let Err(e) = fs::remove_dir(&dir) {
            debug!("keeping {}: {}", dir.display(), e);
        }
        Ok(())
    }

    /// Message counts for a folder. Online this is a `STATUS`; offline the last known counts.
    pub fn folder_status(&self, path: &str) -> Result<MailboxStatus> {
        if self.mode() == DiscoMode::Offline {
            let summary = lock(&self.inner.summary);
            let record = summary
                .get(path)
                .ok_or_else(|| Error::NoSuchFolder(path.to_string()))?;
            return Ok(MailboxStatus {
                mailbox: record.full_name.clone(),
                messages: Some(record.total),
                recent: None,
                unseen: Some(record.unread),
                uid_next: None,
                uid_validity: record.uid_validity,
            });
        }
        let full = self.namespace().path_to_full(path);
        let status = self.inner.command(|session| session.status(&full))?;
        let mut summary = lock(&self.inner.summary);
        let changed = summary.update(path, |r| {
            if let Some(n) = status.messages {
                r.total = n;
            }
            if let Some(n) = status.unseen {
                r.unread = n;
            }
            r.uid_validity = status.uid_validity.or(r.uid_validity);
        });
        if changed {
            summary.save(&self.inner.summary_path())?;
        }
        Ok(status)
    }

    /// The records the store summary holds, without asking the server.
    pub fn known_folders(&self) -> Vec<FolderRecord> {
        lock(&self.inner.summary).folders().cloned().collect()
    }

    fn require_online(&self, what: &str) -> Result<()> {
        match self.mode() {
            DiscoMode::Offline => Err(Error::Offline(format!("cannot {} while offline", what))),
            DiscoMode::Online | DiscoMode::Resyncing => Ok(()),
        }
    }
}

fn is_inbox(name: &str) -> bool {
    name.eq_ignore_ascii_case("INBOX")
}

/// `LIST "" <full>`: the attributes of that one mailbox, if it exists.
fn list(session: &mut Session, full: &str) -> Result<Vec<FolderFlags>> {
    Ok(session
        .list("", full)?
        .into_iter()
        .filter(|n| n.name() == full || (is_inbox(full) && is_inbox(n.name())))
        .map(|n| {
            n.attributes()
                .iter()
                .filter_map(FolderFlag::from_attribute)
                .collect()
        })
        .collect())
}

impl Replay for ImapStore {
    fn replay(&self, diary: &Diary, action: &DiaryAction) -> Result<()> {
        match action {
            DiaryAction::Append { folder, uid } => match uid {
                MessageId::Synthetic(_) => self.get_folder(folder, false)?.replay_append(diary, *uid),
                MessageId::Real(_) => Ok(()),
            },
            DiaryAction::Transfer {
                source,
                dest,
                uids,
                dest_uids,
                delete_originals,
                uid_validity,
            } => {
                let source = self.get_folder(source, false)?;
                let dest = self.get_folder(dest, false)?;
                source.replay_transfer(
                    diary,
                    uids,
                    *uid_validity,
                    &dest,
                    dest_uids,
                    *delete_originals,
                )
            }
            DiaryAction::Expunge {
                folder,
                uids,
                uid_validity,
            } => self
                .get_folder(folder, false)?
                .replay_expunge(diary, uids, *uid_validity),
        }
    }
}

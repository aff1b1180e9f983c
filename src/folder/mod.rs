//! The local mirror of one mailbox and the operations on it.
//!
//! A folder's summary, cache and counters live behind its state lock. Operations that talk to
//! the server take the state lock first and the store's session lock second, never the other
//! way around, and a folder never holds its own lock while locking another folder.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::warn;

use crate::cache::MessageCache;
use crate::changes::{FolderChanges, Observers, Subscription};
use crate::codec::TransferEncoding;
use crate::error::{Error, Result};
use crate::store::StoreInner;
use crate::summary::{FolderSummary, MessageInfo};
use crate::types::{DiscoMode, MessageFlag, MessageFlags, MessageId, Uid};

mod disco;
mod flags;
mod refresh;

#[cfg(test)]
mod tests;

const SUMMARY_FILE: &str = "summary.json";
const CACHE_DIR: &str = "cache";

/// How far a folder's summary can be trusted against the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderSyncState {
    /// No live connection; the summary is what was last seen.
    Disconnected,
    /// Sequence numbers line up with the summary's real rows.
    InSync,
    /// The sequence mapping is suspect; the next refresh does a full rescan.
    NeedsRescan,
}

/// The mutating operations, once per connectivity mode.
///
/// Callers normally use the dispatching methods of [`Folder`] instead.
pub trait DiscoFolder {
    /// The mode the owning store is in.
    fn disco_mode(&self) -> DiscoMode;

    /// Push local flag changes, then expunge `\Deleted` messages if asked.
    fn sync_online(&self, expunge: bool) -> Result<()>;
    /// Save local state; expunging only removes messages locally and is journaled.
    fn sync_offline(&self, expunge: bool) -> Result<()>;
    fn sync_resyncing(&self, expunge: bool) -> Result<()>;

    /// Permanently remove `uids`.
    fn expunge_uids_online(&self, uids: &[MessageId]) -> Result<()>;
    fn expunge_uids_offline(&self, uids: &[MessageId]) -> Result<()>;
    /// Like online, but ids may still be synthetic and other `\Deleted` messages are left
    /// alone even without UIDPLUS.
    fn expunge_uids_resyncing(&self, uids: &[MessageId]) -> Result<()>;

    /// Add a message. Returns its id when it is known.
    fn append_online(&self, message: &[u8], flags: MessageFlags) -> Result<Option<MessageId>>;
    fn append_offline(&self, message: &[u8], flags: MessageFlags) -> Result<Option<MessageId>>;
    fn append_resyncing(&self, message: &[u8], flags: MessageFlags)
        -> Result<Option<MessageId>>;

    /// Copy `uids` into `dest`, marking the originals `\Deleted` if `delete_originals`.
    /// Returns the ids the copies got in `dest`, where known.
    fn transfer_online(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>>
    where
        Self: Sized;
    fn transfer_offline(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>>
    where
        Self: Sized;
    fn transfer_resyncing(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>>
    where
        Self: Sized;
}

/// The operations a mail client uses on a folder.
pub trait Folder: DiscoFolder + Sized {
    /// Bring the summary up to date with the server. Offline this does nothing.
    fn refresh_info(&self) -> Result<()>;

    /// Throw away the sequence mapping and reconcile every message with the server.
    fn rescan(&self) -> Result<()>;

    /// A snapshot of every row.
    fn messages(&self) -> Vec<MessageInfo>;

    /// The full message, from the cache or the server.
    fn get_message(&self, uid: &MessageId) -> Result<Vec<u8>>;

    /// One body part, fetched with `BODY.PEEK[section]` and decoded.
    fn get_part(
        &self,
        uid: &MessageId,
        section: &str,
        encoding: TransferEncoding,
    ) -> Result<Vec<u8>>;

    /// Set the bits of `mask` to their values in `set`. The change reaches the server on the
    /// next [`sync`](Folder::sync). Returns whether the row changed.
    fn set_message_flags(
        &self,
        uid: &MessageId,
        mask: MessageFlags,
        set: MessageFlags,
    ) -> Result<bool>;

    /// Call `callback` with every batch of changes until the subscription is dropped.
    fn subscribe_changes(
        &self,
        callback: impl Fn(&FolderChanges) + Send + Sync + 'static,
    ) -> Subscription;

    fn sync(&self, expunge: bool) -> Result<()> {
        match self.disco_mode() {
            DiscoMode::Online => self.sync_online(expunge),
            DiscoMode::Offline => self.sync_offline(expunge),
            DiscoMode::Resyncing => self.sync_resyncing(expunge),
        }
    }

    /// Push pending changes, then remove every message marked `\Deleted`.
    fn expunge(&self) -> Result<()> {
        self.sync(false)?;
        let deleted: Vec<MessageId> = self
            .messages()
            .into_iter()
            .filter(|m| m.flags.contains(MessageFlag::Deleted))
            .map(|m| m.uid)
            .collect();
        if deleted.is_empty() {
            return Ok(());
        }
        self.expunge_uids(&deleted)
    }

    fn expunge_uids(&self, uids: &[MessageId]) -> Result<()> {
        match self.disco_mode() {
            DiscoMode::Online => self.expunge_uids_online(uids),
            DiscoMode::Offline => self.expunge_uids_offline(uids),
            DiscoMode::Resyncing => self.expunge_uids_resyncing(uids),
        }
    }

    fn append(&self, message: &[u8], flags: MessageFlags) -> Result<Option<MessageId>> {
        match self.disco_mode() {
            DiscoMode::Online => self.append_online(message, flags),
            DiscoMode::Offline => self.append_offline(message, flags),
            DiscoMode::Resyncing => self.append_resyncing(message, flags),
        }
    }

    fn transfer(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>> {
        match self.disco_mode() {
            DiscoMode::Online => self.transfer_online(uids, dest, delete_originals),
            DiscoMode::Offline => self.transfer_offline(uids, dest, delete_originals),
            DiscoMode::Resyncing => self.transfer_resyncing(uids, dest, delete_originals),
        }
    }

    fn copy_to(&self, uids: &[MessageId], dest: &Self) -> Result<Vec<MessageId>> {
        self.transfer(uids, dest, false)
    }

    fn move_to(&self, uids: &[MessageId], dest: &Self) -> Result<Vec<MessageId>> {
        self.transfer(uids, dest, true)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FolderState {
    summary: FolderSummary,
    /// Flags the server will store for us, from `PERMANENTFLAGS`.
    permanent_mask: MessageFlags,
    read_only: bool,
    /// The server's message count as last reported.
    server_exists: u32,
    /// The UID the next new message will get, as far as we know.
    uid_next: Option<Uid>,
    changes: FolderChanges,
}

pub(crate) struct FolderInner {
    path: String,
    full_name: String,
    dir: PathBuf,
    store: Weak<StoreInner>,
    state: Mutex<FolderState>,
    cache: MessageCache,
    /// A leaf lock: nothing else is locked while it is held.
    sync: Mutex<FolderSyncState>,
    observers: Observers,
}

/// A handle to one folder of an [`ImapStore`](crate::store::ImapStore). Clones share state.
#[derive(Clone)]
pub struct ImapFolder {
    inner: Arc<FolderInner>,
}

impl std::fmt::Debug for ImapFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapFolder")
            .field("path", &self.inner.path)
            .field("full_name", &self.inner.full_name)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ImapFolder {
    /// Open the on-disk mirror in `dir`, creating it if needed.
    pub(crate) fn open(
        store: Weak<StoreInner>,
        path: &str,
        full_name: &str,
        dir: PathBuf,
    ) -> Result<ImapFolder> {
        fs::create_dir_all(&dir).map_err(|e| Error::cache(&dir, e))?;
        let summary = FolderSummary::load(&dir.join(SUMMARY_FILE))?;
        let cache = MessageCache::open(dir.join(CACHE_DIR))?;
        Ok(ImapFolder {
            inner: Arc::new(FolderInner {
                path: path.to_string(),
                full_name: full_name.to_string(),
                dir,
                store,
                state: Mutex::new(FolderState {
                    summary,
                    ..FolderState::default()
                }),
                cache,
                sync: Mutex::new(FolderSyncState::Disconnected),
                observers: Observers::default(),
            }),
        })
    }

    /// The local path, `/`-separated.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The server's name for the mailbox.
    pub fn full_name(&self) -> &str {
        &self.inner.full_name
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn sync_state(&self) -> FolderSyncState {
        *lock(&self.inner.sync)
    }

    pub(crate) fn set_sync_state(&self, state: FolderSyncState) {
        *lock(&self.inner.sync) = state;
    }

    /// The row for `uid`, if there is one.
    pub fn message_info(&self, uid: &MessageId) -> Option<MessageInfo> {
        lock(&self.inner.state).summary.get(uid).cloned()
    }

    /// The UIDVALIDITY the summary belongs to.
    pub fn uid_validity(&self) -> Option<u32> {
        lock(&self.inner.state).summary.uid_validity()
    }

    /// Rows without `\Seen`.
    pub fn unread_count(&self) -> u32 {
        counts(&lock(&self.inner.state)).1
    }

    /// Whether the server opened the mailbox read-only.
    pub fn is_read_only(&self) -> bool {
        lock(&self.inner.state).read_only
    }

    /// Whether a body or part is in the cache.
    pub fn is_cached(&self, uid: &MessageId, section: &str) -> bool {
        self.inner.cache.contains(uid, section)
    }

    pub(crate) fn same_as(&self, other: &ImapFolder) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn store(&self) -> Result<Arc<StoreInner>> {
        self.inner
            .store
            .upgrade()
            .ok_or_else(|| Error::Offline("the store has been closed".to_string()))
    }

    /// Run `f` under the state lock, then deliver the changes it recorded.
    fn with_state<T>(&self, f: impl FnOnce(&mut FolderState) -> Result<T>) -> Result<T> {
        let result = {
            let mut state = lock(&self.inner.state);
            let result = f(&mut state);
            self.inner
                .observers
                .queue(std::mem::take(&mut state.changes));
            result
        };
        self.inner.observers.emit();
        result
    }

    fn save(&self, st: &mut FolderState) -> Result<()> {
        st.summary.save(&self.inner.dir.join(SUMMARY_FILE))
    }

    /// Drop a row and its cached data.
    fn forget(&self, st: &mut FolderState, uid: &MessageId) {
        if st.summary.remove(uid).is_some() {
            st.changes.remove(*uid);
        }
        if let Err(e) = self.inner.cache.remove(uid) {
            warn!(folder = %self.path(), %uid, "could not drop cached data: {}", e);
        }
    }

    /// Tell the store the counts it should remember for this folder.
    fn publish_counts(&self, store: &StoreInner, st: &FolderState) {
        let (total, unread) = counts(st);
        store.record_counts(self.path(), total, unread, st.summary.uid_validity());
    }
}

/// `(total, unread)` over every row.
fn counts(st: &FolderState) -> (u32, u32) {
    let messages = st.summary.messages();
    let unread = messages
        .iter()
        .filter(|m| !m.flags.contains(MessageFlag::Seen))
        .count();
    (messages.len() as u32, unread as u32)
}

impl Folder for ImapFolder {
    fn refresh_info(&self) -> Result<()> {
        match self.disco_mode() {
            DiscoMode::Offline => Ok(()),
            DiscoMode::Online | DiscoMode::Resyncing => self.refresh_online(),
        }
    }

    fn rescan(&self) -> Result<()> {
        match self.disco_mode() {
            DiscoMode::Offline => Err(Error::Offline(format!(
                "cannot rescan {} while offline",
                self.path()
            ))),
            DiscoMode::Online | DiscoMode::Resyncing => {
                self.set_sync_state(FolderSyncState::NeedsRescan);
                self.refresh_online()
            }
        }
    }

    fn messages(&self) -> Vec<MessageInfo> {
        lock(&self.inner.state).summary.messages().to_vec()
    }

    fn get_message(&self, uid: &MessageId) -> Result<Vec<u8>> {
        self.fetch_section(uid, "")
    }

    fn get_part(
        &self,
        uid: &MessageId,
        section: &str,
        encoding: TransferEncoding,
    ) -> Result<Vec<u8>> {
        let raw = self.fetch_section(uid, section)?;
        crate::codec::decode(encoding, &raw)
    }

    fn set_message_flags(
        &self,
        uid: &MessageId,
        mask: MessageFlags,
        set: MessageFlags,
    ) -> Result<bool> {
        self.with_state(|st| {
            if st.summary.get(uid).is_none() {
                return Err(Error::NoSuchMessage(*uid));
            }
            let changed = st.summary.set_flags(uid, mask, set);
            if changed {
                st.changes.change(*uid);
                self.save(st)?;
            }
            Ok(changed)
        })
    }

    fn subscribe_changes(
        &self,
        callback: impl Fn(&FolderChanges) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.observers.subscribe(callback)
    }
}

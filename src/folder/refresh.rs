//! Keeping the summary in step with the server: selection, the fast path for new mail, the full
//! rescan, and untagged mailbox updates.

use tracing::{debug, info, warn};

use super::flags::merge_server_flags;
use super::{FolderState, FolderSyncState, ImapFolder};
use crate::client::{Response, ResponseLine};
use crate::command::{split_uid_sets, Command};
use crate::error::{Error, Result};
use crate::parse::{self, Untagged};
use crate::store::session::Session;
use crate::store::StoreInner;
use crate::summary::MessageInfo;
use crate::types::{DiscoMode, Fetch, MessageFlag, MessageId, Seq, Uid, TRACKED_FLAGS};

impl ImapFolder {
    /// Run `command` with this folder selected and apply the mailbox updates that came with it.
    /// `FETCH` lines are taken as flag updates.
    pub(super) fn exec(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        command: &Command,
    ) -> Result<Response> {
        self.ensure_selected(st, session)?;
        let pending = session.take_unsolicited();
        self.folder_changed(st, &pending, true);
        let response = session.client.send_command(command)?;
        self.folder_changed(st, &response.untagged, true);
        Ok(response)
    }

    pub(super) fn ensure_selected(
        &self,
        st: &mut FolderState,
        session: &mut Session,
    ) -> Result<()> {
        if session.selected.as_deref() == Some(self.path()) {
            return Ok(());
        }
        self.select(st, session)
    }

    /// `SELECT` the mailbox and decide whether the summary still lines up with it.
    pub(super) fn select(&self, st: &mut FolderState, session: &mut Session) -> Result<()> {
        let store = self.store()?;
        let result = session.client.select(self.full_name());
        // a failed SELECT leaves nothing selected
        let now = result.as_ref().ok().map(|_| self.path().to_string());
        if let Some(stale) = session.set_selected(now) {
            if stale != self.path() {
                store.mark_needs_rescan(&stale);
            }
        }
        let mailbox = result?;
        debug!(
            folder = %self.path(),
            exists = mailbox.exists,
            uid_validity = ?mailbox.uid_validity,
            "selected"
        );
        st.permanent_mask = mailbox.permanent_mask();
        st.read_only = mailbox.read_only;
        st.server_exists = mailbox.exists;
        st.uid_next = mailbox.uid_next;

        let mut rescan = self.sync_state() == FolderSyncState::NeedsRescan;
        if let (Some(old), Some(new)) = (st.summary.uid_validity(), mailbox.uid_validity) {
            if old != new {
                info!(
                    folder = %self.path(),
                    old, new, "UIDVALIDITY changed, discarding mirrored messages"
                );
                self.invalidate(st);
                rescan = false;
            }
        }
        st.summary.set_uid_validity(mailbox.uid_validity);

        let local = st.summary.exists();
        if mailbox.exists < local {
            debug!(folder = %self.path(), local, server = mailbox.exists, "mailbox shrank");
            rescan = true;
        } else if local > 0 && !rescan && !self.last_row_matches(st, session, local)? {
            debug!(folder = %self.path(), seq = local, "UID at last known position moved");
            rescan = true;
        }
        self.set_sync_state(if rescan {
            FolderSyncState::NeedsRescan
        } else {
            FolderSyncState::InSync
        });
        Ok(())
    }

    /// Forget every real row of the previous UIDVALIDITY epoch. Synthetic rows survive; they
    /// still have to be replayed.
    fn invalidate(&self, st: &mut FolderState) {
        let stale: Vec<MessageId> = st.summary.real().iter().map(|m| m.uid).collect();
        let pending = st.summary.messages().len() > stale.len()
            || self.inner.cache.uids().iter().any(MessageId::is_synthetic);
        if !pending {
            for uid in stale {
                st.changes.remove(uid);
            }
            st.summary.clear();
            if let Err(e) = self.inner.cache.clear() {
                warn!(folder = %self.path(), "could not empty the cache: {}", e);
            }
            return;
        }
        for uid in &stale {
            self.forget(st, uid);
        }
        for uid in self.inner.cache.uids() {
            if !uid.is_synthetic() {
                self.forget(st, &uid);
            }
        }
    }

    /// Drop cached data of real messages above the highest row, left by expunges we could not
    /// clean up after.
    fn prune_cache(&self, st: &mut FolderState) {
        let last = st.summary.last_real_uid().unwrap_or(0);
        if self.inner.cache.max_uid().map_or(true, |max| max <= last) {
            return;
        }
        for uid in self.inner.cache.uids() {
            if uid.real().is_some_and(|u| u > last) {
                debug!(folder = %self.path(), %uid, "dropping orphaned cache entry");
                self.forget(st, &uid);
            }
        }
    }

    /// Whether the server's message at `seq` is the one the summary has there.
    fn last_row_matches(
        &self,
        st: &FolderState,
        session: &mut Session,
        seq: Seq,
    ) -> Result<bool> {
        let response = session
            .client
            .send_command(&Command::new("FETCH").atom(seq).atom("(UID)"))?;
        let server = parse::parse_fetches(&response.untagged)?
            .into_iter()
            .find(|f| f.message == seq)
            .and_then(|f| f.uid);
        let local = st.summary.index(seq).and_then(|m| m.uid.real());
        Ok(server.is_some() && server == local)
    }

    /// Apply untagged `EXISTS`, `EXPUNGE` and (if `apply_fetch`) flag `FETCH` responses.
    pub(super) fn folder_changed(
        &self,
        st: &mut FolderState,
        lines: &[Vec<u8>],
        apply_fetch: bool,
    ) {
        for line in lines {
            let needs_rescan = self.sync_state() == FolderSyncState::NeedsRescan;
            match parse::parse_untagged(line) {
                Ok(Untagged::Exists(n)) => st.server_exists = n,
                Ok(Untagged::Expunge(seq)) => {
                    st.server_exists = st.server_exists.saturating_sub(1);
                    // sequence numbers mean nothing until the rescan has run
                    if needs_rescan {
                        continue;
                    }
                    if let Some(info) = st.summary.remove_index(seq) {
                        debug!(folder = %self.path(), uid = %info.uid, "expunged");
                        st.changes.remove(info.uid);
                        if let Err(e) = self.inner.cache.remove(&info.uid) {
                            warn!(uid = %info.uid, "could not drop cached data: {}", e);
                        }
                    }
                }
                Ok(Untagged::Fetch(fetch)) if apply_fetch && !needs_rescan => {
                    let Some(server) = fetch.message_flags() else {
                        continue;
                    };
                    let Some(uid) = st.summary.index(fetch.message).map(|m| m.uid) else {
                        continue;
                    };
                    if fetch.uid.is_some_and(|u| MessageId::Real(u) != uid) {
                        warn!(folder = %self.path(), seq = fetch.message, "flag update for an unexpected UID");
                        self.set_sync_state(FolderSyncState::NeedsRescan);
                        continue;
                    }
                    let mut changed = false;
                    st.summary
                        .update(&uid, |info| changed = merge_server_flags(info, server));
                    if changed {
                        st.changes.change(uid);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("ignoring unparsable untagged response: {}", e),
            }
        }
    }

    /// The online half of `refresh_info`.
    pub(super) fn refresh_online(&self) -> Result<()> {
        let store = self.store()?;
        self.with_state(|st| {
            let result = store.command(|session| {
                if session.selected.as_deref() == Some(self.path()) {
                    self.exec(st, session, &Command::new("NOOP"))?;
                } else {
                    self.select(st, session)?;
                }
                self.update_messages(st, session, &store)
            });
            let saved = self.save(st);
            self.publish_counts(&store, st);
            result.and(saved)
        })
    }

    /// Bring the rows up to date once the mailbox is selected.
    fn update_messages(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        store: &StoreInner,
    ) -> Result<()> {
        let local = st.summary.exists();
        if st.server_exists < local {
            self.set_sync_state(FolderSyncState::NeedsRescan);
        }
        if self.sync_state() == FolderSyncState::NeedsRescan {
            return self.rescan_locked(st, session, store);
        }
        if st.server_exists > local {
            self.fetch_new(st, session, store, local + 1, st.server_exists)?;
        }
        if self.sync_state() == FolderSyncState::NeedsRescan {
            return self.rescan_locked(st, session, store);
        }
        Ok(())
    }

    /// The fast path: fetch metadata for sequence numbers `lo..=hi`, which are all new.
    fn fetch_new(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        store: &StoreInner,
        lo: Seq,
        hi: Seq,
    ) -> Result<()> {
        debug!(folder = %self.path(), lo, hi, "fetching new messages");
        let batch = store.config().batch();
        let mut lo = lo;
        while lo <= hi {
            store.cancel().check()?;
            let end = hi.min(lo.saturating_add(batch - 1));
            let response = session.client.send_command(
                &Command::new("FETCH")
                    .seq_range(lo, end)
                    .atom("(UID FLAGS RFC822.SIZE)"),
            )?;
            self.folder_changed(st, &response.untagged, false);
            let mut fetches = parse::parse_fetches(&response.untagged)?;
            fetches.sort_by_key(|f| f.message);
            for fetch in &fetches {
                let Some(uid) = fetch.uid else {
                    continue;
                };
                if st.summary.last_real_uid().is_some_and(|last| uid <= last)
                    && st.summary.get(&MessageId::Real(uid)).is_none()
                {
                    warn!(folder = %self.path(), uid, "new message below known UIDs");
                    self.set_sync_state(FolderSyncState::NeedsRescan);
                    return Ok(());
                }
                self.add_fetched(st, fetch);
            }
            if end == hi {
                break;
            }
            lo = end + 1;
        }
        Ok(())
    }

    /// Add a row for a `FETCH (UID FLAGS RFC822.SIZE)` response.
    fn add_fetched(&self, st: &mut FolderState, fetch: &Fetch) -> bool {
        let Some(uid) = fetch.uid else {
            return false;
        };
        let flags = fetch.message_flags().unwrap_or_default() & (TRACKED_FLAGS | MessageFlag::Recent);
        let info = MessageInfo::new(uid, flags, fetch.size.unwrap_or(0));
        let next = uid.saturating_add(1);
        st.uid_next = Some(st.uid_next.map_or(next, |n| n.max(next)));
        if st.summary.add(info) {
            st.changes.add(MessageId::Real(uid));
            true
        } else {
            false
        }
    }

    /// Reconcile every row with the server. The session stays locked throughout, so sequence
    /// numbers cannot shift under us; cancellation is checked between batches and leaves the
    /// rows handled so far in place.
    fn rescan_locked(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        store: &StoreInner,
    ) -> Result<()> {
        let exists = st.server_exists;
        info!(folder = %self.path(), exists, local = st.summary.exists(), "rescanning");
        let local: Vec<Uid> = st
            .summary
            .real()
            .iter()
            .filter_map(|m| m.uid.real())
            .collect();
        let batch = store.config().batch();
        let mut next_local = 0;
        let mut new_uids: Vec<Uid> = Vec::new();
        let mut lo: Seq = 1;
        while lo <= exists {
            store.cancel().check()?;
            let hi = exists.min(lo.saturating_add(batch - 1));
            let response = session.client.send_command(
                &Command::new("FETCH").seq_range(lo, hi).atom("(UID FLAGS)"),
            )?;
            let mut fetches: Vec<Fetch> = parse::parse_fetches(&response.untagged)?
                .into_iter()
                .filter(|f| f.uid.is_some())
                .collect();
            fetches.sort_by_key(|f| f.message);
            for fetch in fetches {
                let Some(uid) = fetch.uid else {
                    continue;
                };
                // local rows below the server's next UID are gone from the server
                while next_local < local.len() && local[next_local] < uid {
                    self.forget(st, &MessageId::Real(local[next_local]));
                    next_local += 1;
                }
                if next_local < local.len() && local[next_local] == uid {
                    let id = MessageId::Real(uid);
                    let server = fetch.message_flags().unwrap_or_default();
                    let mut changed = false;
                    st.summary
                        .update(&id, |info| changed = merge_server_flags(info, server));
                    if changed {
                        st.changes.change(id);
                    }
                    next_local += 1;
                } else {
                    new_uids.push(uid);
                }
            }
            if hi == exists {
                break;
            }
            lo = hi + 1;
        }
        for uid in &local[next_local..] {
            self.forget(st, &MessageId::Real(*uid));
        }
        self.fetch_uids(st, session, store, &new_uids)?;

        let state = if st.summary.exists() == st.server_exists {
            self.prune_cache(st);
            FolderSyncState::InSync
        } else {
            // something was expunged while we were fetching
            FolderSyncState::NeedsRescan
        };
        self.set_sync_state(state);
        Ok(())
    }

    /// Fetch metadata for new `uids` and add their rows.
    fn fetch_uids(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        store: &StoreInner,
        uids: &[Uid],
    ) -> Result<()> {
        let batch = store.config().batch() as usize;
        for chunk in uids.chunks(batch) {
            for set in split_uid_sets(chunk, store.config().max_uid_set_len) {
                store.cancel().check()?;
                let response = session.client.send_command(
                    &Command::new("UID FETCH")
                        .uid_set(&set)
                        .atom("(UID FLAGS RFC822.SIZE)"),
                )?;
                self.folder_changed(st, &response.untagged, false);
                for fetch in parse::parse_fetches(&response.untagged)? {
                    self.add_fetched(st, &fetch);
                }
            }
        }
        Ok(())
    }

    /// Read the responses to a `UID FETCH` of one section as they arrive. The body is taken out
    /// of its line right away; every other line is a mailbox update.
    fn read_section(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        uid: Uid,
        section: &str,
    ) -> Result<Vec<u8>> {
        let mut data = None;
        let mut updates = Vec::new();
        loop {
            match session.client.read_next_response()? {
                ResponseLine::Untagged(line) => {
                    if data.is_none() {
                        if let Ok(Untagged::Fetch(fetch)) = parse::parse_untagged(&line) {
                            if fetch.uid == Some(uid) {
                                if let Some(body) = fetch.section(section) {
                                    data = Some(body.to_vec());
                                    continue;
                                }
                            }
                        }
                    }
                    updates.push(line);
                }
                ResponseLine::Continuation(_) => {}
                ResponseLine::Tagged(done) => {
                    done.into_result(Response::default())?;
                    break;
                }
            }
        }
        self.folder_changed(st, &updates, true);
        data.ok_or(Error::NoSuchMessage(MessageId::Real(uid)))
    }

    /// `get_message` and `get_part`: the cache first, then the server.
    pub(super) fn fetch_section(&self, uid: &MessageId, section: &str) -> Result<Vec<u8>> {
        match self.inner.cache.get_bytes(uid, section) {
            Ok(Some(data)) => return Ok(data),
            Ok(None) => {}
            Err(e) => warn!(folder = %self.path(), %uid, "cache read failed: {}", e),
        }
        let store = self.store()?;
        let real = match (store.mode(), uid) {
            (DiscoMode::Offline, _) => {
                return Err(Error::Offline(format!("{} is not cached", uid)))
            }
            (_, MessageId::Real(real)) => *real,
            (DiscoMode::Resyncing, _) => store
                .diary()
                .resolve(self.path(), uid)
                .ok_or(Error::NoSuchMessage(*uid))?,
            (DiscoMode::Online, MessageId::Synthetic(_)) => return Err(Error::NoSuchMessage(*uid)),
        };
        let item = format!("BODY.PEEK[{}]", section);
        let data = self.with_state(|st| {
            store.command(|session| {
                self.ensure_selected(st, session)?;
                let pending = session.take_unsolicited();
                self.folder_changed(st, &pending, true);
                session
                    .client
                    .start_command(&Command::new("UID FETCH").atom(real).atom(&item))?;
                self.read_section(st, session, real, section)
            })
        })?;
        if let Err(e) = self.inner.cache.insert(uid, section, &data) {
            warn!(folder = %self.path(), %uid, "could not cache fetched data: {}", e);
        }
        Ok(data)
    }
}

//! The online, offline and resyncing implementations of the mutating operations, and the
//! replay of journaled ones.

use tracing::{debug, info, warn};

use super::flags::{group_for_push, store_command};
use super::{lock, DiscoFolder, FolderState, ImapFolder};
use crate::cache::MessageCache;
use crate::command::{split_uid_sets, Command};
use crate::diary::{Diary, DiaryAction};
use crate::error::{Error, Result};
use crate::parse;
use crate::store::session::Session;
use crate::store::StoreInner;
use crate::summary::MessageInfo;
use crate::types::{
    expand_ranges, DiscoMode, MessageFlag, MessageFlags, MessageId, ResponseCode, SyntheticKind,
    Uid, TRACKED_FLAGS,
};

fn size_of(message: &[u8]) -> u32 {
    u32::try_from(message.len()).unwrap_or(u32::MAX)
}

fn sorted_real(uids: &[MessageId]) -> Vec<Uid> {
    let mut reals: Vec<Uid> = uids.iter().filter_map(MessageId::real).collect();
    reals.sort_unstable();
    reals.dedup();
    reals
}

/// What `UID COPY` reported: the destination's UIDVALIDITY and source-to-destination UIDs.
struct Copied {
    uid_validity: Option<u32>,
    pairs: Vec<(Uid, Uid)>,
}

impl ImapFolder {
    /// Send dirty flags to the server, one `STORE` per group of identical flag sets. Each group
    /// is marked clean as soon as the server accepts it.
    fn push_flags(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        store: &StoreInner,
    ) -> Result<()> {
        if st.summary.dirty_messages().is_empty() {
            return Ok(());
        }
        // selecting may find a new UIDVALIDITY and drop the rows we were about to push
        self.ensure_selected(st, session)?;
        let dirty = st.summary.dirty_messages();
        if dirty.is_empty() {
            return Ok(());
        }
        let mask = st.permanent_mask;
        if mask.is_empty() {
            debug!(folder = %self.path(), "server keeps no flags here; changes stay local");
            return Ok(());
        }
        for group in group_for_push(&dirty, mask) {
            for set in split_uid_sets(&group.uids, store.config().max_uid_set_len) {
                self.exec(st, session, &store_command(&set, group.flags, mask))?;
                for uid in &set {
                    st.summary.confirm(&MessageId::Real(*uid), mask, group.flags);
                }
            }
        }
        Ok(())
    }

    /// Expunge exactly `uids` on the server.
    ///
    /// With UIDPLUS this is `UID EXPUNGE`. Without it, other messages that are `\Deleted` on
    /// the server lose the flag for the duration of the `EXPUNGE` and get it back afterwards.
    fn expunge_real(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        store: &StoreInner,
        uids: &[Uid],
    ) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let mut uids = uids.to_vec();
        uids.sort_unstable();
        uids.dedup();
        let max = store.config().max_uid_set_len;
        let deleted: MessageFlags = MessageFlag::Deleted.into();
        let mark = |set: &[Uid], op: &str| {
            Command::new("UID STORE")
                .uid_set(set)
                .atom(op)
                .flag_list(deleted)
        };

        if session.has("UIDPLUS") {
            for set in split_uid_sets(&uids, max) {
                self.exec(st, session, &mark(&set, "+FLAGS.SILENT"))?;
                self.exec(st, session, &Command::new("UID EXPUNGE").uid_set(&set))?;
                for uid in &set {
                    self.forget(st, &MessageId::Real(*uid));
                }
            }
            return Ok(());
        }

        let response = self.exec(st, session, &Command::new("UID SEARCH").atom("DELETED"))?;
        let mut keep: Vec<Uid> = parse::parse_search(&response.untagged)?
            .into_iter()
            .filter(|u| uids.binary_search(u).is_err())
            .collect();
        keep.sort_unstable();
        let keep = split_uid_sets(&keep, max);
        debug!(folder = %self.path(), keep = keep.len(), "expunging without UIDPLUS");
        for set in &keep {
            self.exec(st, session, &mark(set, "-FLAGS.SILENT"))?;
        }
        for set in split_uid_sets(&uids, max) {
            self.exec(st, session, &mark(&set, "+FLAGS.SILENT"))?;
        }
        let expunged = self.exec(st, session, &Command::new("EXPUNGE"));
        let mut restored = Ok(());
        for set in &keep {
            if let Err(e) = self.exec(st, session, &mark(set, "+FLAGS.SILENT")) {
                restored = Err(e);
                break;
            }
        }
        expunged?;
        for uid in &uids {
            self.forget(st, &MessageId::Real(*uid));
        }
        restored
    }

    /// Remove rows locally and journal the expunge.
    fn expunge_local(
        &self,
        st: &mut FolderState,
        store: &StoreInner,
        uids: &[MessageId],
    ) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        for uid in uids {
            self.forget(st, uid);
        }
        store.diary().log(DiaryAction::Expunge {
            folder: self.path().to_string(),
            uids: uids.to_vec(),
            uid_validity: st.summary.uid_validity(),
        })
    }

    /// `APPEND` the message; the UID comes from `APPENDUID` when the server supports UIDPLUS.
    fn append_command(
        &self,
        st: &mut FolderState,
        session: &mut Session,
        message: &[u8],
        flags: MessageFlags,
    ) -> Result<Option<Uid>> {
        let response = session.run(
            &Command::new("APPEND")
                .mailbox(self.full_name())
                .flag_list(flags & TRACKED_FLAGS)
                .literal(message),
        )?;
        if session.selected.as_deref() == Some(self.path()) {
            let updates = session.take_unsolicited();
            self.folder_changed(st, &updates, true);
        }
        let assigned = response.codes().into_iter().find_map(|code| match code {
            ResponseCode::AppendUid { uid_validity, uids } => {
                expand_ranges(&uids).first().map(|uid| (uid_validity, *uid))
            }
            _ => None,
        });
        Ok(match assigned {
            Some((validity, uid)) if st.summary.uid_validity().map_or(true, |v| v == validity) => {
                Some(uid)
            }
            Some((validity, _)) => {
                debug!(folder = %self.path(), validity, "APPENDUID from another UIDVALIDITY");
                None
            }
            None => None,
        })
    }

    /// Add a row for a message we put on the server, but only if no one else's message could
    /// sit between it and the rows we have. Otherwise the next refresh picks it up.
    fn record_new(&self, st: &mut FolderState, info: MessageInfo) -> bool {
        let Some(uid) = info.uid.real() else {
            return false;
        };
        if st.uid_next != Some(uid) {
            debug!(folder = %self.path(), uid, "leaving new message for the next refresh");
            return false;
        }
        st.uid_next = Some(uid.saturating_add(1));
        if st.summary.add(info) {
            st.changes.add(MessageId::Real(uid));
            true
        } else {
            false
        }
    }

    /// `UID COPY` `reals` to `dest_full`, then mark them `\Deleted` if asked.
    fn copy_real(
        &self,
        store: &StoreInner,
        reals: &[Uid],
        dest_full: &str,
        delete_originals: bool,
    ) -> Result<Copied> {
        let max = store.config().max_uid_set_len;
        self.with_state(|st| {
            let result = store.command(|session| {
                let mut copied = Copied {
                    uid_validity: None,
                    pairs: Vec::new(),
                };
                for set in split_uid_sets(reals, max) {
                    let response = self.exec(
                        st,
                        session,
                        &Command::new("UID COPY").uid_set(&set).mailbox(dest_full),
                    )?;
                    for code in response.codes() {
                        if let ResponseCode::CopyUid {
                            uid_validity,
                            source,
                            dest,
                        } = code
                        {
                            copied.uid_validity = Some(uid_validity);
                            copied
                                .pairs
                                .extend(expand_ranges(&source).into_iter().zip(expand_ranges(&dest)));
                        }
                    }
                    if delete_originals {
                        self.exec(
                            st,
                            session,
                            &Command::new("UID STORE")
                                .uid_set(&set)
                                .atom("+FLAGS.SILENT")
                                .flag_list(MessageFlag::Deleted.into()),
                        )?;
                        let deleted: MessageFlags = MessageFlag::Deleted.into();
                        for uid in &set {
                            let id = MessageId::Real(*uid);
                            // other unpushed changes keep the row dirty
                            let stored = st
                                .summary
                                .update(&id, |info| info.server_flags |= MessageFlag::Deleted);
                            if st.summary.set_flags(&id, deleted, deleted) || stored {
                                st.changes.change(id);
                            }
                        }
                    }
                }
                Ok(copied)
            });
            let saved = self.save(st);
            self.publish_counts(store, st);
            let copied = result?;
            saved?;
            Ok(copied)
        })
    }

    /// Mirror what an online copy did into `dest`: cached bodies and, where safe, rows.
    fn adopt_copies(
        &self,
        store: &StoreInner,
        dest: &ImapFolder,
        copied: &Copied,
        rows: &[MessageInfo],
    ) -> Result<Vec<MessageId>> {
        if let (Some(ours), Some(theirs)) = (dest.uid_validity(), copied.uid_validity) {
            if ours != theirs {
                debug!(folder = %dest.path(), "COPYUID from another UIDVALIDITY");
                return Ok(Vec::new());
            }
        }
        let mut pairs = copied.pairs.clone();
        pairs.sort_unstable_by_key(|&(_, dst)| dst);
        for &(src, dst) in &pairs {
            let (src, dst) = (MessageId::Real(src), MessageId::Real(dst));
            if let Err(e) = MessageCache::copy(&self.inner.cache, &src, &dest.inner.cache, &dst) {
                warn!(%src, %dst, "could not copy cached data: {}", e);
            }
        }
        dest.with_state(|st| {
            for &(src, dst) in &pairs {
                if let Some(row) = rows.iter().find(|r| r.uid == MessageId::Real(src)) {
                    dest.record_new(st, MessageInfo::new(dst, row.server_flags & TRACKED_FLAGS, row.size));
                }
            }
            dest.save(st)?;
            dest.publish_counts(store, st);
            Ok(pairs.iter().map(|&(_, dst)| MessageId::Real(dst)).collect())
        })
    }

    /// The folder's UIDVALIDITY on the server, selecting it first if needed.
    fn selected_uid_validity(&self, store: &StoreInner) -> Result<Option<u32>> {
        self.with_state(|st| {
            let result = store.command(|session| {
                self.ensure_selected(st, session)?;
                Ok(st.summary.uid_validity())
            });
            // the selection may have dropped a stale mirror
            let saved = self.save(st);
            self.publish_counts(store, st);
            let validity = result?;
            saved?;
            Ok(validity)
        })
    }

    /// Whether real UIDs journaled under `logged` now name other messages. Only asks the server
    /// when there is something to compare.
    fn epoch_changed(
        &self,
        store: &StoreInner,
        uids: &[MessageId],
        logged: Option<u32>,
    ) -> Result<bool> {
        let Some(logged) = logged else {
            return Ok(false);
        };
        if !uids.iter().any(|u| u.real().is_some()) {
            return Ok(false);
        }
        let changed = self
            .selected_uid_validity(store)?
            .is_some_and(|current| current != logged);
        if changed {
            warn!(
                folder = %self.path(),
                logged, "UIDVALIDITY changed since the action was journaled"
            );
        }
        Ok(changed)
    }

    /// Replay an offline expunge. Real UIDs from an earlier UIDVALIDITY are not expunged.
    pub(crate) fn replay_expunge(
        &self,
        diary: &Diary,
        uids: &[MessageId],
        uid_validity: Option<u32>,
    ) -> Result<()> {
        let store = self.store()?;
        if !self.epoch_changed(&store, uids, uid_validity)? {
            return self.expunge_uids_resyncing(uids);
        }
        let pending: Vec<MessageId> = uids.iter().filter(|u| u.is_synthetic()).copied().collect();
        let resolved = pending
            .iter()
            .any(|u| diary.resolve(self.path(), u).is_some());
        if !pending.is_empty() {
            self.expunge_uids_resyncing(&pending)?;
        }
        if resolved {
            Ok(())
        } else {
            Err(Error::InconsistentState(format!(
                "expunged messages in {} belong to an earlier UIDVALIDITY",
                self.path()
            )))
        }
    }

    /// Replay an offline append: send the cached body and swap the synthetic row for the real
    /// one.
    pub(crate) fn replay_append(&self, diary: &Diary, id: MessageId) -> Result<()> {
        let store = self.store()?;
        self.with_state(|st| {
            let row = st.summary.get(&id).cloned().ok_or_else(|| {
                Error::InconsistentState(format!("{} in {} has no summary row", id, self.path()))
            })?;
            let data = self.inner.cache.get_bytes(&id, "")?.ok_or_else(|| {
                Error::InconsistentState(format!("{} in {} has no cached body", id, self.path()))
            })?;
            let flags = row.flags & TRACKED_FLAGS;
            let uid = store.command(|session| self.append_command(st, session, &data, flags))?;
            match uid {
                Some(uid) => {
                    if let MessageId::Synthetic(synthetic) = id {
                        diary.uidmap_add(self.path(), synthetic, uid)?;
                    }
                    if let Err(e) = self.inner.cache.rename(&id, &MessageId::Real(uid)) {
                        warn!(%id, uid, "could not move cached body: {}", e);
                    }
                    st.summary.remove(&id);
                    st.changes.remove(id);
                    self.record_new(st, MessageInfo::new(uid, flags, row.size));
                    info!(folder = %self.path(), %id, uid, "replayed append");
                }
                None => {
                    // no UIDPLUS: the next refresh finds it like any other new message
                    self.forget(st, &id);
                }
            }
            self.save(st)?;
            self.publish_counts(&store, st);
            Ok(())
        })
    }

    /// Replay an offline copy or move. Sources that never reached the server are skipped along
    /// with their copies.
    pub(crate) fn replay_transfer(
        &self,
        diary: &Diary,
        uids: &[MessageId],
        uid_validity: Option<u32>,
        dest: &ImapFolder,
        dest_uids: &[MessageId],
        delete_originals: bool,
    ) -> Result<()> {
        let store = self.store()?;
        let stale = self.epoch_changed(&store, uids, uid_validity)?;
        let mut resolved: Vec<(Uid, MessageId)> = Vec::new();
        let mut orphans: Vec<MessageId> = Vec::new();
        for (src, dst) in uids.iter().zip(dest_uids) {
            let real = match src {
                MessageId::Real(_) if stale => None,
                _ => diary.resolve(self.path(), src),
            };
            match real {
                Some(real) => resolved.push((real, *dst)),
                None => {
                    warn!(folder = %self.path(), %src, "copy source is not on the server");
                    orphans.push(*dst);
                }
            }
        }
        let copied = if resolved.is_empty() {
            None
        } else {
            let mut reals: Vec<Uid> = resolved.iter().map(|&(real, _)| real).collect();
            reals.sort_unstable();
            reals.dedup();
            Some(self.copy_real(&store, &reals, dest.full_name(), delete_originals)?)
        };

        dest.with_state(|st| {
            let valid = copied.as_ref().is_some_and(|c| {
                match (st.summary.uid_validity(), c.uid_validity) {
                    (Some(ours), Some(theirs)) => ours == theirs,
                    _ => true,
                }
            });
            let mut landed: Vec<(Uid, MessageId)> = Vec::new();
            for (src, dst) in &resolved {
                let real = copied
                    .as_ref()
                    .filter(|_| valid)
                    .and_then(|c| c.pairs.iter().find(|(s, _)| s == src))
                    .map(|&(_, d)| d);
                match real {
                    Some(real) => landed.push((real, *dst)),
                    None => orphans.push(*dst),
                }
            }
            landed.sort_unstable_by_key(|&(real, _)| real);
            for (real, dst) in landed {
                if let MessageId::Synthetic(synthetic) = dst {
                    diary.uidmap_add(dest.path(), synthetic, real)?;
                }
                if let Err(e) = dest.inner.cache.rename(&dst, &MessageId::Real(real)) {
                    warn!(%dst, real, "could not move cached body: {}", e);
                }
                if let Some(row) = st.summary.remove(&dst) {
                    st.changes.remove(dst);
                    dest.record_new(st, MessageInfo::new(real, row.flags & TRACKED_FLAGS, row.size));
                }
            }
            for dst in &orphans {
                dest.forget(st, dst);
            }
            dest.save(st)?;
            dest.publish_counts(&store, st);
            Ok(())
        })?;

        if resolved.is_empty() {
            return Err(Error::InconsistentState(format!(
                "no message of a transfer from {} reached the server",
                self.path()
            )));
        }
        Ok(())
    }
}

impl DiscoFolder for ImapFolder {
    fn disco_mode(&self) -> DiscoMode {
        self.store().map_or(DiscoMode::Offline, |s| s.mode())
    }

    fn sync_online(&self, expunge: bool) -> Result<()> {
        let store = self.store()?;
        self.with_state(|st| {
            let result = store.command(|session| {
                self.push_flags(st, session, &store)?;
                if expunge {
                    let deleted: Vec<Uid> = st
                        .summary
                        .real()
                        .iter()
                        .filter(|m| m.flags.contains(MessageFlag::Deleted))
                        .filter_map(|m| m.uid.real())
                        .collect();
                    self.expunge_real(st, session, &store, &deleted)?;
                }
                Ok(())
            });
            // groups pushed before a failure stay clean
            let saved = self.save(st);
            self.publish_counts(&store, st);
            result.and(saved)
        })
    }

    fn sync_offline(&self, expunge: bool) -> Result<()> {
        let store = self.store()?;
        self.with_state(|st| {
            if expunge {
                let deleted: Vec<MessageId> = st
                    .summary
                    .messages()
                    .iter()
                    .filter(|m| m.flags.contains(MessageFlag::Deleted))
                    .map(|m| m.uid)
                    .collect();
                self.expunge_local(st, &store, &deleted)?;
            }
            self.save(st)?;
            self.publish_counts(&store, st);
            Ok(())
        })
    }

    fn sync_resyncing(&self, expunge: bool) -> Result<()> {
        self.sync_online(expunge)
    }

    fn expunge_uids_online(&self, uids: &[MessageId]) -> Result<()> {
        let store = self.store()?;
        let reals = sorted_real(uids);
        self.with_state(|st| {
            for uid in uids.iter().filter(|u| u.is_synthetic()) {
                self.forget(st, uid);
            }
            let result = store.command(|session| self.expunge_real(st, session, &store, &reals));
            let saved = self.save(st);
            self.publish_counts(&store, st);
            result.and(saved)
        })
    }

    fn expunge_uids_offline(&self, uids: &[MessageId]) -> Result<()> {
        let store = self.store()?;
        self.with_state(|st| {
            self.expunge_local(st, &store, uids)?;
            self.save(st)?;
            self.publish_counts(&store, st);
            Ok(())
        })
    }

    fn expunge_uids_resyncing(&self, uids: &[MessageId]) -> Result<()> {
        let store = self.store()?;
        let mut reals = Vec::new();
        for uid in uids {
            match store.diary().resolve(self.path(), uid) {
                Some(real) => reals.push(real),
                None => debug!(folder = %self.path(), %uid, "nothing to expunge for unresolved id"),
            }
        }
        reals.sort_unstable();
        reals.dedup();
        self.with_state(|st| {
            for uid in uids.iter().filter(|u| u.is_synthetic()) {
                self.forget(st, uid);
            }
            let result = store.command(|session| self.expunge_real(st, session, &store, &reals));
            let saved = self.save(st);
            self.publish_counts(&store, st);
            result.and(saved)
        })
    }

    fn append_online(&self, message: &[u8], flags: MessageFlags) -> Result<Option<MessageId>> {
        let store = self.store()?;
        let flags = flags & TRACKED_FLAGS;
        self.with_state(|st| {
            let uid = store.command(|session| self.append_command(st, session, message, flags))?;
            if let Some(uid) = uid {
                let id = MessageId::Real(uid);
                if let Err(e) = self.inner.cache.insert(&id, "", message) {
                    warn!(folder = %self.path(), uid, "could not cache appended message: {}", e);
                }
                self.record_new(st, MessageInfo::new(uid, flags, size_of(message)));
            }
            self.save(st)?;
            self.publish_counts(&store, st);
            Ok(uid.map(MessageId::Real))
        })
    }

    fn append_offline(&self, message: &[u8], flags: MessageFlags) -> Result<Option<MessageId>> {
        let store = self.store()?;
        let flags = flags & TRACKED_FLAGS;
        self.with_state(|st| {
            let id = MessageId::Synthetic(st.summary.next_synthetic(SyntheticKind::Append));
            // the body only exists here until the append is replayed
            self.inner.cache.insert(&id, "", message)?;
            let logged = store.diary().log(DiaryAction::Append {
                folder: self.path().to_string(),
                uid: id,
            });
            if let Err(e) = logged {
                if let Err(e) = self.inner.cache.remove(&id) {
                    warn!(%id, "could not drop cached body: {}", e);
                }
                return Err(e);
            }
            st.summary.add(MessageInfo {
                uid: id,
                flags,
                server_flags: MessageFlags::empty(),
                size: size_of(message),
            });
            st.changes.add(id);
            self.save(st)?;
            self.publish_counts(&store, st);
            Ok(Some(id))
        })
    }

    fn append_resyncing(
        &self,
        message: &[u8],
        flags: MessageFlags,
    ) -> Result<Option<MessageId>> {
        self.append_online(message, flags)
    }

    fn transfer_online(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>> {
        let store = self.store()?;
        if uids.iter().any(MessageId::is_synthetic) {
            warn!(folder = %self.path(), "skipping messages that are not on the server yet");
        }
        let reals = sorted_real(uids);
        if reals.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<MessageInfo> = {
            let st = lock(&self.inner.state);
            reals
                .iter()
                .filter_map(|u| st.summary.get(&MessageId::Real(*u)).cloned())
                .collect()
        };
        let copied = self.copy_real(&store, &reals, dest.full_name(), delete_originals)?;
        self.adopt_copies(&store, dest, &copied, &rows)
    }

    fn transfer_offline(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>> {
        let store = self.store()?;
        let (rows, uid_validity) = {
            let st = lock(&self.inner.state);
            let mut rows = Vec::with_capacity(uids.len());
            for uid in uids {
                rows.push(st.summary.get(uid).cloned().ok_or(Error::NoSuchMessage(*uid))?);
            }
            (rows, st.summary.uid_validity())
        };

        // nothing is committed in either folder until the diary has the action
        let dest_uids = dest.with_state(|st| {
            let ids: Vec<MessageId> = rows
                .iter()
                .map(|_| MessageId::Synthetic(st.summary.next_synthetic(SyntheticKind::Copy)))
                .collect();
            for (row, id) in rows.iter().zip(&ids) {
                if let Err(e) = MessageCache::copy(&self.inner.cache, &row.uid, &dest.inner.cache, id) {
                    warn!(src = %row.uid, dst = %id, "could not copy cached data: {}", e);
                }
            }
            let logged = store.diary().log(DiaryAction::Transfer {
                source: self.path().to_string(),
                dest: dest.path().to_string(),
                uids: rows.iter().map(|r| r.uid).collect(),
                dest_uids: ids.clone(),
                delete_originals,
                uid_validity,
            });
            if let Err(e) = logged {
                for id in &ids {
                    if let Err(e) = dest.inner.cache.remove(id) {
                        warn!(%id, "could not drop cached copy: {}", e);
                    }
                }
                return Err(e);
            }
            for (row, id) in rows.iter().zip(&ids) {
                st.summary.add(MessageInfo {
                    uid: *id,
                    flags: row.flags & TRACKED_FLAGS,
                    server_flags: MessageFlags::empty(),
                    size: row.size,
                });
                st.changes.add(*id);
            }
            dest.save(st)?;
            dest.publish_counts(&store, st);
            Ok(ids)
        })?;

        if delete_originals {
            self.with_state(|st| {
                let deleted: MessageFlags = MessageFlag::Deleted.into();
                for row in &rows {
                    if st.summary.set_flags(&row.uid, deleted, deleted) {
                        st.changes.change(row.uid);
                    }
                }
                self.save(st)?;
                self.publish_counts(&store, st);
                Ok(())
            })?;
        }
        Ok(dest_uids)
    }

    fn transfer_resyncing(
        &self,
        uids: &[MessageId],
        dest: &Self,
        delete_originals: bool,
    ) -> Result<Vec<MessageId>> {
        let store = self.store()?;
        let resolved: Vec<MessageId> = uids
            .iter()
            .filter_map(|uid| store.diary().resolve(self.path(), uid))
            .map(MessageId::Real)
            .collect();
        if resolved.is_empty() && !uids.is_empty() {
            return Err(Error::InconsistentState(format!(
                "none of the messages to transfer from {} are on the server",
                self.path()
            )));
        }
        self.transfer_online(&resolved, dest, delete_originals)
    }
}

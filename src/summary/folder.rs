use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{load_json, save_json};
use crate::error::Result;
use crate::types::{
    MessageFlag, MessageFlags, MessageId, Seq, SyntheticId, SyntheticKind, Uid, TRACKED_FLAGS,
};

/// What is known locally about one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// The server UID, or a synthetic id for a message created while offline.
    pub uid: MessageId,
    /// Current local flags. `FolderFlagged` marks a local change not yet on the server.
    pub flags: MessageFlags,
    /// The flags the server last confirmed.
    pub server_flags: MessageFlags,
    /// Size of the full message in bytes.
    pub size: u32,
}

impl MessageInfo {
    /// A message as the server reports it: local and server flags agree.
    pub fn new(uid: impl Into<MessageId>, flags: MessageFlags, size: u32) -> Self {
        let flags = flags - MessageFlag::FolderFlagged;
        MessageInfo {
            uid: uid.into(),
            flags,
            server_flags: flags,
            size,
        }
    }

    /// Whether local flags have diverged from the server's.
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(MessageFlag::FolderFlagged)
    }

    /// The flags as they should appear on the server.
    pub fn wire_flags(&self) -> MessageFlags {
        self.flags & TRACKED_FLAGS
    }
}

/// The persisted per-folder message table.
///
/// Rows with real UIDs come first, in ascending UID order, which is also the order of
/// sequence numbers on the server. Rows with synthetic ids follow and have no sequence number.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FolderSummary {
    uid_validity: Option<u32>,
    next_synthetic: u32,
    messages: Vec<MessageInfo>,
    #[serde(skip)]
    dirty: bool,
}

impl FolderSummary {
    /// Load the summary stored at `path`, or an empty one if there is none yet.
    pub fn load(path: &Path) -> Result<FolderSummary> {
        Ok(load_json(path)?.unwrap_or_default())
    }

    /// Write the summary to `path` if it changed since the last save.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        save_json(path, self)?;
        self.dirty = false;
        Ok(())
    }

    /// Mark the summary as needing a save.
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    /// Whether there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The UIDVALIDITY the rows belong to.
    pub fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    pub fn set_uid_validity(&mut self, validity: Option<u32>) {
        if self.uid_validity != validity {
            self.uid_validity = validity;
            self.touch();
        }
    }

    /// All rows.
    pub fn messages(&self) -> &[MessageInfo] {
        &self.messages
    }

    /// Total number of rows, synthetic ones included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The number of rows with real UIDs: what the server's `EXISTS` should be.
    pub fn exists(&self) -> u32 {
        self.messages
            .iter()
            .take_while(|m| !m.uid.is_synthetic())
            .count() as u32
    }

    /// The rows with real UIDs, in sequence order.
    pub fn real(&self) -> &[MessageInfo] {
        &self.messages[..self.exists() as usize]
    }

    /// The row at 1-based sequence number `seq`.
    pub fn index(&self, seq: Seq) -> Option<&MessageInfo> {
        if seq == 0 || seq > self.exists() {
            return None;
        }
        self.messages.get(seq as usize - 1)
    }

    pub fn get(&self, uid: &MessageId) -> Option<&MessageInfo> {
        self.position(uid).map(|i| &self.messages[i])
    }

    fn position(&self, uid: &MessageId) -> Option<usize> {
        match uid {
            MessageId::Real(u) => self
                .real()
                .binary_search_by_key(u, |m| m.uid.real().unwrap_or(Uid::MAX))
                .ok(),
            MessageId::Synthetic(_) => self.messages.iter().position(|m| m.uid == *uid),
        }
    }

    /// The highest real UID.
    pub fn last_real_uid(&self) -> Option<Uid> {
        self.real().last().and_then(|m| m.uid.real())
    }

    /// Add a row. Returns `false` if a row with the same id already exists.
    pub fn add(&mut self, info: MessageInfo) -> bool {
        match info.uid {
            MessageId::Real(uid) => {
                let exists = self.exists() as usize;
                match self.messages[..exists]
                    .binary_search_by_key(&uid, |m| m.uid.real().unwrap_or(Uid::MAX))
                {
                    Ok(_) => return false,
                    Err(at) => self.messages.insert(at, info),
                }
            }
            MessageId::Synthetic(_) => {
                if self.position(&info.uid).is_some() {
                    return false;
                }
                self.messages.push(info);
            }
        }
        self.touch();
        true
    }

    /// Remove the row for `uid`.
    pub fn remove(&mut self, uid: &MessageId) -> Option<MessageInfo> {
        let at = self.position(uid)?;
        self.touch();
        Some(self.messages.remove(at))
    }

    /// Remove the row at sequence number `seq`, as an untagged `EXPUNGE` asks.
    pub fn remove_index(&mut self, seq: Seq) -> Option<MessageInfo> {
        if seq == 0 || seq > self.exists() {
            return None;
        }
        self.touch();
        Some(self.messages.remove(seq as usize - 1))
    }

    /// Apply `f` to the row for `uid`. The summary is touched only if the row changed.
    pub fn update(&mut self, uid: &MessageId, f: impl FnOnce(&mut MessageInfo)) -> bool {
        let Some(at) = self.position(uid) else {
            return false;
        };
        let before = self.messages[at].clone();
        f(&mut self.messages[at]);
        if self.messages[at] != before {
            self.touch();
            true
        } else {
            false
        }
    }

    /// A local flag change: set the bits of `mask` to their values in `set`. The dirty marker
    /// follows whether the tracked flags now differ from the server's.
    pub fn set_flags(&mut self, uid: &MessageId, mask: MessageFlags, set: MessageFlags) -> bool {
        self.update(uid, |info| {
            let mask = mask - MessageFlag::FolderFlagged;
            info.flags = (info.flags - mask) | (set & mask);
            if info.flags & TRACKED_FLAGS != info.server_flags & TRACKED_FLAGS {
                info.flags |= MessageFlag::FolderFlagged;
            } else {
                info.flags -= MessageFlag::FolderFlagged;
            }
        })
    }

    /// The server stored `set` for the bits of `mask` on `uid`. Bits outside `mask` cannot be
    /// stored in this folder, so the row counts as clean afterwards.
    pub fn confirm(&mut self, uid: &MessageId, mask: MessageFlags, set: MessageFlags) -> bool {
        self.update(uid, |info| {
            let mask = mask & TRACKED_FLAGS;
            let set = set & mask;
            info.server_flags = (info.server_flags - mask) | set;
            info.flags = (info.flags - mask - MessageFlag::FolderFlagged) | set;
        })
    }

    /// Rows with unpushed local flag changes.
    pub fn dirty_messages(&self) -> Vec<MessageInfo> {
        self.messages
            .iter()
            .filter(|m| m.is_dirty() && !m.uid.is_synthetic())
            .cloned()
            .collect()
    }

    /// Replace a synthetic id with the UID the server assigned. The row moves into sequence
    /// position among the real rows.
    pub fn resolve(&mut self, synthetic: &MessageId, real: Uid) -> bool {
        let Some(mut info) = self.remove(synthetic) else {
            return false;
        };
        info.uid = MessageId::Real(real);
        if !self.add(info) {
            // the server already told us about it through a rescan
            return false;
        }
        true
    }

    /// Allocate a fresh synthetic id.
    pub fn next_synthetic(&mut self, kind: SyntheticKind) -> SyntheticId {
        self.next_synthetic += 1;
        self.touch();
        SyntheticId {
            kind,
            serial: self.next_synthetic,
        }
    }

    /// Forget every row, as after a UIDVALIDITY change.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.touch();
    }
}

//! Reconciling flags in both directions: server state into the summary, local changes out to
//! the server.

use std::collections::BTreeMap;

use crate::command::Command;
use crate::summary::MessageInfo;
use crate::types::{MessageFlag, MessageFlags, Uid, TRACKED_FLAGS};

/// Fold flags the server reported into a row.
///
/// Only bits the server changed since it last reported are applied, so a local change the
/// server has not seen yet survives. Returns whether the local flags changed.
pub(crate) fn merge_server_flags(info: &mut MessageInfo, server: MessageFlags) -> bool {
    let server = server & (TRACKED_FLAGS | MessageFlag::Recent);
    let changed = info.server_flags ^ server;
    if changed.is_empty() {
        return false;
    }
    let before = info.flags;
    let set = server & changed;
    let cleared = changed - server;
    info.flags = (info.flags | set) - cleared;
    info.server_flags = server;
    if info.flags & TRACKED_FLAGS != info.server_flags & TRACKED_FLAGS {
        info.flags |= MessageFlag::FolderFlagged;
    } else {
        info.flags -= MessageFlag::FolderFlagged;
    }
    info.flags != before
}

/// Dirty rows that end up with the same flags, pushed with one `STORE`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FlagGroup {
    pub(crate) flags: MessageFlags,
    pub(crate) uids: Vec<Uid>,
}

/// Group `dirty` rows by their flags within `mask`. Groups come out in a stable order and the
/// UIDs of each group ascending.
pub(crate) fn group_for_push(dirty: &[MessageInfo], mask: MessageFlags) -> Vec<FlagGroup> {
    let mask = mask & TRACKED_FLAGS;
    let mut groups: BTreeMap<u32, FlagGroup> = BTreeMap::new();
    for info in dirty {
        let Some(uid) = info.uid.real() else {
            continue;
        };
        let flags = info.flags & mask;
        groups
            .entry(flags.as_u32())
            .or_insert_with(|| FlagGroup {
                flags,
                uids: Vec::new(),
            })
            .uids
            .push(uid);
    }
    groups
        .into_values()
        .map(|mut g| {
            g.uids.sort_unstable();
            g
        })
        .collect()
}

/// The command that makes the server's flags on `uids` equal `flags` within `mask`.
///
/// An empty flag list is sent as a removal of every maskable flag: some servers reject
/// `FLAGS.SILENT ()`.
pub(crate) fn store_command(uids: &[Uid], flags: MessageFlags, mask: MessageFlags) -> Command {
    let cmd = Command::new("UID STORE").uid_set(uids);
    if flags.is_empty() {
        cmd.atom("-FLAGS.SILENT").flag_list(mask & TRACKED_FLAGS)
    } else {
        cmd.atom("FLAGS.SILENT").flag_list(flags)
    }
}

use std::sync::{Arc, Mutex};
use std::thread;

use tempfile::TempDir;

use super::*;
use crate::authenticator::StaticCredentials;
use crate::config::StoreConfig;
use crate::error::ErrorKind;
use crate::store::ImapStore;
use crate::testing::{store_for, FakeServer, Fault};
use crate::types::{SyntheticKind, TRACKED_FLAGS};

const MSG: &[u8] = b"From: a@example.com\r\nSubject: test\r\n\r\nhello\r\n";

fn none() -> MessageFlags {
    MessageFlags::empty()
}

fn seen() -> MessageFlags {
    MessageFlag::Seen.into()
}

fn online(server: &FakeServer) -> (TempDir, ImapStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(server, dir.path()).unwrap();
    store.connect().unwrap();
    (dir, store)
}

fn ids(folder: &ImapFolder) -> Vec<MessageId> {
    folder.messages().iter().map(|m| m.uid).collect()
}

fn real(uids: &[Uid]) -> Vec<MessageId> {
    uids.iter().map(|&u| MessageId::Real(u)).collect()
}

fn record_changes(folder: &ImapFolder) -> (Subscription, Arc<Mutex<Vec<FolderChanges>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let sub = folder.subscribe_changes(move |c| sink.lock().unwrap().push(c.clone()));
    (sub, log)
}

#[test]
fn first_refresh_mirrors_the_mailbox() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, seen());
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);

    let inbox = store.get_folder("INBOX", false).unwrap();
    assert_eq!(inbox.sync_state(), FolderSyncState::Disconnected);
    inbox.refresh_info().unwrap();

    assert_eq!(ids(&inbox), real(&[1, 2]));
    assert_eq!(inbox.sync_state(), FolderSyncState::InSync);
    assert_eq!(inbox.unread_count(), 1);
    assert_eq!(inbox.uid_validity(), Some(1000));
    let row = inbox.message_info(&MessageId::Real(1)).unwrap();
    assert_eq!(row.flags, seen());
    assert_eq!(row.size, MSG.len() as u32);
    assert!(!row.is_dirty());
}

#[test]
fn new_mail_after_reselect_takes_the_fast_path() {
    let server = FakeServer::new();
    server.set_uid_next("INBOX", 101);
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    assert_eq!(ids(&inbox), real(&[101, 102, 103]));

    assert_eq!(server.add_message("INBOX", MSG, seen()), 104);
    store.disconnect().unwrap();
    store.connect().unwrap();
    server.clear_commands();
    let (_sub, changes) = record_changes(&inbox);
    inbox.refresh_info().unwrap();

    let commands = server.commands();
    assert!(commands.contains(&"FETCH 3 (UID)".to_string()), "{:?}", commands);
    assert!(
        commands.contains(&"FETCH 4 (UID FLAGS RFC822.SIZE)".to_string()),
        "{:?}",
        commands
    );
    assert!(!commands.iter().any(|c| c.ends_with("(UID FLAGS)")));
    assert_eq!(ids(&inbox), real(&[101, 102, 103, 104]));
    assert_eq!(inbox.message_info(&MessageId::Real(104)).unwrap().flags, seen());
    let changes = changes.lock().unwrap();
    assert!(changes.iter().any(|c| c.added == real(&[104])));
}

#[test]
fn rescan_converges_after_expunge_and_new_mail() {
    let server = FakeServer::new();
    for _ in 0..4 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    assert_eq!(ids(&inbox), real(&[1, 2, 3, 4]));

    server.expunge_message("INBOX", 2);
    server.set_flags("INBOX", 3, seen());
    server.add_message("INBOX", MSG, none());
    server.add_message("INBOX", MSG, none());
    store.disconnect().unwrap();
    store.connect().unwrap();
    server.clear_commands();
    let (_sub, changes) = record_changes(&inbox);
    inbox.refresh_info().unwrap();

    let commands = server.commands();
    assert!(commands.contains(&"FETCH 4 (UID)".to_string()));
    assert!(commands.contains(&"FETCH 1:5 (UID FLAGS)".to_string()));
    assert!(commands.contains(&"UID FETCH 5:6 (UID FLAGS RFC822.SIZE)".to_string()));
    assert_eq!(ids(&inbox), real(&[1, 3, 4, 5, 6]));
    assert_eq!(inbox.message_info(&MessageId::Real(3)).unwrap().flags, seen());
    assert_eq!(inbox.sync_state(), FolderSyncState::InSync);

    let changes = changes.lock().unwrap();
    let removed: Vec<MessageId> = changes.iter().flat_map(|c| c.removed.clone()).collect();
    let added: Vec<MessageId> = changes.iter().flat_map(|c| c.added.clone()).collect();
    let changed: Vec<MessageId> = changes.iter().flat_map(|c| c.changed.clone()).collect();
    assert_eq!(removed, real(&[2]));
    assert_eq!(added, real(&[5, 6]));
    assert_eq!(changed, real(&[3]));
}

#[test]
fn fast_path_and_rescan_agree() {
    let server = FakeServer::new();
    let flagged: MessageFlags = MessageFlag::Flagged.into();
    server.add_message("INBOX", MSG, seen());
    server.add_message("INBOX", b"short", none());
    server.add_message("INBOX", MSG, flagged | MessageFlag::Answered);
    server.add_message("INBOX", MSG, MessageFlag::Draft.into());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();

    inbox.refresh_info().unwrap();
    let fast = inbox.messages();
    server.clear_commands();
    inbox.rescan().unwrap();

    assert!(server.commands().contains(&"FETCH 1:4 (UID FLAGS)".to_string()));
    assert_eq!(inbox.messages(), fast);
    assert_eq!(inbox.sync_state(), FolderSyncState::InSync);
}

#[test]
fn expunge_from_another_client_arrives_on_noop() {
    let server = FakeServer::new();
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    inbox.get_message(&MessageId::Real(2)).unwrap();
    assert!(inbox.is_cached(&MessageId::Real(2), ""));

    server.expunge_message("INBOX", 2);
    server.set_flags("INBOX", 3, seen());
    server.clear_commands();
    inbox.refresh_info().unwrap();

    assert_eq!(server.commands(), vec!["NOOP".to_string()]);
    assert_eq!(ids(&inbox), real(&[1, 3]));
    assert!(!inbox.is_cached(&MessageId::Real(2), ""));
    assert_eq!(inbox.message_info(&MessageId::Real(3)).unwrap().flags, seen());
}

#[test]
fn uid_validity_change_discards_the_mirror() {
    let server = FakeServer::new();
    server.create_mailbox("Other");
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    inbox.get_message(&MessageId::Real(1)).unwrap();
    // select something else so INBOX is selected afresh
    store.get_folder("Other", false).unwrap().refresh_info().unwrap();

    server.expunge_message("INBOX", 1);
    server.reset_uid_validity("INBOX", 2000);
    server.add_message("INBOX", b"new", none());
    inbox.refresh_info().unwrap();

    assert_eq!(inbox.uid_validity(), Some(2000));
    assert_eq!(ids(&inbox), real(&[1, 2, 3]));
    assert!(!inbox.is_cached(&MessageId::Real(1), ""));
    assert_eq!(inbox.get_message(&MessageId::Real(3)).unwrap(), b"new".to_vec());
    assert_eq!(inbox.sync_state(), FolderSyncState::InSync);
}

#[test]
fn rescan_drops_cached_data_above_the_last_row() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    inbox.get_message(&MessageId::Real(2)).unwrap();
    inbox.inner.cache.insert(&MessageId::Real(7), "", b"left over").unwrap();

    inbox.rescan().unwrap();

    assert!(!inbox.is_cached(&MessageId::Real(7), ""));
    assert!(inbox.is_cached(&MessageId::Real(2), ""));
    assert_eq!(ids(&inbox), real(&[1, 2]));
}

#[test]
fn updates_behind_a_fetched_body_are_applied() {
    let server = FakeServer::new();
    server.add_message("INBOX", b"a", none());
    server.add_message("INBOX", b"b", none());
    server.add_message("INBOX", b"c", none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    server.expunge_message("INBOX", 1);
    server.set_flags("INBOX", 3, seen());
    assert_eq!(inbox.get_message(&MessageId::Real(2)).unwrap(), b"b".to_vec());

    assert_eq!(ids(&inbox), real(&[2, 3]));
    assert_eq!(inbox.message_info(&MessageId::Real(3)).unwrap().flags, seen());
    assert!(inbox.is_cached(&MessageId::Real(2), ""));
}

#[test]
fn get_message_caches_and_get_part_decodes() {
    let server = FakeServer::new();
    server.add_message(
        "INBOX",
        b"Content-Transfer-Encoding: base64\r\n\r\naGVsbG8gd29ybGQ=\r\n",
        none(),
    );
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    let uid = MessageId::Real(1);

    let part = inbox.get_part(&uid, "TEXT", TransferEncoding::Base64).unwrap();
    assert_eq!(part, b"hello world".to_vec());
    assert!(inbox.is_cached(&uid, "TEXT"));

    server.clear_commands();
    inbox.get_message(&uid).unwrap();
    inbox.get_message(&uid).unwrap();
    let fetches: Vec<String> = server
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("UID FETCH"))
        .collect();
    assert_eq!(fetches, vec!["UID FETCH 1 BODY.PEEK[]".to_string()]);
    // peeking leaves the message unread
    assert!(server.messages("INBOX")[0].flags.is_empty());
}

#[test]
fn fetch_survives_a_broken_cache() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    let (dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    let cache = dir.path().join("folders").join("INBOX").join("cache");
    std::fs::remove_dir_all(&cache).unwrap();
    std::fs::write(&cache, b"not a directory").unwrap();

    assert_eq!(inbox.get_message(&MessageId::Real(1)).unwrap(), MSG.to_vec());
}

#[test]
fn local_flag_changes_reach_the_server() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    server.add_message("INBOX", MSG, seen());
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    let flagged: MessageFlags = MessageFlag::Flagged.into();
    let both = seen() | flagged;
    assert!(inbox.set_message_flags(&MessageId::Real(1), both, both).unwrap());
    assert!(inbox.set_message_flags(&MessageId::Real(3), both, both).unwrap());
    assert!(inbox.set_message_flags(&MessageId::Real(2), seen(), none()).unwrap());
    assert!(!inbox.set_message_flags(&MessageId::Real(2), seen(), none()).unwrap());
    assert!(inbox.message_info(&MessageId::Real(1)).unwrap().is_dirty());

    server.clear_commands();
    inbox.sync(false).unwrap();
    let commands = server.commands();
    assert!(commands.contains(&"UID STORE 1,3 FLAGS.SILENT (\\Seen \\Flagged)".to_string()));
    assert!(commands
        .iter()
        .any(|c| c.starts_with("UID STORE 2 -FLAGS.SILENT (")));

    let on_server: Vec<MessageFlags> = server.messages("INBOX").iter().map(|m| m.flags).collect();
    assert_eq!(on_server, vec![both, none(), both]);

    inbox.rescan().unwrap();
    for row in inbox.messages() {
        assert!(!row.is_dirty(), "{} still dirty", row.uid);
        assert_eq!(row.flags, row.server_flags);
    }
}

#[test]
fn server_flag_change_keeps_an_unpushed_local_change() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    let flagged: MessageFlags = MessageFlag::Flagged.into();
    inbox.set_message_flags(&MessageId::Real(1), flagged, flagged).unwrap();
    server.set_flags("INBOX", 1, seen());
    inbox.refresh_info().unwrap();

    let row = inbox.message_info(&MessageId::Real(1)).unwrap();
    assert_eq!(row.flags & TRACKED_FLAGS, seen() | flagged);
    assert!(row.is_dirty());
}

#[test]
fn expunge_with_uidplus() {
    let server = FakeServer::new();
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    let deleted: MessageFlags = MessageFlag::Deleted.into();
    inbox.set_message_flags(&MessageId::Real(2), deleted, deleted).unwrap();
    server.clear_commands();
    inbox.expunge().unwrap();

    assert!(server.commands().contains(&"UID EXPUNGE 2".to_string()));
    assert_eq!(ids(&inbox), real(&[1, 3]));
    let left: Vec<Uid> = server.messages("INBOX").iter().map(|m| m.uid).collect();
    assert_eq!(left, vec![1, 3]);
}

#[test]
fn expunge_without_uidplus_spares_other_deleted_messages() {
    let server = FakeServer::new().without_capability("UIDPLUS");
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    let deleted: MessageFlags = MessageFlag::Deleted.into();
    // another client marked 3 for deletion; we only want 1 gone
    server.set_flags("INBOX", 3, deleted);

    server.clear_commands();
    inbox.expunge_uids(&real(&[1])).unwrap();

    let commands = server.commands();
    let search = commands.iter().position(|c| c == "UID SEARCH DELETED").unwrap();
    let expunge = commands.iter().position(|c| c == "EXPUNGE").unwrap();
    assert!(search < expunge);
    assert!(commands[search..expunge].contains(&"UID STORE 3 -FLAGS.SILENT (\\Deleted)".to_string()));
    assert!(commands[expunge..].contains(&"UID STORE 3 +FLAGS.SILENT (\\Deleted)".to_string()));

    let left: Vec<(Uid, MessageFlags)> = server
        .messages("INBOX")
        .iter()
        .map(|m| (m.uid, m.flags))
        .collect();
    assert_eq!(left, vec![(2, none()), (3, deleted)]);
    assert_eq!(ids(&inbox), real(&[2, 3]));
}

#[test]
fn online_append_records_the_new_uid() {
    let server = FakeServer::new();
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    let id = inbox.append(MSG, seen()).unwrap();
    assert_eq!(id, Some(MessageId::Real(1)));
    assert_eq!(ids(&inbox), real(&[1]));
    assert!(inbox.is_cached(&MessageId::Real(1), ""));
    assert!(server
        .commands()
        .contains(&format!("APPEND \"INBOX\" (\\Seen) {{{}}}", MSG.len())));

    // nothing left for the refresh to find
    server.clear_commands();
    inbox.refresh_info().unwrap();
    assert_eq!(server.commands(), vec!["NOOP".to_string()]);
}

#[test]
fn append_without_uidplus_waits_for_the_refresh() {
    let server = FakeServer::new().without_capability("UIDPLUS");
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    assert_eq!(inbox.append(MSG, none()).unwrap(), None);
    inbox.refresh_info().unwrap();
    assert_eq!(ids(&inbox), real(&[1]));
}

/// Runs the same append online and offline-then-replayed; the summaries must end up equal.
#[test]
fn offline_append_replays_like_an_online_append() {
    let direct = FakeServer::new();
    let (_d1, store) = online(&direct);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    inbox.append(MSG, seen()).unwrap();
    inbox.refresh_info().unwrap();
    let expected = inbox.messages();

    let later = FakeServer::new();
    let (_d2, store) = online(&later);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    store.set_offline().unwrap();

    let id = inbox.append(MSG, seen()).unwrap().unwrap();
    assert!(id.is_synthetic());
    assert!(matches!(id, MessageId::Synthetic(s) if s.kind == SyntheticKind::Append));
    assert_eq!(store.diary().len(), 1);
    assert!(later.messages("INBOX").is_empty());
    assert_eq!(inbox.get_message(&id).unwrap(), MSG.to_vec());

    let outcome = store.connect().unwrap();
    assert_eq!(outcome.replayed, 1);
    assert!(store.diary().is_empty());
    inbox.refresh_info().unwrap();

    assert_eq!(inbox.messages(), expected);
    assert!(inbox.is_cached(&MessageId::Real(1), ""));
    assert_eq!(later.messages("INBOX")[0].flags, seen());
    assert_eq!(later.messages("INBOX")[0].data, MSG.to_vec());
}

#[test]
fn offline_flag_changes_are_pushed_after_reconnect() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    store.set_offline().unwrap();

    inbox.set_message_flags(&MessageId::Real(1), seen(), seen()).unwrap();
    inbox.sync(false).unwrap();
    assert!(server.messages("INBOX")[0].flags.is_empty());

    store.connect().unwrap();
    inbox.sync(false).unwrap();
    assert_eq!(server.messages("INBOX")[0].flags, seen());
    assert!(!inbox.message_info(&MessageId::Real(1)).unwrap().is_dirty());
}

#[test]
fn offline_move_replays_as_copy_and_delete() {
    let server = FakeServer::new();
    server.create_mailbox("Archive");
    server.add_message("INBOX", MSG, seen());
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    let archive = store.get_folder("Archive", false).unwrap();
    inbox.refresh_info().unwrap();
    archive.refresh_info().unwrap();
    // warm the cache so the copy can be read offline
    inbox.get_message(&MessageId::Real(1)).unwrap();
    store.set_offline().unwrap();

    let moved = inbox.move_to(&real(&[1]), &archive).unwrap();
    assert_eq!(moved.len(), 1);
    assert!(moved[0].is_synthetic());
    assert_eq!(archive.get_message(&moved[0]).unwrap(), MSG.to_vec());
    let original = inbox.message_info(&MessageId::Real(1)).unwrap();
    assert!(original.flags.contains(MessageFlag::Deleted));

    store.connect().unwrap();
    assert!(store.diary().is_empty());
    assert_eq!(ids(&archive), real(&[1]));
    assert_eq!(archive.message_info(&MessageId::Real(1)).unwrap().flags, seen());
    assert!(archive.is_cached(&MessageId::Real(1), ""));
    assert_eq!(server.messages("Archive").len(), 1);
    assert!(server.messages("INBOX")[0].flags.contains(MessageFlag::Deleted));
    let source = inbox.message_info(&MessageId::Real(1)).unwrap();
    assert!(source.server_flags.contains(MessageFlag::Deleted));
    assert!(!source.is_dirty());
}

#[test]
fn online_copy_returns_destination_uids() {
    let server = FakeServer::new();
    server.create_mailbox("Archive");
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    let archive = store.get_folder("Archive", false).unwrap();
    archive.refresh_info().unwrap();
    inbox.refresh_info().unwrap();

    let copied = inbox.copy_to(&real(&[1, 3]), &archive).unwrap();
    assert_eq!(copied, real(&[1, 2]));
    assert!(server.commands().contains(&"UID COPY 1,3 \"Archive\"".to_string()));
    assert_eq!(ids(&archive), real(&[1, 2]));
    assert_eq!(ids(&inbox), real(&[1, 2, 3]));

    archive.refresh_info().unwrap();
    assert_eq!(ids(&archive), real(&[1, 2]));
}

#[test]
fn offline_append_expunged_offline_never_reaches_the_server() {
    let server = FakeServer::new();
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    store.set_offline().unwrap();

    let id = inbox.append(MSG, none()).unwrap().unwrap();
    inbox.expunge_uids(&[id]).unwrap();
    assert!(inbox.messages().is_empty());
    assert_eq!(store.diary().len(), 2);

    let outcome = store.connect().unwrap();
    assert_eq!(outcome.dropped, 1);
    assert_eq!(outcome.replayed, 1);
    assert!(server.messages("INBOX").is_empty());
    assert!(!server.commands().iter().any(|c| c.starts_with("APPEND")));
}

#[test]
fn offline_reads_come_from_the_cache() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    inbox.get_message(&MessageId::Real(1)).unwrap();
    store.set_offline().unwrap();

    inbox.refresh_info().unwrap();
    assert_eq!(ids(&inbox), real(&[1, 2]));
    assert_eq!(inbox.get_message(&MessageId::Real(1)).unwrap(), MSG.to_vec());
    let err = inbox.get_message(&MessageId::Real(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Offline);
    assert_eq!(inbox.rescan().unwrap_err().kind(), ErrorKind::Offline);
}

#[test]
fn connection_loss_takes_the_store_offline() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();

    server.fail_on("NOOP", Fault::Disconnect);
    let err = inbox.refresh_info().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(store.mode(), DiscoMode::Offline);
    assert_eq!(inbox.sync_state(), FolderSyncState::Disconnected);
    assert_eq!(ids(&inbox), real(&[1]));

    store.connect().unwrap();
    inbox.refresh_info().unwrap();
    assert_eq!(server.connections(), 2);
    assert_eq!(inbox.sync_state(), FolderSyncState::InSync);
}

#[test]
fn cancelled_refresh_leaves_the_summary_usable() {
    let server = FakeServer::new();
    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    let dir = tempfile::tempdir().unwrap();
    let store = ImapStore::new(
        StoreConfig::new("fake.invalid", "me", dir.path()).fetch_batch_size(2),
        server.connector(),
        StaticCredentials::new("secret"),
    )
    .unwrap();
    store.connect().unwrap();
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    assert!(server.commands().contains(&"FETCH 1:2 (UID FLAGS RFC822.SIZE)".to_string()));

    for _ in 0..3 {
        server.add_message("INBOX", MSG, none());
    }
    store.cancellable().cancel();
    let err = inbox.refresh_info().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(ids(&inbox), real(&[1, 2, 3]));
    assert_eq!(store.mode(), DiscoMode::Online);

    store.cancellable().reset();
    inbox.refresh_info().unwrap();
    assert_eq!(ids(&inbox), real(&[1, 2, 3, 4, 5, 6]));
}

#[test]
fn summary_survives_reopening_the_store() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, seen());
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_for(&server, dir.path()).unwrap();
        store.connect().unwrap();
        let inbox = store.get_folder("INBOX", false).unwrap();
        inbox.refresh_info().unwrap();
        store.disconnect().unwrap();
    }

    let store = store_for(&server, dir.path()).unwrap();
    let inbox = store.get_folder("INBOX", false).unwrap();
    assert_eq!(ids(&inbox), real(&[1]));
    assert_eq!(inbox.uid_validity(), Some(1000));
    assert_eq!(inbox.unread_count(), 0);
}

#[test]
fn concurrent_folders_never_interleave_commands() {
    let server = FakeServer::new();
    server.create_mailbox("Other");
    for i in 0..20 {
        let flags = if i % 2 == 0 { seen() } else { none() };
        server.add_message("INBOX", MSG, flags);
        server.add_message("Other", MSG, flags);
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    let other = store.get_folder("Other", false).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let folder = if t % 2 == 0 { inbox.clone() } else { other.clone() };
            let server = server.clone();
            let mailbox = if t % 2 == 0 { "INBOX" } else { "Other" };
            thread::spawn(move || {
                for round in 0..5u32 {
                    folder.refresh_info().unwrap();
                    folder.get_message(&MessageId::Real(round + 1)).unwrap();
                    if round == 2 {
                        server.add_message(mailbox, MSG, none());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    inbox.refresh_info().unwrap();
    other.refresh_info().unwrap();

    assert_eq!(server.interleavings(), 0);
    assert_eq!(inbox.messages().len(), server.messages("INBOX").len());
    assert_eq!(other.messages().len(), server.messages("Other").len());
}

/// INBOX holds `a`, `b`, `c`, mirrored locally, and the store is offline.
fn offline_with_three_messages(server: &FakeServer) -> (TempDir, ImapStore, ImapFolder) {
    for data in [b"a", b"b", b"c"] {
        server.add_message("INBOX", data, none());
    }
    let (dir, store) = online(server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    inbox.refresh_info().unwrap();
    store.set_offline().unwrap();
    (dir, store, inbox)
}

/// Expunge `a` and renumber what is left: `b` becomes 1, `c` becomes 2.
fn renumber_inbox(server: &FakeServer) {
    server.expunge_message("INBOX", 1);
    server.reset_uid_validity("INBOX", 2000);
}

fn server_data(server: &FakeServer, mailbox: &str) -> Vec<Vec<u8>> {
    server.messages(mailbox).into_iter().map(|m| m.data).collect()
}

#[test]
fn unpushed_flags_stay_behind_after_uid_validity_change() {
    let server = FakeServer::new();
    let (_dir, store, inbox) = offline_with_three_messages(&server);
    inbox.set_message_flags(&MessageId::Real(3), seen(), seen()).unwrap();

    renumber_inbox(&server);
    server.add_message("INBOX", b"d", none());
    store.connect().unwrap();
    server.clear_commands();
    inbox.sync(false).unwrap();

    assert!(server.messages("INBOX").iter().all(|m| m.flags.is_empty()));
    assert!(!server.commands().iter().any(|c| c.starts_with("UID STORE")));
    assert_eq!(inbox.uid_validity(), Some(2000));
    assert!(inbox.messages().iter().all(|m| !m.is_dirty()));
}

#[test]
fn offline_expunge_is_dropped_after_uid_validity_change() {
    let server = FakeServer::new();
    let (_dir, store, inbox) = offline_with_three_messages(&server);
    inbox.expunge_uids(&real(&[2])).unwrap();
    assert_eq!(store.diary().len(), 1);

    renumber_inbox(&server);
    let outcome = store.connect().unwrap();

    assert_eq!(outcome.dropped, 1);
    assert!(store.diary().is_empty());
    assert_eq!(server_data(&server, "INBOX"), vec![b"b".to_vec(), b"c".to_vec()]);
    assert!(!server.commands().iter().any(|c| c.contains("EXPUNGE")));
}

#[test]
fn offline_copy_is_dropped_after_uid_validity_change() {
    let server = FakeServer::new();
    server.create_mailbox("Archive");
    for data in [b"a", b"b", b"c"] {
        server.add_message("INBOX", data, none());
    }
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    let archive = store.get_folder("Archive", false).unwrap();
    inbox.refresh_info().unwrap();
    archive.refresh_info().unwrap();
    store.set_offline().unwrap();

    let copied = inbox.move_to(&real(&[2]), &archive).unwrap();
    assert_eq!(ids(&archive), copied);

    renumber_inbox(&server);
    let outcome = store.connect().unwrap();

    assert_eq!(outcome.dropped, 1);
    assert!(server.messages("Archive").is_empty());
    assert!(server.messages("INBOX").iter().all(|m| m.flags.is_empty()));
    assert!(archive.messages().is_empty());
    assert!(!server.commands().iter().any(|c| c.starts_with("UID COPY")));
}

#[test]
fn offline_copy_records_nothing_when_the_diary_cannot_be_written() {
    let server = FakeServer::new();
    server.create_mailbox("Archive");
    server.add_message("INBOX", MSG, none());
    let (_dir, store) = online(&server);
    let inbox = store.get_folder("INBOX", false).unwrap();
    let archive = store.get_folder("Archive", false).unwrap();
    inbox.refresh_info().unwrap();
    archive.refresh_info().unwrap();
    inbox.get_message(&MessageId::Real(1)).unwrap();
    store.set_offline().unwrap();

    store.diary().break_writes();
    let err = inbox.move_to(&real(&[1]), &archive).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cache);

    assert!(archive.messages().is_empty());
    let source = inbox.message_info(&MessageId::Real(1)).unwrap();
    assert!(!source.flags.contains(MessageFlag::Deleted));
    assert!(!source.is_dirty());
}

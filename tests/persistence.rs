//! The on-disk mirror outlives the process: a store reopened on the same directory picks up
//! the summaries, the message cache and the unreplayed diary.

use imap_disco::testing::{store_for, FakeServer};
use imap_disco::{DiscoMode, ErrorKind, Folder, FolderSyncState, MessageFlag, MessageFlags, MessageId};

const MSG: &[u8] = b"From: a@example.com\r\nSubject: persisted\r\n\r\nstill here\r\n";

#[test]
fn offline_work_survives_a_restart() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, MessageFlags::empty());
    let dir = tempfile::tempdir().unwrap();

    let appended = {
        let store = store_for(&server, dir.path()).unwrap();
        store.connect().unwrap();
        let inbox = store.get_folder("INBOX", false).unwrap();
        inbox.refresh_info().unwrap();
        inbox.get_message(&MessageId::Real(1)).unwrap();
        store.set_offline().unwrap();

        let seen = MessageFlag::Seen.into();
        inbox.set_message_flags(&MessageId::Real(1), seen, seen).unwrap();
        let id = inbox.append(MSG, MessageFlags::empty()).unwrap().unwrap();
        inbox.sync(false).unwrap();
        id
    };

    let store = store_for(&server, dir.path()).unwrap();
    assert_eq!(store.mode(), DiscoMode::Offline);
    assert_eq!(store.diary().len(), 1);
    let inbox = store.get_folder("INBOX", false).unwrap();
    assert_eq!(inbox.sync_state(), FolderSyncState::Disconnected);
    let ids: Vec<MessageId> = inbox.messages().iter().map(|m| m.uid).collect();
    assert_eq!(ids, vec![MessageId::Real(1), appended]);
    assert!(inbox.message_info(&MessageId::Real(1)).unwrap().is_dirty());
    assert_eq!(inbox.get_message(&MessageId::Real(1)).unwrap(), MSG.to_vec());
    assert_eq!(inbox.get_message(&appended).unwrap(), MSG.to_vec());

    let outcome = store.connect().unwrap();
    assert_eq!(outcome.replayed, 1);
    inbox.refresh_info().unwrap();
    inbox.sync(false).unwrap();

    let on_server = server.messages("INBOX");
    assert_eq!(on_server.len(), 2);
    assert!(on_server[0].flags.contains(MessageFlag::Seen));
    assert_eq!(on_server[1].data, MSG.to_vec());
    assert!(inbox.messages().iter().all(|m| !m.uid.is_synthetic() && !m.is_dirty()));
}

#[test]
fn uncached_bodies_are_unavailable_offline_after_a_restart() {
    let server = FakeServer::new();
    server.add_message("INBOX", MSG, MessageFlags::empty());
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_for(&server, dir.path()).unwrap();
        store.connect().unwrap();
        store.get_folder("INBOX", false).unwrap().refresh_info().unwrap();
        store.disconnect().unwrap();
    }

    let store = store_for(&server, dir.path()).unwrap();
    let inbox = store.get_folder("INBOX", false).unwrap();
    assert_eq!(inbox.messages().len(), 1);
    let err = inbox.get_message(&MessageId::Real(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Offline);
    assert!(err.is_retryable());
}

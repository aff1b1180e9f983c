//! An IMAP mail store that keeps working without a connection.
//!
//! [`ImapStore`] mirrors one account to a local directory: a summary per folder (UID, flags and
//! size of every message), a cache of fetched bodies, and a diary of changes made while offline.
//! Folders are reached through [`ImapFolder`]; the [`Folder`] trait dispatches each mutating
//! operation to its online, offline or resyncing variant depending on the store's
//! [`DiscoMode`].
//!
//! # Usage
//!
//! ```no_run
//! use imap_disco::authenticator::StaticCredentials;
//! use imap_disco::config::StoreConfig;
//! use imap_disco::{Folder, ImapStore, MessageFlag};
//!
//! # fn main() -> imap_disco::Result<()> {
//! let config = StoreConfig::new("imap.example.com", "me@example.com", "/var/lib/mail/me");
//! let connector = config.connector();
//! let store = ImapStore::new(config, connector, StaticCredentials::new("hunter2"))?;
//!
//! // replays whatever was done while offline
//! store.connect()?;
//!
//! let inbox = store.get_folder("INBOX", false)?;
//! inbox.refresh_info()?;
//! for message in inbox.messages() {
//!     if !message.flags.contains(MessageFlag::Seen) {
//!         let body = inbox.get_message(&message.uid)?;
//!         println!("{}: {} bytes", message.uid, body.len());
//!     }
//! }
//!
//! // changes made now are journaled and sent on the next connect
//! store.set_offline()?;
//! let seen = MessageFlag::Seen.into();
//! for message in inbox.messages() {
//!     inbox.set_message_flags(&message.uid, seen, seen)?;
//! }
//! inbox.sync(false)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! The crate logs through [`tracing`]; install a subscriber to see it. Commands are logged at
//! `trace` level with credentials redacted.

pub mod authenticator;
pub mod cache;
pub mod cancel;
pub mod changes;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod conn;
pub mod diary;
pub mod error;
pub mod folder;
pub mod parse;
pub mod store;
pub mod summary;
pub mod types;
pub mod utf7;

#[cfg(any(test, feature = "test_helpers"))]
pub mod testing;

#[cfg(test)]
mod mock_stream;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::folder::{DiscoFolder, Folder, FolderSyncState, ImapFolder};
pub use crate::store::ImapStore;
pub use crate::types::*;

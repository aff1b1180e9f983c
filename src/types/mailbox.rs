use std::fmt;

use super::{Flag, MessageFlag, MessageFlags, TRACKED_FLAGS};

/// Meta-information about an IMAP mailbox, as returned by
/// [`SELECT`](https://tools.ietf.org/html/rfc3501#section-6.3.1) and friends.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Mailbox {
    /// Defined flags in the mailbox.  See the description of the [FLAGS
    /// response](https://tools.ietf.org/html/rfc3501#section-7.2.6) for more detail.
    pub flags: Vec<Flag<'static>>,

    /// The number of messages in the mailbox.  See the description of the [EXISTS
    /// response](https://tools.ietf.org/html/rfc3501#section-7.3.1) for more detail.
    pub exists: u32,

    /// The number of messages with the \Recent flag set. See the description of the [RECENT
    /// response](https://tools.ietf.org/html/rfc3501#section-7.3.2) for more detail.
    pub recent: u32,

    /// The message sequence number of the first unseen message in the mailbox.  If this is
    /// missing, the client can not make any assumptions about the first unseen message in the
    /// mailbox, and needs to issue a `SEARCH` command if it wants to find it.
    pub unseen: Option<u32>,

    /// A list of message flags that the client can change permanently.  If this is missing, the
    /// client should assume that all flags can be changed permanently. If the client attempts to
    /// STORE a flag that is not in this list, the server will either ignore the change or store
    /// the state change for the remainder of the current session only.
    pub permanent_flags: Option<Vec<Flag<'static>>>,

    /// The next unique identifier value.  If this is missing, the client can not make any
    /// assumptions about the next unique identifier value.
    pub uid_next: Option<u32>,

    /// The unique identifier validity value.  See [`Uid`](crate::types::Uid) for more details.
    /// If this is missing, the server does not support unique identifiers.
    pub uid_validity: Option<u32>,

    /// The mailbox was opened read-only.
    pub read_only: bool,
}

impl Mailbox {
    /// The flags that may be pushed to the server for this mailbox.
    pub fn permanent_mask(&self) -> MessageFlags {
        if self.read_only {
            return MessageFlags::empty();
        }
        match self.permanent_flags {
            None => TRACKED_FLAGS,
            Some(ref flags) => MessageFlag::set_from_wire(flags) & TRACKED_FLAGS,
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flags: {:?}, exists: {}, recent: {}, unseen: {:?}, permanent_flags: {:?},\
             uid_next: {:?}, uid_validity: {:?}, read_only: {}",
            self.flags,
            self.exists,
            self.recent,
            self.unseen,
            self.permanent_flags,
            self.uid_next,
            self.uid_validity,
            self.read_only,
        )
    }
}

/// The result of a [`STATUS`](https://tools.ietf.org/html/rfc3501#section-6.3.10) command.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct MailboxStatus {
    /// The mailbox the status is about (decoded from modified UTF-7).
    pub mailbox: String,
    /// `MESSAGES`
    pub messages: Option<u32>,
    /// `RECENT`
    pub recent: Option<u32>,
    /// `UNSEEN`
    pub unseen: Option<u32>,
    /// `UIDNEXT`
    pub uid_next: Option<u32>,
    /// `UIDVALIDITY`
    pub uid_validity: Option<u32>,
}

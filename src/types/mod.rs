//! This module contains types used throughout the IMAP protocol and the local mirror.

use std::ops::RangeInclusive;

/// From section [2.3.1.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.1.1).
///
/// A 32-bit value assigned to each message, which together with the mailbox's `UIDVALIDITY`
/// identifies a message forever. UIDs are strictly ascending in sequence-number order, which is
/// what lets the folder summary keep its real rows sorted by UID and still line them up with
/// sequence numbers.
pub type Uid = u32;

/// From section [2.3.1.2 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.1.2).
///
/// A relative position from 1 to the number of messages in the mailbox. Sequence numbers are
/// reassigned on every `EXPUNGE`: all later messages move down by one.
pub type Seq = u32;

mod flag;
pub use self::flag::{Flag, MessageFlag, MessageFlags, TRACKED_FLAGS};

mod message_id;
pub use self::message_id::{MessageId, SyntheticId, SyntheticKind};

mod mailbox;
pub use self::mailbox::{Mailbox, MailboxStatus};

mod fetch;
pub use self::fetch::Fetch;

mod name;
pub use self::name::{Name, NameAttribute};

mod capabilities;
pub use self::capabilities::Capabilities;

/// One personal namespace as reported by the [`NAMESPACE`](https://tools.ietf.org/html/rfc2342)
/// command: a prefix and the hierarchy delimiter used below it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NamespaceEntry {
    /// The namespace prefix, e.g. `"INBOX."` or `""`.
    pub prefix: String,
    /// The hierarchy delimiter, or `None` for a flat namespace.
    pub delimiter: Option<char>,
}

// We need a ResponseCode that is not tied to a lifetime so it can outlive the response buffer.
/// Response code that may be sent with OK/NO/BAD/BYE responses.
/// See [RFC 3501](https://tools.ietf.org/html/rfc3501#section-3.1).
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ResponseCode {
    /// Flags that can be changed permanently.
    PermanentFlags(Vec<String>),
    /// The mailbox status has changed to read-only.
    ReadOnly,
    /// The mailbox status has changed to read-write.
    ReadWrite,
    /// Indicates that the mailbox must be created first.
    TryCreate,
    /// Next unique identifier value.
    UidNext(u32),
    /// The unique identifier validity value.
    UidValidity(u32),
    /// First message without the \Seen flag set.
    Unseen(u32),
    /// [UIDPLUS](https://tools.ietf.org/html/rfc4315) result of `APPEND`.
    AppendUid {
        /// `UIDVALIDITY` of the destination mailbox.
        uid_validity: u32,
        /// The assigned UIDs.
        uids: Vec<RangeInclusive<Uid>>,
    },
    /// [UIDPLUS](https://tools.ietf.org/html/rfc4315) result of `COPY`.
    CopyUid {
        /// `UIDVALIDITY` of the destination mailbox.
        uid_validity: u32,
        /// Source UIDs, in the order the destination UIDs are listed.
        source: Vec<RangeInclusive<Uid>>,
        /// Destination UIDs.
        dest: Vec<RangeInclusive<Uid>>,
    },
    /// Any other response code.
    Other,
}

fn uid_ranges(set: Vec<imap_proto::UidSetMember>) -> Vec<RangeInclusive<Uid>> {
    set.into_iter()
        .map(|m| match m {
            imap_proto::UidSetMember::UidRange(r) => r,
            imap_proto::UidSetMember::Uid(u) => u..=u,
        })
        .collect()
}

/// Flattens a list of UID ranges into the individual UIDs, in order.
pub fn expand_ranges(ranges: &[RangeInclusive<Uid>]) -> Vec<Uid> {
    ranges.iter().flat_map(|r| r.clone()).collect()
}

impl<'a> From<imap_proto::types::ResponseCode<'a>> for ResponseCode {
    fn from(r: imap_proto::types::ResponseCode<'a>) -> Self {
        use imap_proto::types::ResponseCode as R;
        match r {
            R::PermanentFlags(v) => {
                ResponseCode::PermanentFlags(v.iter().map(|x| x.to_string()).collect())
            }
            R::ReadOnly => ResponseCode::ReadOnly,
            R::ReadWrite => ResponseCode::ReadWrite,
            R::TryCreate => ResponseCode::TryCreate,
            R::UidNext(n) => ResponseCode::UidNext(n),
            R::UidValidity(n) => ResponseCode::UidValidity(n),
            R::Unseen(n) => ResponseCode::Unseen(n),
            R::AppendUid(uid_validity, uids) => ResponseCode::AppendUid {
                uid_validity,
                uids: uid_ranges(uids),
            },
            R::CopyUid(uid_validity, source, dest) => ResponseCode::CopyUid {
                uid_validity,
                source: uid_ranges(source),
                dest: uid_ranges(dest),
            },
            _ => ResponseCode::Other,
        }
    }
}

/// The connectivity mode of a store. Every mutating folder operation has one implementation per
/// mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscoMode {
    /// Operations go to the server immediately.
    Online,
    /// Operations touch only the local mirror and are journaled to the diary.
    Offline,
    /// The diary is being replayed against a fresh connection.
    Resyncing,
}

use std::borrow::Cow;

use enumset::{enum_set, EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

/// With the exception of [`Flag::Custom`], these flags are system flags that are pre-defined in
/// [RFC 3501 section 2.3.2](https://tools.ietf.org/html/rfc3501#section-2.3.2). This is the
/// wire form; the summary keeps the bitset form, [`MessageFlags`].
///
/// > Note: The `\Recent` system flag is a special case of a session flag.  `\Recent` can not be
/// > used as an argument in a `STORE` or `APPEND` command, and thus can not be changed at all.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum Flag<'a> {
    /// Message has been read
    Seen,

    /// Message has been answered
    Answered,

    /// Message is "flagged" for urgent/special attention
    Flagged,

    /// Message is "deleted" for removal by later EXPUNGE
    Deleted,

    /// Message has not completed composition (marked as a draft).
    Draft,

    /// Message is "recently" arrived in this mailbox.
    Recent,

    /// The [`Mailbox::permanent_flags`](crate::types::Mailbox::permanent_flags) can include this
    /// special flag (`\*`), which indicates that it is possible to create new keywords by
    /// attempting to store those flags in the mailbox.
    MayCreate,

    /// A non-standard user- or server-defined flag.
    Custom(Cow<'a, str>),
}

impl Flag<'static> {
    fn system(s: &str) -> Option<Self> {
        // system flags are case-insensitive on the wire
        match s.to_ascii_lowercase().as_str() {
            "\\seen" => Some(Flag::Seen),
            "\\answered" => Some(Flag::Answered),
            "\\flagged" => Some(Flag::Flagged),
            "\\deleted" => Some(Flag::Deleted),
            "\\draft" => Some(Flag::Draft),
            "\\recent" => Some(Flag::Recent),
            "\\*" => Some(Flag::MayCreate),
            _ => None,
        }
    }
}

impl<'a> Flag<'a> {
    /// Get an owned version of the [`Flag`].
    pub fn into_owned(self) -> Flag<'static> {
        match self {
            Flag::Custom(cow) => Flag::Custom(Cow::Owned(cow.into_owned())),
            Flag::Seen => Flag::Seen,
            Flag::Answered => Flag::Answered,
            Flag::Flagged => Flag::Flagged,
            Flag::Deleted => Flag::Deleted,
            Flag::Draft => Flag::Draft,
            Flag::Recent => Flag::Recent,
            Flag::MayCreate => Flag::MayCreate,
        }
    }
}

impl<'a> std::fmt::Display for Flag<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::MayCreate => write!(f, "\\*"),
            Flag::Custom(ref s) => write!(f, "{}", s),
        }
    }
}

impl<'a> From<String> for Flag<'a> {
    fn from(s: String) -> Self {
        if let Some(f) = Flag::system(&s) {
            f
        } else {
            Flag::Custom(Cow::Owned(s))
        }
    }
}

impl<'a> From<&'a str> for Flag<'a> {
    fn from(s: &'a str) -> Self {
        if let Some(f) = Flag::system(s) {
            f
        } else {
            Flag::Custom(Cow::Borrowed(s))
        }
    }
}

/// One bit of a message's locally tracked state.
#[derive(EnumSetType, Debug, Hash, Serialize, Deserialize)]
#[enumset(serialize_repr = "u32")]
pub enum MessageFlag {
    /// `\Seen`
    Seen,
    /// `\Answered`
    Answered,
    /// `\Deleted`
    Deleted,
    /// `\Draft`
    Draft,
    /// `\Flagged`
    Flagged,
    /// `\Recent`; session-only, never pushed.
    Recent,
    /// Local flags diverge from what the server last confirmed.
    FolderFlagged,
}

/// A message's flags as a bitset.
pub type MessageFlags = EnumSet<MessageFlag>;

/// The flags that are mirrored to and from the server.
pub const TRACKED_FLAGS: MessageFlags = enum_set!(
    MessageFlag::Seen
        | MessageFlag::Answered
        | MessageFlag::Deleted
        | MessageFlag::Draft
        | MessageFlag::Flagged
);

impl MessageFlag {
    /// The wire flag for this bit, if it has one.
    pub fn to_wire(self) -> Option<Flag<'static>> {
        match self {
            MessageFlag::Seen => Some(Flag::Seen),
            MessageFlag::Answered => Some(Flag::Answered),
            MessageFlag::Deleted => Some(Flag::Deleted),
            MessageFlag::Draft => Some(Flag::Draft),
            MessageFlag::Flagged => Some(Flag::Flagged),
            MessageFlag::Recent => Some(Flag::Recent),
            MessageFlag::FolderFlagged => None,
        }
    }

    /// The bit for a wire flag; keywords have none.
    pub fn from_wire(flag: &Flag<'_>) -> Option<MessageFlag> {
        match flag {
            Flag::Seen => Some(MessageFlag::Seen),
            Flag::Answered => Some(MessageFlag::Answered),
            Flag::Deleted => Some(MessageFlag::Deleted),
            Flag::Draft => Some(MessageFlag::Draft),
            Flag::Flagged => Some(MessageFlag::Flagged),
            Flag::Recent => Some(MessageFlag::Recent),
            Flag::MayCreate | Flag::Custom(_) => None,
        }
    }

    /// Collect wire flags into a bitset, ignoring keywords.
    pub fn set_from_wire<'a, 'b: 'a>(flags: impl IntoIterator<Item = &'a Flag<'b>>) -> MessageFlags {
        flags.into_iter().filter_map(MessageFlag::from_wire).collect()
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Uid;

/// What kind of offline operation produced a [`SyntheticId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyntheticKind {
    /// A message appended while offline.
    Append,
    /// A message copied into a folder while offline.
    Copy,
}

/// A folder-local identifier handed out while offline, until the server assigns a real UID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyntheticId {
    /// The operation that created the message.
    pub kind: SyntheticKind,
    /// Serial number, unique within the folder.
    pub serial: u32,
}

/// Identifies a message within one folder.
///
/// Whether an identifier is a server UID or a placeholder is a type-level question: only
/// `Real` identifiers can ever be sent to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageId {
    /// A UID assigned by the server in the folder's current `UIDVALIDITY` epoch.
    Real(Uid),
    /// A placeholder created by an offline operation.
    Synthetic(SyntheticId),
}

impl MessageId {
    /// The server UID, if this identifier has one.
    pub fn real(&self) -> Option<Uid> {
        match *self {
            MessageId::Real(uid) => Some(uid),
            MessageId::Synthetic(_) => None,
        }
    }

    /// Whether this is a placeholder.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, MessageId::Synthetic(_))
    }
}

impl From<Uid> for MessageId {
    fn from(uid: Uid) -> Self {
        MessageId::Real(uid)
    }
}

impl From<SyntheticId> for MessageId {
    fn from(id: SyntheticId) -> Self {
        MessageId::Synthetic(id)
    }
}

impl fmt::Display for SyntheticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SyntheticKind::Append => write!(f, "append-{}", self.serial),
            SyntheticKind::Copy => write!(f, "copy-{}", self.serial),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Real(uid) => write!(f, "{}", uid),
            MessageId::Synthetic(id) => id.fmt(f),
        }
    }
}

/// The string was not a UID or a synthetic identifier.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidMessageId(pub String);

impl fmt::Display for InvalidMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message id {:?}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = InvalidMessageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let synthetic = |kind, serial: &str| {
            serial
                .parse()
                .map(|serial| MessageId::Synthetic(SyntheticId { kind, serial }))
                .map_err(|_| InvalidMessageId(s.to_string()))
        };
        if let Some(serial) = s.strip_prefix("append-") {
            synthetic(SyntheticKind::Append, serial)
        } else if let Some(serial) = s.strip_prefix("copy-") {
            synthetic(SyntheticKind::Copy, serial)
        } else {
            match s.parse::<Uid>() {
                Ok(uid) if uid > 0 => Ok(MessageId::Real(uid)),
                _ => Err(InvalidMessageId(s.to_string())),
            }
        }
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = InvalidMessageId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

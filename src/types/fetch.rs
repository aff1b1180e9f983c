use super::{Flag, MessageFlag, MessageFlags, Seq, Uid};

/// An IMAP [`FETCH` response](https://tools.ietf.org/html/rfc3501#section-7.4.2) that contains
/// data about a particular message. This response occurs as the result of a `FETCH` or `STORE`
/// command, as well as by unilateral server decision (e.g., flag updates).
///
/// Every item is optional: servers send items in any order and only those that were asked for
/// (plus whatever they volunteer).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fetch {
    /// The ordinal number of this message in its containing mailbox.
    pub message: Seq,

    /// A number expressing the unique identifier of the message.
    pub uid: Option<Uid>,

    /// The `FLAGS` item, if present.
    pub flags: Option<Vec<Flag<'static>>>,

    /// `RFC822.SIZE`
    pub size: Option<u32>,

    /// `INTERNALDATE`, unparsed.
    pub internal_date: Option<String>,

    /// `BODYSTRUCTURE` (or `BODY` without a section), kept as the raw parenthesized text for a
    /// separate structure parser.
    pub body_structure: Option<String>,

    /// `ENVELOPE`, kept as raw parenthesized text.
    pub envelope: Option<String>,

    /// Every `BODY[section]` item, keyed by the section text. `RFC822` is reported as section
    /// `""`, `RFC822.HEADER` as `"HEADER"` and `RFC822.TEXT` as `"TEXT"`. `NIL` data is `None`.
    pub sections: Vec<(String, Option<Vec<u8>>)>,
}

impl Fetch {
    /// The flags as a bitset, if the `FLAGS` item was present.
    pub fn message_flags(&self) -> Option<MessageFlags> {
        self.flags.as_ref().map(|f| MessageFlag::set_from_wire(f))
    }

    /// The data for the given section, if it was returned.
    pub fn section(&self, section: &str) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(section))
            .and_then(|(_, data)| data.as_deref())
    }

    /// The full message, if `BODY[]` or `RFC822` was included.
    pub fn body(&self) -> Option<&[u8]> {
        self.section("")
    }
}

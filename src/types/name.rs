use std::borrow::Cow;

/// A name that matches a `LIST` or `LSUB` command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Name {
    pub(crate) attributes: Vec<NameAttribute<'static>>,
    pub(crate) delimiter: Option<char>,
    pub(crate) name: String,
}

/// An attribute set for an IMAP name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum NameAttribute<'a> {
    /// It is not possible for any child levels of hierarchy to exist
    /// under this name; no child levels exist now and none can be
    /// created in the future.
    NoInferiors,

    /// It is not possible to use this name as a selectable mailbox.
    NoSelect,

    /// The mailbox has been marked "interesting" by the server; the
    /// mailbox probably contains messages that have been added since
    /// the last time the mailbox was selected.
    Marked,

    /// The mailbox does not contain any additional messages since the
    /// last time the mailbox was selected.
    Unmarked,

    /// [RFC 3348](https://tools.ietf.org/html/rfc3348): the mailbox has children.
    HasChildren,

    /// [RFC 3348](https://tools.ietf.org/html/rfc3348): the mailbox has no children.
    HasNoChildren,

    /// A non-standard user- or server-defined name attribute.
    Custom(Cow<'a, str>),
}

impl<'a> NameAttribute<'a> {
    fn system(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "\\noinferiors" => Some(NameAttribute::NoInferiors),
            "\\noselect" | "\\nonexistent" => Some(NameAttribute::NoSelect),
            "\\marked" => Some(NameAttribute::Marked),
            "\\unmarked" => Some(NameAttribute::Unmarked),
            "\\haschildren" => Some(NameAttribute::HasChildren),
            "\\hasnochildren" => Some(NameAttribute::HasNoChildren),
            _ => None,
        }
    }
}

impl<'a> From<String> for NameAttribute<'a> {
    fn from(s: String) -> Self {
        if let Some(f) = NameAttribute::system(&s) {
            f
        } else {
            NameAttribute::Custom(Cow::Owned(s))
        }
    }
}

impl<'a> From<&'a str> for NameAttribute<'a> {
    fn from(s: &'a str) -> Self {
        if let Some(f) = NameAttribute::system(s) {
            f
        } else {
            NameAttribute::Custom(Cow::Borrowed(s))
        }
    }
}

impl Name {
    /// Attributes of this name.
    pub fn attributes(&self) -> &[NameAttribute<'static>] {
        &self.attributes[..]
    }

    /// The hierarchy delimiter is a character used to delimit levels of hierarchy in a mailbox
    /// name.  `None` means that no hierarchy exists; the name is a "flat" name.
    pub fn delimiter(&self) -> Option<char> {
        self.delimiter
    }

    /// The mailbox name, decoded from modified UTF-7.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the attribute list contains `attr`.
    pub fn has(&self, attr: &NameAttribute<'_>) -> bool {
        self.attributes.iter().any(|a| a == attr)
    }
}

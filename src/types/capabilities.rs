use std::collections::hash_set::Iter;
use std::collections::HashSet;

/// From [section 7.2.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-7.2.1).
///
/// A list of capabilities that the server supports. Capability names are compared
/// case-insensitively; they are stored upper-cased.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities(pub(crate) HashSet<String>);

impl Capabilities {
    /// Build from the atoms of a `CAPABILITY` response.
    pub fn new<S: AsRef<str>>(atoms: impl IntoIterator<Item = S>) -> Self {
        Capabilities(
            atoms
                .into_iter()
                .map(|a| a.as_ref().to_ascii_uppercase())
                .collect(),
        )
    }

    /// Check if the server has the given capability.
    pub fn has(&self, s: &str) -> bool {
        self.0.contains(&s.to_ascii_uppercase())
    }

    /// Iterate over all the server's capabilities
    pub fn iter(&self) -> Iter<'_, String> {
        self.0.iter()
    }

    /// Returns how many capabilities the server has.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the server purports to have no capabilities.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

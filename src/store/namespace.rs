//! Mapping between local folder paths and the server's mailbox names.

use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref ESCAPED: Regex = Regex::new("%(2[Ff]|25)").expect("static regex");
}

/// A personal namespace: a prefix and the hierarchy separator.
///
/// Local paths always use `/` between components and never include the prefix. A `/` or `%`
/// inside a server-side component is escaped as `%2F` or `%25`, so
/// `path_to_full(full_to_path(x)) == x` for every name `x` under the namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    separator: char,
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace {
            prefix: String::new(),
            separator: '/',
        }
    }
}

fn escape(component: &str) -> Cow<'_, str> {
    if component.contains(['%', '/']) {
        Cow::Owned(component.replace('%', "%25").replace('/', "%2F"))
    } else {
        Cow::Borrowed(component)
    }
}

fn unescape(component: &str) -> Cow<'_, str> {
    ESCAPED.replace_all(component, |caps: &Captures<'_>| {
        if &caps[1] == "25" {
            "%".to_string()
        } else {
            "/".to_string()
        }
    })
}

impl Namespace {
    /// A namespace with the prefix canonicalized to end in the separator. A missing separator
    /// (a flat server) is treated as `/`.
    pub fn new(prefix: &str, separator: Option<char>) -> Namespace {
        let separator = separator.unwrap_or('/');
        let mut prefix = prefix.to_string();
        if !prefix.is_empty() && !prefix.ends_with(separator) {
            prefix.push(separator);
        }
        Namespace { prefix, separator }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    /// The local path for a server mailbox name.
    pub fn full_to_path(&self, full: &str) -> String {
        if full.eq_ignore_ascii_case("INBOX") {
            return "INBOX".to_string();
        }
        let rest = full.strip_prefix(self.prefix.as_str()).unwrap_or(full);
        rest.split(self.separator)
            .map(escape)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// The server mailbox name for a local path.
    pub fn path_to_full(&self, path: &str) -> String {
        if path.eq_ignore_ascii_case("INBOX") {
            return "INBOX".to_string();
        }
        let sep = self.separator.to_string();
        let body = path
            .split('/')
            .map(unescape)
            .collect::<Vec<_>>()
            .join(&sep);
        format!("{}{}", self.prefix, body)
    }

    /// The `LIST` patterns for the folders at or below `top`.
    pub(crate) fn list_patterns(&self, top: &str, recursive: bool) -> Vec<String> {
        let wildcard = if recursive { '*' } else { '%' };
        if top.is_empty() {
            // INBOX is outside a prefix such as `INBOX.`
            vec![format!("{}{}", self.prefix, wildcard), "INBOX".to_string()]
        } else {
            let full = self.path_to_full(top);
            vec![full.clone(), format!("{}{}{}", full, self.separator, wildcard)]
        }
    }
}

/// Whether mailbox `name` matches the `LIST` pattern: `*` matches anything, `%` anything but
/// the separator. INBOX matches case-insensitively.
pub(crate) fn wildcard_match(pattern: &str, name: &str, separator: char) -> bool {
    if name.eq_ignore_ascii_case("INBOX") && pattern.eq_ignore_ascii_case("INBOX") {
        return true;
    }
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '%' => {
                re.push_str("[^");
                re.push_str(&regex::escape(&separator.to_string()));
                re.push_str("]*");
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|re| re.is_match(name)).unwrap_or(false)
}

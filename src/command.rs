//! Building IMAP command lines.

use std::fmt::{self, Write as _};

use crate::error::{Error, Result, ValidateError};
use crate::types::{MessageFlag, MessageFlags, Uid};
use crate::utf7;

/// A piece of a command as it goes onto the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Piece {
    /// Plain command text.
    Text(Vec<u8>),
    /// A synchronizing literal; the server must answer `+` before the bytes follow.
    Literal(Vec<u8>),
}

/// An untagged IMAP command, built argument by argument.
///
/// Arguments are separated by single spaces. Strings are sent as quoted strings when that is
/// possible and as literals otherwise, so callers never format user data into the command text
/// themselves.
///
/// ```
/// # use imap_disco::command::Command;
/// let cmd = Command::new("UID FETCH").uid_set(&[1, 2, 3, 7]).atom("(UID FLAGS)");
/// assert_eq!(cmd.to_string(), "UID FETCH 1:3,7 (UID FLAGS)");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pieces: Vec<Piece>,
    sensitive: bool,
}

macro_rules! quote {
    ($x:expr) => {
        format!("\"{}\"", $x.replace('\\', r"\\").replace('"', "\\\""))
    };
}

fn needs_literal(s: &[u8]) -> bool {
    s.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0 || b >= 0x80)
}

pub(crate) fn validate_str(value: &str) -> Result<String> {
    if let Some(c) = value.chars().find(|&c| c == '\r' || c == '\n') {
        return Err(Error::Validate(ValidateError(c)));
    }
    Ok(quote!(value))
}

impl Command {
    /// Start a command with the given verb, e.g. `"SELECT"` or `"UID STORE"`.
    pub fn new(verb: &str) -> Self {
        Command {
            pieces: vec![Piece::Text(verb.as_bytes().to_vec())],
            sensitive: false,
        }
    }

    fn push_text(&mut self, text: &[u8]) {
        if let Some(Piece::Text(buf)) = self.pieces.last_mut() {
            buf.extend_from_slice(text);
        } else {
            self.pieces.push(Piece::Text(text.to_vec()));
        }
    }

    fn space(&mut self) {
        self.push_text(b" ");
    }

    /// Append a bare token verbatim. Used for atoms, numbers and pre-built item lists.
    pub fn atom(mut self, atom: impl fmt::Display) -> Self {
        self.space();
        self.push_text(atom.to_string().as_bytes());
        self
    }

    /// Append a string argument, quoted, or as a literal when it cannot be quoted.
    pub fn string(mut self, s: &str) -> Self {
        self.space();
        if needs_literal(s.as_bytes()) {
            self.pieces.push(Piece::Literal(s.as_bytes().to_vec()));
        } else {
            self.push_text(quote!(s).as_bytes());
        }
        self
    }

    /// Append a mailbox name, encoded to modified UTF-7.
    pub fn mailbox(self, name: &str) -> Self {
        // INBOX is case-insensitive on the wire and never encoded
        if name.eq_ignore_ascii_case("INBOX") {
            return self.string("INBOX");
        }
        let encoded = utf7::encode(name);
        self.string(&encoded)
    }

    /// Append raw bytes as a literal.
    pub fn literal(mut self, data: &[u8]) -> Self {
        self.space();
        self.pieces.push(Piece::Literal(data.to_vec()));
        self
    }

    /// Append a parenthesized system flag list. `FolderFlagged` is local state and never sent.
    pub fn flag_list(self, flags: MessageFlags) -> Self {
        let names: Vec<String> = flags
            .iter()
            .filter_map(MessageFlag::to_wire)
            .map(|f| f.to_string())
            .collect();
        self.atom(format!("({})", names.join(" ")))
    }

    /// Append a UID set in compact range form.
    pub fn uid_set(self, uids: &[Uid]) -> Self {
        self.atom(uid_set_string(uids))
    }

    /// Append a sequence range `lo:hi`, or a single number when they are equal.
    pub fn seq_range(self, lo: u32, hi: u32) -> Self {
        if lo == hi {
            self.atom(lo)
        } else {
            self.atom(format!("{}:{}", lo, hi))
        }
    }

    /// Hide the arguments of this command from logs.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Build `LOGIN user password`. The user name may not contain CR or LF.
    pub fn login(username: &str, password: &str) -> Result<Self> {
        let user = validate_str(username)?;
        Ok(Command::new("LOGIN").atom(user).string(password).sensitive())
    }

    pub(crate) fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// The verb, for logging.
    pub fn verb(&self) -> String {
        match self.pieces.first() {
            Some(Piece::Text(t)) => String::from_utf8_lossy(t)
                .split(' ')
                .take_while(|w| w.chars().all(|c| c.is_ascii_uppercase()))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }

    /// The command as it should appear in logs.
    pub(crate) fn redacted(&self) -> String {
        if self.sensitive {
            format!("{} <redacted>", self.verb())
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for piece in &self.pieces {
            match piece {
                Piece::Text(t) => f.write_str(&String::from_utf8_lossy(t))?,
                Piece::Literal(l) => write!(f, "{{{}}}", l.len())?,
            }
        }
        Ok(())
    }
}

/// Format UIDs as an IMAP set, collapsing runs: `[1, 2, 3, 7]` becomes `1:3,7`. Input order is
/// preserved apart from runs, so callers sort first when they want the shortest form.
pub fn uid_set_string(uids: &[Uid]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < uids.len() {
        let start = uids[i];
        let mut end = start;
        while i + 1 < uids.len() && uids[i + 1] == end.wrapping_add(1) {
            end = uids[i + 1];
            i += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            let _ = write!(out, "{}", start);
        } else {
            let _ = write!(out, "{}:{}", start, end);
        }
        i += 1;
    }
    out
}

/// Split sorted UIDs into chunks whose set strings stay within `max_len` bytes. A single UID
/// always forms a chunk, even if `max_len` is tiny.
pub fn split_uid_sets(uids: &[Uid], max_len: usize) -> Vec<Vec<Uid>> {
    let mut chunks: Vec<Vec<Uid>> = Vec::new();
    let mut current: Vec<Uid> = Vec::new();
    for &uid in uids {
        current.push(uid);
        if current.len() > 1 && uid_set_string(&current).len() > max_len {
            current.pop();
            chunks.push(std::mem::take(&mut current));
            current.push(uid);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_backslash() {
        assert_eq!("\"test\\\\text\"", quote!(r"test\text"));
    }

    #[test]
    fn quote_dquote() {
        assert_eq!("\"test\\\"text\"", quote!("test\"text"));
    }

    #[test]
    fn validate_random() {
        assert_eq!(
            "\"~iCQ_k;>[&\\\"sVCvUW`e<<P!wJ\"",
            &validate_str("~iCQ_k;>[&\"sVCvUW`e<<P!wJ").unwrap()
        );
    }

    #[test]
    fn validate_newline() {
        if let Err(ref e) = validate_str("test\nstring") {
            if let Error::Validate(ref ve) = e {
                if ve.0 == '\n' {
                    return;
                }
            }
            panic!("Wrong error: {:?}", e);
        }
        panic!("No error");
    }

    #[test]
    fn login_rejects_carriage_return() {
        match Command::login("user\r", "pw") {
            Err(Error::Validate(ValidateError('\r'))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn password_with_newline_becomes_literal() {
        let cmd = Command::login("user", "pa\nss").unwrap();
        assert_eq!(cmd.to_string(), "LOGIN \"user\" {5}");
        assert_eq!(cmd.redacted(), "LOGIN <redacted>");
    }

    #[test]
    fn mailbox_names_are_utf7() {
        let cmd = Command::new("SELECT").mailbox("Entwürfe");
        assert_eq!(cmd.to_string(), "SELECT \"Entw&APw-rfe\"");
        let cmd = Command::new("SELECT").mailbox("inbox");
        assert_eq!(cmd.to_string(), "SELECT \"INBOX\"");
    }

    #[test]
    fn flag_list_skips_local_marker() {
        let cmd = Command::new("UID STORE")
            .uid_set(&[4])
            .atom("FLAGS.SILENT")
            .flag_list(MessageFlag::Seen | MessageFlag::FolderFlagged);
        assert_eq!(cmd.to_string(), "UID STORE 4 FLAGS.SILENT (\\Seen)");
    }

    #[test]
    fn uid_sets_collapse_runs() {
        assert_eq!(uid_set_string(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(uid_set_string(&[5]), "5");
        assert_eq!(uid_set_string(&[]), "");
    }

    #[test]
    fn uid_sets_split_at_length() {
        let uids = [1, 3, 5, 7, 9];
        let chunks = split_uid_sets(&uids, 5);
        assert_eq!(chunks, vec![vec![1, 3, 5], vec![7, 9]]);
        for chunk in &chunks {
            assert!(uid_set_string(chunk).len() <= 5);
        }
        assert_eq!(split_uid_sets(&[123456], 2), vec![vec![123456]]);
    }

    #[test]
    fn verb_ignores_arguments() {
        assert_eq!(Command::new("UID FETCH").atom("1:*").verb(), "UID FETCH");
    }
}

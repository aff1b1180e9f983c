//! An in-memory IMAP server for exercising the store without a network.
//!
//! Enable the `test_helpers` feature to use it from your own tests:
//!
//! ```toml
//! [dev-dependencies]
//! imap-disco = { version = "0.1", features = ["test_helpers"] }
//! ```
//!
//! ```ignore
//! # use imap_disco::testing::FakeServer;
//! # use imap_disco::types::MessageFlag;
//! let server = FakeServer::new();
//! let uid = server.add_message("INBOX", b"Subject: hi\r\n\r\nhello\r\n", MessageFlag::Seen.into());
//! assert_eq!(uid, 1);
//! assert_eq!(server.messages("INBOX").len(), 1);
//! ```
//!
//! The server understands the commands the store sends, keeps a separate view of the selected
//! mailbox per connection (so changes made through [`FakeServer`] are only reported on the next
//! `NOOP`), and records every command it receives. Faults can be injected per command verb.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::authenticator::StaticCredentials;
use crate::client::Client;
use crate::command::uid_set_string;
use crate::config::StoreConfig;
use crate::conn::{Connection, Connector};
use crate::error::{Error, Result};
use crate::store::namespace::wildcard_match;
use crate::store::ImapStore;
use crate::types::{Flag, MessageFlag, MessageFlags, Seq, Uid, TRACKED_FLAGS};

const FIRST_UID_VALIDITY: u32 = 1000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One message as the server stores it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeMessage {
    pub uid: Uid,
    pub flags: MessageFlags,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
struct FakeMailbox {
    uid_validity: u32,
    uid_next: Uid,
    messages: Vec<FakeMessage>,
    permanent: MessageFlags,
}

impl FakeMailbox {
    fn new(uid_validity: u32) -> Self {
        FakeMailbox {
            uid_validity,
            uid_next: 1,
            messages: Vec::new(),
            permanent: TRACKED_FLAGS,
        }
    }

    fn add(&mut self, data: Vec<u8>, flags: MessageFlags) -> Uid {
        let uid = self.uid_next;
        self.uid_next += 1;
        self.messages.push(FakeMessage {
            uid,
            flags: flags & TRACKED_FLAGS,
            data,
        });
        uid
    }

    fn find(&self, uid: Uid) -> Option<&FakeMessage> {
        self.messages
            .binary_search_by_key(&uid, |m| m.uid)
            .ok()
            .map(|i| &self.messages[i])
    }

    fn find_mut(&mut self, uid: Uid) -> Option<&mut FakeMessage> {
        match self.messages.binary_search_by_key(&uid, |m| m.uid) {
            Ok(i) => Some(&mut self.messages[i]),
            Err(_) => None,
        }
    }
}

/// What happens to the next command with a given verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The connection drops before the command is executed.
    Disconnect,
    /// The command is refused with a tagged `NO`.
    No,
}

#[derive(Debug)]
struct ServerState {
    mailboxes: BTreeMap<String, FakeMailbox>,
    subscriptions: BTreeSet<String>,
    capabilities: Vec<String>,
    password: String,
    separator: char,
    next_validity: u32,
    reachable: bool,
    faults: Vec<(String, Fault)>,
    log: Vec<String>,
    interleavings: usize,
    links: Vec<Arc<AtomicBool>>,
}

impl ServerState {
    fn has(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    fn take_fault(&mut self, verb: &str) -> Option<Fault> {
        let pos = self.faults.iter().position(|(v, _)| v == verb)?;
        Some(self.faults.remove(pos).1)
    }
}

/// A scripted IMAP server shared by every connection made through its [`FakeConnector`].
#[derive(Clone, Debug)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        FakeServer::new()
    }
}

impl FakeServer {
    /// A server with an empty `INBOX`, UIDPLUS and NAMESPACE, `/` as separator and the
    /// password `secret`.
    pub fn new() -> FakeServer {
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert("INBOX".to_string(), FakeMailbox::new(FIRST_UID_VALIDITY));
        FakeServer {
            state: Arc::new(Mutex::new(ServerState {
                mailboxes,
                subscriptions: BTreeSet::new(),
                capabilities: ["IMAP4rev1", "UIDPLUS", "NAMESPACE", "AUTH=PLAIN"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
                password: "secret".to_string(),
                separator: '/',
                next_validity: FIRST_UID_VALIDITY + 1,
                reachable: true,
                faults: Vec::new(),
                log: Vec::new(),
                interleavings: 0,
                links: Vec::new(),
            })),
        }
    }

    /// Stop advertising (and honouring) `capability`.
    pub fn without_capability(self, capability: &str) -> FakeServer {
        lock(&self.state)
            .capabilities
            .retain(|c| !c.eq_ignore_ascii_case(capability));
        self
    }

    /// Advertise an extra capability, e.g. `LOGINDISABLED`.
    pub fn with_capability(self, capability: &str) -> FakeServer {
        lock(&self.state).capabilities.push(capability.to_string());
        self
    }

    pub fn set_password(&self, password: &str) {
        lock(&self.state).password = password.to_string();
    }

    /// A connector that opens connections to this server.
    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    /// Make new connections fail, or succeed again.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Drop every open connection, as if the network went away.
    pub fn drop_connections(&self) {
        for link in &lock(&self.state).links {
            link.store(false, Ordering::SeqCst);
        }
    }

    /// How many connections have been opened so far.
    pub fn connections(&self) -> usize {
        lock(&self.state).links.len()
    }

    pub fn create_mailbox(&self, name: &str) {
        let mut state = lock(&self.state);
        let validity = state.next_validity;
        state.next_validity += 1;
        state
            .mailboxes
            .entry(name.to_string())
            .or_insert_with(|| FakeMailbox::new(validity));
    }

    pub fn mailboxes(&self) -> Vec<String> {
        lock(&self.state).mailboxes.keys().cloned().collect()
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        lock(&self.state).subscriptions.contains(name)
    }

    /// Deliver a message, as another client would. Returns its UID.
    pub fn add_message(&self, mailbox: &str, data: &[u8], flags: MessageFlags) -> Uid {
        lock(&self.state)
            .mailboxes
            .get_mut(mailbox)
            .expect("no such mailbox")
            .add(data.to_vec(), flags)
    }

    /// Replace the flags of one message, as another client would.
    pub fn set_flags(&self, mailbox: &str, uid: Uid, flags: MessageFlags) {
        let mut state = lock(&self.state);
        let mbox = state.mailboxes.get_mut(mailbox).expect("no such mailbox");
        mbox.find_mut(uid).expect("no such message").flags = flags & TRACKED_FLAGS;
    }

    /// Remove one message, as another client's `EXPUNGE` would.
    pub fn expunge_message(&self, mailbox: &str, uid: Uid) {
        lock(&self.state)
            .mailboxes
            .get_mut(mailbox)
            .expect("no such mailbox")
            .messages
            .retain(|m| m.uid != uid);
    }

    /// Start a new UIDVALIDITY epoch: every message gets a fresh UID from 1. Connections that
    /// have the mailbox selected are not told.
    pub fn reset_uid_validity(&self, mailbox: &str, uid_validity: u32) {
        let mut state = lock(&self.state);
        let mbox = state.mailboxes.get_mut(mailbox).expect("no such mailbox");
        mbox.uid_validity = uid_validity;
        for (i, m) in mbox.messages.iter_mut().enumerate() {
            m.uid = i as Uid + 1;
        }
        mbox.uid_next = mbox.messages.len() as Uid + 1;
    }

    /// Restrict the flags the server keeps for `mailbox`.
    pub fn set_permanent_flags(&self, mailbox: &str, flags: MessageFlags) {
        lock(&self.state)
            .mailboxes
            .get_mut(mailbox)
            .expect("no such mailbox")
            .permanent = flags & TRACKED_FLAGS;
    }

    /// Make the next delivered message get `uid`. UIDs only grow; smaller values are ignored.
    pub fn set_uid_next(&self, mailbox: &str, uid: Uid) {
        let mut state = lock(&self.state);
        let mbox = state.mailboxes.get_mut(mailbox).expect("no such mailbox");
        mbox.uid_next = mbox.uid_next.max(uid);
    }

    pub fn uid_validity(&self, mailbox: &str) -> u32 {
        lock(&self.state)
            .mailboxes
            .get(mailbox)
            .expect("no such mailbox")
            .uid_validity
    }

    pub fn messages(&self, mailbox: &str) -> Vec<FakeMessage> {
        lock(&self.state)
            .mailboxes
            .get(mailbox)
            .map(|m| m.messages.clone())
            .unwrap_or_default()
    }

    /// Apply `fault` to the next command whose verb is `verb`, e.g. `"UID FETCH"`.
    pub fn fail_on(&self, verb: &str, fault: Fault) {
        lock(&self.state)
            .faults
            .push((verb.to_ascii_uppercase(), fault));
    }

    /// Every command received so far, without its tag. Literal data is left out; the `{n}`
    /// announcement stays.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    pub fn clear_commands(&self) {
        lock(&self.state).log.clear();
    }

    /// How often a client started writing while part of a response was still unread.
    pub fn interleavings(&self) -> usize {
        lock(&self.state).interleavings
    }
}

/// An offline store that mirrors `server` into `dir`, logging in with the server's password.
pub fn store_for(server: &FakeServer, dir: &Path) -> Result<ImapStore> {
    let password = lock(&server.state).password.clone();
    ImapStore::new(
        StoreConfig::new("fake.invalid", "me", dir),
        server.connector(),
        StaticCredentials::new(password),
    )
}

/// Opens connections to a [`FakeServer`].
#[derive(Clone, Debug)]
pub struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Client<Connection>> {
        let alive = Arc::new(AtomicBool::new(true));
        {
            let mut state = lock(&self.server.state);
            if !state.reachable {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "fake server unreachable",
                )));
            }
            state.links.push(Arc::clone(&alive));
        }
        let stream = FakeStream::new(Arc::clone(&self.server.state), alive);
        let mut client = Client::new(Box::new(stream) as Connection);
        client.read_greeting()?;
        Ok(client)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Atom(String),
    Str(Vec<u8>),
    /// A parenthesized list, without the outer parentheses.
    List(String),
}

fn astr(token: &Token) -> Option<String> {
    match token {
        Token::Atom(a) => Some(a.clone()),
        Token::Str(s) => Some(String::from_utf8_lossy(s).into_owned()),
        Token::List(_) => None,
    }
}

fn canonical(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        name.to_string()
    }
}

fn mailbox_arg(token: Option<&Token>) -> Option<String> {
    token.and_then(astr).map(|n| canonical(&n))
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn flag_list(flags: MessageFlags) -> String {
    let names: Vec<String> = flags
        .iter()
        .filter_map(MessageFlag::to_wire)
        .map(|f| f.to_string())
        .collect();
    format!("({})", names.join(" "))
}

fn parse_flags(list: &str) -> MessageFlags {
    list.split_whitespace()
        .filter_map(|f| MessageFlag::from_wire(&Flag::from(f)))
        .filter(|f| TRACKED_FLAGS.contains(*f))
        .collect()
}

fn parse_set(set: &str, max: u32) -> Vec<RangeInclusive<u32>> {
    let num = |x: &str| if x == "*" { Some(max) } else { x.parse().ok() };
    set.split(',')
        .filter_map(|part| {
            let (a, b) = match part.split_once(':') {
                Some((a, b)) => (num(a)?, num(b)?),
                None => {
                    let n = num(part)?;
                    (n, n)
                }
            };
            Some(a.min(b)..=a.max(b))
        })
        .collect()
}

/// Split fetch items at top-level spaces; `BODY.PEEK[HEADER.FIELDS (A B)]` stays whole.
fn split_items(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in list.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            _ => {}
        }
        if c == ' ' && depth == 0 {
            if !current.is_empty() {
                items.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}

fn section_of<'a>(data: &'a [u8], section: &str) -> &'a [u8] {
    let split = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or(data.len(), |p| p + 4);
    match section.to_ascii_uppercase().as_str() {
        "" => data,
        "HEADER" => &data[..split],
        // TEXT, and part 1 of a single-part message
        _ => &data[split..],
    }
}

fn tokenize(mut i: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    loop {
        while i.first() == Some(&b' ') {
            i = &i[1..];
        }
        let Some(&c) = i.first() else {
            break;
        };
        match c {
            b'"' => {
                let mut out = Vec::new();
                let mut j = 1;
                while j < i.len() {
                    match i[j] {
                        b'\\' if j + 1 < i.len() => {
                            out.push(i[j + 1]);
                            j += 2;
                        }
                        b'"' => {
                            j += 1;
                            break;
                        }
                        b => {
                            out.push(b);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Str(out));
                i = &i[j..];
            }
            b'{' => {
                let close = i.iter().position(|&b| b == b'}').unwrap_or(i.len() - 1);
                let n: usize = String::from_utf8_lossy(&i[1..close])
                    .trim_end_matches('+')
                    .parse()
                    .unwrap_or(0);
                let start = (close + 3).min(i.len());
                let end = (start + n).min(i.len());
                tokens.push(Token::Str(i[start..end].to_vec()));
                i = &i[end..];
            }
            b'(' => {
                let mut depth = 0;
                let mut in_quote = false;
                let mut end = i.len();
                for (j, &b) in i.iter().enumerate() {
                    match b {
                        b'"' => in_quote = !in_quote,
                        b'(' if !in_quote => depth += 1,
                        b')' if !in_quote => {
                            depth -= 1;
                            if depth == 0 {
                                end = j;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                tokens.push(Token::List(
                    String::from_utf8_lossy(&i[1..end]).into_owned(),
                ));
                i = &i[(end + 1).min(i.len())..];
            }
            _ => {
                let mut depth = 0;
                let mut end = i.len();
                for (j, &b) in i.iter().enumerate() {
                    match b {
                        b'[' => depth += 1,
                        b']' => depth -= 1,
                        b' ' if depth == 0 => {
                            end = j;
                            break;
                        }
                        _ => {}
                    }
                }
                tokens.push(Token::Atom(
                    String::from_utf8_lossy(&i[..end]).into_owned(),
                ));
                i = &i[end..];
            }
        }
    }
    tokens
}

/// If `piece` ends in `{n}`, the literal length.
fn literal_announcement(piece: &[u8]) -> Option<usize> {
    let body = piece.strip_suffix(b"}")?;
    let open = body.iter().rposition(|&b| b == b'{')?;
    std::str::from_utf8(&body[open + 1..])
        .ok()?
        .trim_end_matches('+')
        .parse()
        .ok()
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}

struct Reply {
    untagged: Vec<Vec<u8>>,
    status: &'static str,
    code: Option<String>,
    text: String,
}

impl Reply {
    fn new(status: &'static str, text: &str) -> Self {
        Reply {
            untagged: Vec::new(),
            status,
            code: None,
            text: text.to_string(),
        }
    }

    fn ok(text: &str) -> Self {
        Reply::new("OK", text)
    }

    fn no(text: &str) -> Self {
        Reply::new("NO", text)
    }

    fn bad(text: &str) -> Self {
        Reply::new("BAD", text)
    }

    fn line(mut self, line: impl Into<String>) -> Self {
        let mut bytes = line.into().into_bytes();
        bytes.extend_from_slice(b"\r\n");
        self.untagged.push(bytes);
        self
    }

    fn raw(mut self, bytes: Vec<u8>) -> Self {
        self.untagged.push(bytes);
        self
    }

    fn lines(mut self, lines: Vec<Vec<u8>>) -> Self {
        self.untagged.extend(lines);
        self
    }

    fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[derive(Debug, Default)]
struct ConnectionView {
    authenticated: bool,
    selected: Option<String>,
    read_only: bool,
    /// UIDs in sequence order, as this connection was last told.
    view: Vec<Uid>,
    /// Flags as this connection was last told.
    told: HashMap<Uid, MessageFlags>,
    /// Tag of an `AUTHENTICATE` waiting for its response line.
    pending_auth: Option<String>,
}

struct FakeStream {
    server: Arc<Mutex<ServerState>>,
    alive: Arc<AtomicBool>,
    conn: ConnectionView,
    input: Vec<u8>,
    /// Start of the part of `input` not yet looked at.
    scan: usize,
    /// Command text so far, without literal data.
    text: Vec<u8>,
    continued: bool,
    output: Vec<u8>,
    read_pos: usize,
    closing: bool,
}

impl FakeStream {
    fn new(server: Arc<Mutex<ServerState>>, alive: Arc<AtomicBool>) -> Self {
        FakeStream {
            server,
            alive,
            conn: ConnectionView::default(),
            input: Vec::new(),
            scan: 0,
            text: Vec::new(),
            continued: false,
            output: b"* OK fake IMAP server ready\r\n".to_vec(),
            read_pos: 0,
            closing: false,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn process(&mut self) {
        while self.is_alive() && !self.closing {
            if let Some(tag) = self.conn.pending_auth.clone() {
                let Some(end) = find_crlf(&self.input, 0) else {
                    return;
                };
                let line: Vec<u8> = self.input.drain(..end + 2).take(end).collect();
                self.conn.pending_auth = None;
                self.finish_authenticate(&tag, &line);
                continue;
            }
            let Some(end) = find_crlf(&self.input, self.scan) else {
                return;
            };
            let piece = self.input[self.scan..end].to_vec();
            match literal_announcement(&piece) {
                Some(n) => {
                    let start = end + 2;
                    if !self.continued {
                        self.text.extend_from_slice(&piece);
                        self.output.extend_from_slice(b"+ Ready for literal data\r\n");
                        self.continued = true;
                    }
                    if self.input.len() < start + n {
                        return;
                    }
                    self.scan = start + n;
                    self.continued = false;
                }
                None => {
                    self.text.extend_from_slice(&piece);
                    let mut raw: Vec<u8> = self.input.drain(..end + 2).collect();
                    raw.truncate(end);
                    self.scan = 0;
                    let text = String::from_utf8_lossy(&std::mem::take(&mut self.text)).into_owned();
                    self.handle(&raw, &text);
                }
            }
        }
    }

    fn handle(&mut self, raw: &[u8], text: &str) {
        let Some((tag, rest)) = text.split_once(' ') else {
            self.output.extend_from_slice(b"* BAD missing tag\r\n");
            return;
        };
        let tokens = tokenize(raw.get(tag.len() + 1..).unwrap_or_default());
        let mut verb = tokens.first().and_then(astr).unwrap_or_default().to_ascii_uppercase();
        let mut args = tokens.get(1..).unwrap_or_default();
        if verb == "UID" {
            if let Some(sub) = args.first().and_then(astr) {
                verb = format!("UID {}", sub.to_ascii_uppercase());
                args = &args[1..];
            }
        }

        let server = Arc::clone(&self.server);
        let mut srv = lock(&server);
        srv.log.push(rest.to_string());
        match srv.take_fault(&verb) {
            Some(Fault::Disconnect) => {
                self.alive.store(false, Ordering::SeqCst);
                return;
            }
            Some(Fault::No) => {
                self.write_reply(tag, Reply::no("injected failure"));
                return;
            }
            None => {}
        }
        if let Some(reply) = self.execute(&mut srv, tag, &verb, args) {
            self.write_reply(tag, reply);
        }
    }

    fn write_reply(&mut self, tag: &str, reply: Reply) {
        for line in reply.untagged {
            self.output.extend_from_slice(&line);
        }
        let tagged = match reply.code {
            Some(code) => format!("{} {} [{}] {}\r\n", tag, reply.status, code, reply.text),
            None => format!("{} {} {}\r\n", tag, reply.status, reply.text),
        };
        self.output.extend_from_slice(tagged.as_bytes());
    }

    fn execute(
        &mut self,
        srv: &mut ServerState,
        tag: &str,
        verb: &str,
        args: &[Token],
    ) -> Option<Reply> {
        let reply = match verb {
            "CAPABILITY" => Reply::ok("CAPABILITY completed")
                .line(format!("* CAPABILITY {}", srv.capabilities.join(" "))),
            "NOOP" | "CHECK" => Reply::ok("NOOP completed").lines(self.sync_view(srv)),
            "LOGOUT" => {
                self.closing = true;
                Reply::ok("LOGOUT completed").line("* BYE logging out")
            }
            "LOGIN" => self.login(srv, args),
            "AUTHENTICATE" => {
                let plain = args
                    .first()
                    .and_then(astr)
                    .is_some_and(|m| m.eq_ignore_ascii_case("PLAIN"));
                if plain && srv.has("AUTH=PLAIN") {
                    self.output.extend_from_slice(b"+ \r\n");
                    self.conn.pending_auth = Some(tag.to_string());
                    return None;
                }
                Reply::no("unsupported mechanism")
            }
            _ if !self.conn.authenticated => Reply::bad("log in first"),
            "NAMESPACE" if srv.has("NAMESPACE") => Reply::ok("NAMESPACE completed").line(
                format!("* NAMESPACE ((\"\" {})) NIL NIL", quote(&srv.separator.to_string())),
            ),
            "LIST" => self.list(srv, args, false),
            "LSUB" => self.list(srv, args, true),
            "SELECT" => self.select(srv, args, false),
            "EXAMINE" => self.select(srv, args, true),
            "STATUS" => self.status(srv, args),
            "CREATE" | "DELETE" | "RENAME" | "SUBSCRIBE" | "UNSUBSCRIBE" => {
                self.manage(srv, verb, args)
            }
            "APPEND" => self.append(srv, args),
            _ if self.conn.selected.is_none() => Reply::bad("no mailbox selected"),
            "FETCH" | "UID FETCH" => self.fetch(srv, args, verb.starts_with("UID")),
            "STORE" | "UID STORE" => self.store(srv, args, verb.starts_with("UID")),
            "SEARCH" | "UID SEARCH" => self.search(srv, args, verb.starts_with("UID")),
            "EXPUNGE" => self.expunge(srv, None),
            "UID EXPUNGE" if srv.has("UIDPLUS") => match args.first().and_then(astr) {
                Some(set) => self.expunge(srv, Some(set)),
                None => Reply::bad("missing UID set"),
            },
            "COPY" | "UID COPY" => self.copy(srv, args, verb.starts_with("UID")),
            "CLOSE" => {
                if !self.conn.read_only {
                    if let Some(mbox) = self
                        .conn
                        .selected
                        .as_ref()
                        .and_then(|n| srv.mailboxes.get_mut(n))
                    {
                        mbox.messages
                            .retain(|m| !m.flags.contains(MessageFlag::Deleted));
                    }
                }
                self.conn.selected = None;
                Reply::ok("CLOSE completed")
            }
            _ => Reply::bad("unknown command"),
        };
        Some(reply)
    }

    fn login(&mut self, srv: &ServerState, args: &[Token]) -> Reply {
        if srv.has("LOGINDISABLED") {
            return Reply::no("LOGIN is disabled");
        }
        match (args.first().and_then(astr), args.get(1).and_then(astr)) {
            (Some(_), Some(password)) if password == srv.password => {
                self.conn.authenticated = true;
                Reply::ok("LOGIN completed")
            }
            (Some(_), Some(_)) => Reply::no("invalid credentials").code("AUTHENTICATIONFAILED"),
            _ => Reply::bad("LOGIN needs a user and a password"),
        }
    }

    fn finish_authenticate(&mut self, tag: &str, line: &[u8]) {
        let decoded = BASE64.decode(line.trim_ascii()).unwrap_or_default();
        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        let password = lock(&self.server).password.clone();
        let reply = if parts.len() == 3 && parts[2] == password.as_bytes() {
            self.conn.authenticated = true;
            Reply::ok("AUTHENTICATE completed")
        } else {
            Reply::no("invalid credentials").code("AUTHENTICATIONFAILED")
        };
        self.write_reply(tag, reply);
    }

    fn list(&mut self, srv: &ServerState, args: &[Token], lsub: bool) -> Reply {
        let reference = args.first().and_then(astr).unwrap_or_default();
        let Some(pattern) = args.get(1).and_then(astr) else {
            return Reply::bad("missing pattern");
        };
        let sep = srv.separator;
        let keyword = if lsub { "LSUB" } else { "LIST" };
        let mut reply = Reply::ok(&format!("{} completed", keyword));
        if pattern.is_empty() {
            return reply.line(format!(
                "* {} (\\Noselect) {} \"\"",
                keyword,
                quote(&sep.to_string())
            ));
        }
        let pattern = format!("{}{}", reference, pattern);
        let names: Vec<&String> = if lsub {
            srv.subscriptions.iter().collect()
        } else {
            srv.mailboxes.keys().collect()
        };
        for name in names {
            let matches = wildcard_match(&pattern, name, sep)
                || (name == "INBOX" && pattern.eq_ignore_ascii_case("INBOX"));
            if !matches {
                continue;
            }
            let below = format!("{}{}", name, sep);
            let attr = if srv.mailboxes.keys().any(|other| other.starts_with(&below)) {
                "\\HasChildren"
            } else {
                "\\HasNoChildren"
            };
            reply = reply.line(format!(
                "* {} ({}) {} {}",
                keyword,
                attr,
                quote(&sep.to_string()),
                quote(name)
            ));
        }
        reply
    }

    fn select(&mut self, srv: &ServerState, args: &[Token], examine: bool) -> Reply {
        self.conn.selected = None;
        self.conn.view.clear();
        self.conn.told.clear();
        let Some(name) = mailbox_arg(args.first()) else {
            return Reply::bad("missing mailbox");
        };
        let Some(mbox) = srv.mailboxes.get(&name) else {
            return Reply::no("no such mailbox");
        };
        self.conn.selected = Some(name);
        self.conn.read_only = examine;
        self.conn.view = mbox.messages.iter().map(|m| m.uid).collect();
        self.conn.told = mbox.messages.iter().map(|m| (m.uid, m.flags)).collect();
        let permanent = if mbox.permanent.is_empty() {
            "()".to_string()
        } else {
            let list = flag_list(mbox.permanent);
            format!("{} \\*)", &list[..list.len() - 1])
        };
        let (code, text) = if examine {
            ("READ-ONLY", "EXAMINE completed")
        } else {
            ("READ-WRITE", "SELECT completed")
        };
        Reply::ok(text)
            .code(code)
            .line("* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)")
            .line(format!("* OK [PERMANENTFLAGS {}] Limited", permanent))
            .line(format!("* {} EXISTS", mbox.messages.len()))
            .line("* 0 RECENT")
            .line(format!("* OK [UIDVALIDITY {}] UIDs valid", mbox.uid_validity))
            .line(format!("* OK [UIDNEXT {}] Predicted next UID", mbox.uid_next))
    }

    fn status(&mut self, srv: &ServerState, args: &[Token]) -> Reply {
        let Some(name) = mailbox_arg(args.first()) else {
            return Reply::bad("missing mailbox");
        };
        let Some(mbox) = srv.mailboxes.get(&name) else {
            return Reply::no("no such mailbox");
        };
        let unseen = mbox
            .messages
            .iter()
            .filter(|m| !m.flags.contains(MessageFlag::Seen))
            .count();
        let line = format!(
            "* STATUS {} (MESSAGES {} RECENT 0 UNSEEN {} UIDNEXT {} UIDVALIDITY {})",
            quote(&name),
            mbox.messages.len(),
            unseen,
            mbox.uid_next,
            mbox.uid_validity
        );
        // like real servers, report news about the selected mailbox along the way
        Reply::ok("STATUS completed")
            .lines(self.sync_view(srv))
            .line(line)
    }

    fn manage(&mut self, srv: &mut ServerState, verb: &str, args: &[Token]) -> Reply {
        let Some(name) = mailbox_arg(args.first()) else {
            return Reply::bad("missing mailbox");
        };
        let sep = srv.separator;
        match verb {
            "CREATE" => {
                let name = name.trim_end_matches(sep).to_string();
                if srv.mailboxes.contains_key(&name) {
                    return Reply::no("mailbox exists");
                }
                let validity = srv.next_validity;
                srv.next_validity += 1;
                srv.mailboxes.insert(name, FakeMailbox::new(validity));
                Reply::ok("CREATE completed")
            }
            "DELETE" => {
                if name == "INBOX" || srv.mailboxes.remove(&name).is_none() {
                    return Reply::no("cannot delete that mailbox");
                }
                if self.conn.selected.as_deref() == Some(name.as_str()) {
                    self.conn.selected = None;
                }
                Reply::ok("DELETE completed")
            }
            "RENAME" => {
                let Some(new) = mailbox_arg(args.get(1)) else {
                    return Reply::bad("missing new name");
                };
                if !srv.mailboxes.contains_key(&name) {
                    return Reply::no("no such mailbox");
                }
                if srv.mailboxes.contains_key(&new) {
                    return Reply::no("target exists");
                }
                let below = format!("{}{}", name, sep);
                let moving: Vec<String> = srv
                    .mailboxes
                    .keys()
                    .filter(|k| **k == name || k.starts_with(&below))
                    .cloned()
                    .collect();
                for old in moving {
                    if let Some(mbox) = srv.mailboxes.remove(&old) {
                        srv.mailboxes
                            .insert(format!("{}{}", new, &old[name.len()..]), mbox);
                    }
                }
                Reply::ok("RENAME completed")
            }
            "SUBSCRIBE" => {
                srv.subscriptions.insert(name);
                Reply::ok("SUBSCRIBE completed")
            }
            _ => {
                srv.subscriptions.remove(&name);
                Reply::ok("UNSUBSCRIBE completed")
            }
        }
    }

    fn append(&mut self, srv: &mut ServerState, args: &[Token]) -> Reply {
        let Some(name) = mailbox_arg(args.first()) else {
            return Reply::bad("missing mailbox");
        };
        let (Some(Token::Str(data)), true) = (args.last(), args.len() >= 2) else {
            return Reply::bad("missing message literal");
        };
        let flags = args[1..args.len() - 1]
            .iter()
            .find_map(|t| match t {
                Token::List(l) => Some(parse_flags(l)),
                _ => None,
            })
            .unwrap_or_default();
        let uidplus = srv.has("UIDPLUS");
        let Some(mbox) = srv.mailboxes.get_mut(&name) else {
            return Reply::no("no such mailbox").code("TRYCREATE");
        };
        let uid = mbox.add(data.clone(), flags);
        let validity = mbox.uid_validity;
        let mut reply = Reply::ok("APPEND completed");
        if uidplus {
            reply = reply.code(format!("APPENDUID {} {}", validity, uid));
        }
        if self.conn.selected.as_deref() == Some(name.as_str()) {
            reply = reply.lines(self.sync_view(srv));
        }
        reply
    }

    /// `(seq, uid)` of the messages in this connection's view that `set` names.
    fn targets(&self, set: &str, uid: bool) -> Vec<(Seq, Uid)> {
        let max = if uid {
            self.conn.view.last().copied().unwrap_or(0)
        } else {
            self.conn.view.len() as u32
        };
        let ranges = parse_set(set, max);
        self.conn
            .view
            .iter()
            .enumerate()
            .filter_map(|(i, &u)| {
                let seq = i as Seq + 1;
                let key = if uid { u } else { seq };
                ranges.iter().any(|r| r.contains(&key)).then_some((seq, u))
            })
            .collect()
    }

    fn selected_mut<'a>(&self, srv: &'a mut ServerState) -> Option<&'a mut FakeMailbox> {
        self.conn
            .selected
            .as_ref()
            .and_then(|name| srv.mailboxes.get_mut(name))
    }

    fn fetch(&mut self, srv: &mut ServerState, args: &[Token], uid: bool) -> Reply {
        let (Some(set), Some(items)) = (args.first().and_then(astr), args.get(1)) else {
            return Reply::bad("FETCH needs a set and items");
        };
        let items = match items {
            Token::List(l) => split_items(l),
            Token::Atom(a) => vec![a.clone()],
            Token::Str(_) => return Reply::bad("bad fetch items"),
        };
        let targets = self.targets(&set, uid);
        let Some(mbox) = self.selected_mut(srv) else {
            return Reply::no("mailbox is gone");
        };
        let mut reply = Reply::ok("FETCH completed");
        for (seq, u) in targets {
            let Some(m) = mbox.find_mut(u) else {
                continue;
            };
            let mut parts: Vec<Vec<u8>> = Vec::new();
            let wants_uid = items.iter().any(|i| i.eq_ignore_ascii_case("UID"));
            if uid && !wants_uid {
                parts.push(format!("UID {}", u).into_bytes());
            }
            for item in &items {
                let upper = item.to_ascii_uppercase();
                match upper.as_str() {
                    "UID" => parts.push(format!("UID {}", u).into_bytes()),
                    "FLAGS" => parts.push(format!("FLAGS {}", flag_list(m.flags)).into_bytes()),
                    "RFC822.SIZE" => {
                        parts.push(format!("RFC822.SIZE {}", m.data.len()).into_bytes())
                    }
                    _ if upper.starts_with("BODY[") || upper.starts_with("BODY.PEEK[") => {
                        let open = item.find('[').map_or(0, |p| p + 1);
                        let close = item.rfind(']').unwrap_or(item.len()).max(open);
                        let section = &item[open..close];
                        if !upper.starts_with("BODY.PEEK") && !m.flags.contains(MessageFlag::Seen) {
                            m.flags |= MessageFlag::Seen;
                            self.conn.told.insert(u, m.flags);
                            parts.push(format!("FLAGS {}", flag_list(m.flags)).into_bytes());
                        }
                        let data = section_of(&m.data, section);
                        let mut part = format!("BODY[{}] {{{}}}\r\n", section, data.len()).into_bytes();
                        part.extend_from_slice(data);
                        parts.push(part);
                    }
                    // anything else is not something the store asks for
                    _ => {}
                }
            }
            let mut line = format!("* {} FETCH (", seq).into_bytes();
            line.extend_from_slice(&parts.join(&b' '));
            line.extend_from_slice(b")\r\n");
            reply = reply.raw(line);
        }
        // body fetches take long enough that news is reported behind them
        if items.iter().any(|i| i.to_ascii_uppercase().starts_with("BODY")) {
            reply = reply.lines(self.sync_view(srv));
        }
        reply
    }

    fn store(&mut self, srv: &mut ServerState, args: &[Token], uid: bool) -> Reply {
        if self.conn.read_only {
            return Reply::no("mailbox is read-only");
        }
        let (Some(set), Some(op)) = (args.first().and_then(astr), args.get(1).and_then(astr))
        else {
            return Reply::bad("STORE needs a set and an operation");
        };
        let flags = match args.get(2) {
            Some(Token::List(l)) => parse_flags(l),
            Some(Token::Atom(a)) => parse_flags(a),
            _ => return Reply::bad("missing flags"),
        };
        let op = op.to_ascii_uppercase();
        let silent = op.ends_with(".SILENT");
        let base = op.trim_end_matches(".SILENT").to_string();
        if !matches!(base.as_str(), "FLAGS" | "+FLAGS" | "-FLAGS") {
            return Reply::bad("unknown STORE operation");
        }
        let targets = self.targets(&set, uid);
        let Some(mbox) = self.selected_mut(srv) else {
            return Reply::no("mailbox is gone");
        };
        let flags = flags & mbox.permanent;
        let mut reply = Reply::ok("STORE completed");
        for (seq, u) in targets {
            let Some(m) = mbox.find_mut(u) else {
                continue;
            };
            m.flags = match base.as_str() {
                "FLAGS" => flags,
                "+FLAGS" => m.flags | flags,
                _ => m.flags - flags,
            };
            self.conn.told.insert(u, m.flags);
            if !silent {
                reply = if uid {
                    reply.line(format!("* {} FETCH (UID {} FLAGS {})", seq, u, flag_list(m.flags)))
                } else {
                    reply.line(format!("* {} FETCH (FLAGS {})", seq, flag_list(m.flags)))
                };
            }
        }
        reply
    }

    fn search(&mut self, srv: &mut ServerState, args: &[Token], uid: bool) -> Reply {
        let criteria: Vec<String> = args
            .iter()
            .filter_map(astr)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let known = [
            "ALL",
            "DELETED",
            "UNDELETED",
            "SEEN",
            "UNSEEN",
            "FLAGGED",
            "UNFLAGGED",
            "ANSWERED",
            "DRAFT",
        ];
        if criteria.iter().any(|c| !known.contains(&c.as_str())) {
            return Reply::bad("unsupported search criteria");
        }
        let Some(mbox) = self.selected_mut(srv) else {
            return Reply::no("mailbox is gone");
        };
        let mut found = Vec::new();
        for (i, &u) in self.conn.view.iter().enumerate() {
            let Some(m) = mbox.find(u) else {
                continue;
            };
            let has = |f: MessageFlag| m.flags.contains(f);
            let matches = criteria.iter().all(|c| match c.as_str() {
                "DELETED" => has(MessageFlag::Deleted),
                "UNDELETED" => !has(MessageFlag::Deleted),
                "SEEN" => has(MessageFlag::Seen),
                "UNSEEN" => !has(MessageFlag::Seen),
                "FLAGGED" => has(MessageFlag::Flagged),
                "UNFLAGGED" => !has(MessageFlag::Flagged),
                "ANSWERED" => has(MessageFlag::Answered),
                "DRAFT" => has(MessageFlag::Draft),
                _ => true,
            });
            if matches {
                found.push(if uid { u } else { i as u32 + 1 });
            }
        }
        let mut line = "* SEARCH".to_string();
        for n in found {
            line.push_str(&format!(" {}", n));
        }
        Reply::ok("SEARCH completed").line(line)
    }

    fn expunge(&mut self, srv: &mut ServerState, set: Option<String>) -> Reply {
        if self.conn.read_only {
            return Reply::no("mailbox is read-only");
        }
        let max = self.conn.view.last().copied().unwrap_or(0);
        let ranges = set.map(|s| parse_set(&s, max));
        let Some(mbox) = self.selected_mut(srv) else {
            return Reply::no("mailbox is gone");
        };
        mbox.messages.retain(|m| {
            let named = ranges
                .as_ref()
                .map_or(true, |r| r.iter().any(|r| r.contains(&m.uid)));
            !(named && m.flags.contains(MessageFlag::Deleted))
        });
        Reply::ok("EXPUNGE completed").lines(self.sync_view(srv))
    }

    fn copy(&mut self, srv: &mut ServerState, args: &[Token], uid: bool) -> Reply {
        let (Some(set), Some(dest)) = (args.first().and_then(astr), mailbox_arg(args.get(1)))
        else {
            return Reply::bad("COPY needs a set and a mailbox");
        };
        let targets = self.targets(&set, uid);
        let Some(src) = self.selected_mut(srv) else {
            return Reply::no("mailbox is gone");
        };
        let copies: Vec<FakeMessage> = targets
            .iter()
            .filter_map(|&(_, u)| src.find(u).cloned())
            .collect();
        let uidplus = srv.has("UIDPLUS");
        let Some(dst) = srv.mailboxes.get_mut(&dest) else {
            return Reply::no("no such mailbox").code("TRYCREATE");
        };
        let mut from = Vec::with_capacity(copies.len());
        let mut to = Vec::with_capacity(copies.len());
        for m in copies {
            from.push(m.uid);
            to.push(dst.add(m.data, m.flags));
        }
        let validity = dst.uid_validity;
        let mut reply = Reply::ok("COPY completed");
        if uidplus && !from.is_empty() {
            reply = reply.code(format!(
                "COPYUID {} {} {}",
                validity,
                uid_set_string(&from),
                uid_set_string(&to)
            ));
        }
        if self.conn.selected.as_deref() == Some(dest.as_str()) {
            reply = reply.lines(self.sync_view(srv));
        }
        reply
    }

    /// Tell this connection what changed in its selected mailbox since it was last told.
    fn sync_view(&mut self, srv: &ServerState) -> Vec<Vec<u8>> {
        let Some(mbox) = self.conn.selected.as_ref().and_then(|n| srv.mailboxes.get(n)) else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        let mut kept: Vec<Uid> = Vec::with_capacity(self.conn.view.len());
        for &uid in &self.conn.view {
            if mbox.find(uid).is_some() {
                kept.push(uid);
            } else {
                lines.push(format!("* {} EXPUNGE\r\n", kept.len() + 1).into_bytes());
                self.conn.told.remove(&uid);
            }
        }
        let known = kept.len();
        let last = kept.last().copied().unwrap_or(0);
        for m in mbox.messages.iter().filter(|m| m.uid > last) {
            kept.push(m.uid);
            self.conn.told.insert(m.uid, m.flags);
        }
        if kept.len() > known {
            lines.push(format!("* {} EXISTS\r\n", kept.len()).into_bytes());
        }
        for (i, &uid) in kept[..known].iter().enumerate() {
            let Some(m) = mbox.find(uid) else {
                continue;
            };
            if self.conn.told.get(&uid) != Some(&m.flags) {
                self.conn.told.insert(uid, m.flags);
                lines.push(format!("* {} FETCH (FLAGS {})\r\n", i + 1, flag_list(m.flags)).into_bytes());
            }
        }
        self.conn.view = kept;
        lines
    }
}

impl Read for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_alive() {
            return Ok(0);
        }
        if self.read_pos < self.output.len() {
            let n = buf.len().min(self.output.len() - self.read_pos);
            buf[..n].copy_from_slice(&self.output[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            if self.read_pos == self.output.len() {
                self.output.clear();
                self.read_pos = 0;
            }
            return Ok(n);
        }
        if self.closing {
            return Ok(0);
        }
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client waits for a response that will never come",
        ))
    }
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_alive() || self.closing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        if self.read_pos < self.output.len() {
            lock(&self.server).interleavings += 1;
        }
        self.input.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

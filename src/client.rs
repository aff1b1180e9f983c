//! The wire protocol layer: tagged commands in, classified response lines out.

use std::io::{BufRead, ErrorKind as IoErrorKind, Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bufstream::BufStream;
use tracing::{debug, trace, warn};

use crate::authenticator::Authenticator;
use crate::cancel::Cancellable;
use crate::command::{Command, Piece};
use crate::error::{Error, ParseError, Result};
use crate::parse;
use crate::types::*;

static TAG_PREFIX: &str = "a";
const INITIAL_TAG: u32 = 0;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

/// Literals larger than this are treated as a malformed length.
const MAX_LITERAL: usize = 256 * 1024 * 1024;

/// The completion status of a tagged response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The command succeeded.
    Ok,
    /// The command failed.
    No,
    /// The command was malformed or not understood.
    Bad,
}

/// The tagged line that completes a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tagged {
    /// `OK`, `NO` or `BAD`.
    pub status: Status,
    /// The bracketed response code, if any.
    pub code: Option<ResponseCode>,
    /// Human-readable text after the code.
    pub text: String,
}

/// One response line, with any literals it carries already inlined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseLine {
    /// `* ...`; the raw bytes including the trailing CRLF.
    Untagged(Vec<u8>),
    /// `+ ...`; the text after the `+`, without CRLF.
    Continuation(Vec<u8>),
    /// The completion of the command in flight.
    Tagged(Tagged),
}

/// The result of a successful command: everything the server said before the tagged `OK`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// Raw untagged lines, in arrival order.
    pub untagged: Vec<Vec<u8>>,
    /// The tagged response code.
    pub code: Option<ResponseCode>,
    /// The tagged response text.
    pub text: String,
}

impl Response {
    /// All response codes, from untagged `OK` lines and the tagged line.
    pub fn codes(&self) -> Vec<ResponseCode> {
        let mut codes = parse::response_codes(&self.untagged);
        codes.extend(self.code.clone());
        codes
    }
}

impl Tagged {
    pub(crate) fn into_result(self, mut response: Response) -> Result<Response> {
        match self.status {
            Status::Ok => {
                response.code = self.code;
                response.text = self.text;
                Ok(response)
            }
            Status::No => Err(Error::No(self.text)),
            Status::Bad => Err(Error::Bad(self.text)),
        }
    }
}

/// Stream to interface with the IMAP server. This interface is only for the command stream.
///
/// A `Client` has at most one command in flight: [`start_command`](Client::start_command)
/// must be followed by reading responses until the tagged completion arrives before the next
/// command is started. The store enforces this by keeping the client behind its session lock.
#[derive(Debug)]
pub struct Client<T: Read + Write> {
    pub(crate) stream: BufStream<T>,
    tag: u32,
    cancel: Option<Cancellable>,
    pending: Vec<Vec<u8>>,
}

impl<T: Read + Write> Client<T> {
    /// Creates a new client with the underlying stream.
    pub fn new(stream: T) -> Client<T> {
        Client {
            stream: BufStream::new(stream),
            tag: INITIAL_TAG,
            cancel: None,
            pending: Vec::new(),
        }
    }

    /// Poll `cancel` before every command is written.
    pub fn set_cancellable(&mut self, cancel: Cancellable) {
        self.cancel = Some(cancel);
    }

    /// Give back the underlying stream, e.g. to wrap it in TLS after `STARTTLS`.
    pub fn into_inner(self) -> Result<T> {
        self.stream.into_inner().map_err(|e| Error::Io(e.into()))
    }

    /// Read the server greeting. A `BYE` greeting means the server refuses the connection.
    pub fn read_greeting(&mut self) -> Result<Vec<u8>> {
        let line = self.read_line()?;
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"* BYE") {
            warn!(greeting = %String::from_utf8_lossy(&line).trim_end(), "server refused connection");
            return Err(Error::ConnectionLost);
        }
        Ok(line)
    }

    fn current_tag(&self) -> String {
        format!("{}{}", TAG_PREFIX, self.tag)
    }

    fn create_command(&mut self) -> String {
        self.tag += 1;
        self.current_tag()
    }

    /// Tag and write `command`. Synchronizing literals wait for the server's `+` before their
    /// bytes are sent; untagged data that arrives meanwhile is kept for
    /// [`read_next_response`](Client::read_next_response).
    pub fn start_command(&mut self, command: &Command) -> Result<()> {
        if let Some(ref cancel) = self.cancel {
            cancel.check()?;
        }
        let tag = self.create_command();
        trace!("C: {} {}", tag, command.redacted());
        self.write_all(tag.as_bytes())?;
        self.write_all(b" ")?;
        for piece in command.pieces() {
            match piece {
                Piece::Text(text) => self.write_all(text)?,
                Piece::Literal(data) => {
                    self.write_all(format!("{{{}}}", data.len()).as_bytes())?;
                    self.write_all(&[CR, LF])?;
                    self.flush()?;
                    self.await_continuation()?;
                    self.write_all(data)?;
                }
            }
        }
        self.write_all(&[CR, LF])?;
        self.flush()
    }

    fn await_continuation(&mut self) -> Result<Vec<u8>> {
        loop {
            let line = self.read_line()?;
            match self.classify(line)? {
                ResponseLine::Continuation(data) => return Ok(data),
                ResponseLine::Untagged(line) => self.pending.push(line),
                ResponseLine::Tagged(done) => {
                    // a tagged OK here means the server skipped the literal
                    done.into_result(Response::default())?;
                    return Err(Error::Parse(ParseError::Invalid(
                        b"command completed before its literal was sent".to_vec(),
                    )));
                }
            }
        }
    }

    /// Send data in answer to a `+` continuation request.
    pub fn send_continuation(&mut self, data: &[u8]) -> Result<()> {
        trace!("C: <{} bytes of continuation data>", data.len());
        self.write_all(data)?;
        self.write_all(&[CR, LF])?;
        self.flush()
    }

    /// Read the next response line for the command in flight.
    pub fn read_next_response(&mut self) -> Result<ResponseLine> {
        if !self.pending.is_empty() {
            return Ok(ResponseLine::Untagged(self.pending.remove(0)));
        }
        let line = self.read_line()?;
        self.classify(line)
    }

    /// Read responses until the tagged completion, collecting untagged data.
    pub fn finish_command(&mut self) -> Result<Response> {
        let mut response = Response::default();
        loop {
            match self.read_next_response()? {
                ResponseLine::Untagged(line) => response.untagged.push(line),
                ResponseLine::Continuation(data) => {
                    debug!(
                        "ignoring unexpected continuation: {}",
                        String::from_utf8_lossy(&data)
                    );
                }
                ResponseLine::Tagged(done) => return done.into_result(response),
            }
        }
    }

    /// Runs a command and waits for its completion. A tagged `NO` or `BAD` becomes
    /// [`Error::No`] or [`Error::Bad`] with the server's text.
    pub fn send_command(&mut self, command: &Command) -> Result<Response> {
        self.start_command(command)?;
        self.finish_command()
    }

    /// Authenticate will authenticate with the server, using the authenticator given.
    pub fn authenticate<A: Authenticator>(
        &mut self,
        mechanism: &str,
        authenticator: &A,
    ) -> Result<Response> {
        self.start_command(&Command::new("AUTHENTICATE").atom(mechanism))?;
        let mut response = Response::default();
        loop {
            match self.read_next_response()? {
                ResponseLine::Continuation(data) => {
                    let challenge = BASE64
                        .decode(data.trim_ascii())
                        .map_err(|_| Error::Parse(ParseError::Invalid(data.clone())))?;
                    let reply = authenticator.process(&challenge);
                    let encoded = BASE64.encode(reply.as_ref());
                    self.send_continuation(encoded.as_bytes())?;
                }
                ResponseLine::Untagged(line) => response.untagged.push(line),
                ResponseLine::Tagged(done) => return done.into_result(response),
            }
        }
    }

    /// Log in to the IMAP server.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.send_command(&Command::login(username, password)?)
            .map(|_| ())
    }

    /// Log out; the server closes the connection afterwards.
    pub fn logout(&mut self) -> Result<()> {
        self.send_command(&Command::new("LOGOUT")).map(|_| ())
    }

    /// The server's capabilities.
    pub fn capabilities(&mut self) -> Result<Capabilities> {
        let response = self.send_command(&Command::new("CAPABILITY"))?;
        Ok(parse::parse_capabilities(&response.untagged)?)
    }

    /// Selects a mailbox
    pub fn select(&mut self, mailbox_name: &str) -> Result<Mailbox> {
        let response = self.send_command(&Command::new("SELECT").mailbox(mailbox_name))?;
        Ok(parse::parse_mailbox(&response))
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            let start = data.len();
            let read = self.stream.read_until(LF, &mut data).map_err(lost)?;
            if read == 0 || data.last() != Some(&LF) {
                return Err(Error::ConnectionLost);
            }
            match literal_length(&data[start..])? {
                Some(n) => {
                    let at = data.len();
                    data.resize(at + n, 0);
                    self.stream.read_exact(&mut data[at..]).map_err(lost)?;
                }
                None => break,
            }
        }
        trace!("S: {}", String::from_utf8_lossy(&data).trim_end());
        Ok(data)
    }

    fn classify(&self, line: Vec<u8>) -> Result<ResponseLine> {
        if line.starts_with(b"* ") {
            return Ok(ResponseLine::Untagged(line));
        }
        if line.starts_with(b"+") {
            let mut data = line[1..].to_vec();
            while matches!(data.last(), Some(&CR) | Some(&LF)) {
                data.pop();
            }
            if data.first() == Some(&b' ') {
                data.remove(0);
            }
            return Ok(ResponseLine::Continuation(data));
        }
        let tag = self.current_tag();
        let prefix = format!("{} ", tag);
        if line.starts_with(prefix.as_bytes()) {
            return parse::parse_tagged(&line).map(ResponseLine::Tagged);
        }
        Err(Error::Parse(ParseError::Invalid(line)))
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(lost)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(lost)
    }
}

fn lost(e: std::io::Error) -> Error {
    match e.kind() {
        IoErrorKind::UnexpectedEof | IoErrorKind::BrokenPipe | IoErrorKind::ConnectionReset => {
            Error::ConnectionLost
        }
        _ => Error::Io(e),
    }
}

/// If `line` ends in a literal announcement `{n}` (or `{n+}`), the number of bytes that follow.
fn literal_length(line: &[u8]) -> Result<Option<usize>> {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == CR || line[end - 1] == LF) {
        end -= 1;
    }
    let line = &line[..end];
    if line.last() != Some(&b'}') {
        return Ok(None);
    }
    let open = match line.iter().rposition(|&b| b == b'{') {
        Some(i) => i,
        None => return Ok(None),
    };
    let mut digits = &line[open + 1..line.len() - 1];
    if digits.last() == Some(&b'+') {
        digits = &digits[..digits.len() - 1];
    }
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(digits);
    match text.parse::<usize>() {
        Ok(n) if n <= MAX_LITERAL => Ok(Some(n)),
        _ => Err(Error::Parse(ParseError::LiteralLength(text.into_owned()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::MockStream;

    fn client(response: &[u8]) -> Client<MockStream> {
        Client::new(MockStream::new(response.to_vec()))
    }

    fn written(client: &Client<MockStream>) -> String {
        String::from_utf8(client.stream.get_ref().written().to_vec()).unwrap()
    }

    #[test]
    fn read_response() {
        let mut client = client(b"a1 OK Logged in.\r\n");
        let response = client.send_command(&Command::new("NOOP")).unwrap();
        assert!(response.untagged.is_empty());
        assert_eq!(response.text, "Logged in.");
    }

    #[test]
    fn fetch_body_with_embedded_crlf() {
        let mut client = client(
            b"* 2 FETCH (BODY[TEXT] {8}\r\nfoo\r\nbar UID 7)\r\n\
              a1 OK FETCH completed\r\n",
        );
        let response = client
            .send_command(&Command::new("FETCH").atom(2).atom("BODY[TEXT]"))
            .unwrap();
        assert_eq!(response.untagged.len(), 1);
        assert_eq!(
            response.untagged[0],
            b"* 2 FETCH (BODY[TEXT] {8}\r\nfoo\r\nbar UID 7)\r\n".to_vec()
        );
    }

    #[test]
    fn read_greeting() {
        let mut client = client(b"* OK Dovecot ready.\r\n");
        client.read_greeting().unwrap();
    }

    #[test]
    fn bye_greeting_is_refused() {
        let mut client = client(b"* BYE Too many connections\r\n");
        assert!(matches!(client.read_greeting(), Err(Error::ConnectionLost)));
    }

    #[test]
    fn readline_delay_read() {
        let greeting = "* OK Dovecot ready.\r\n";
        let mock_stream = MockStream::new(greeting.as_bytes().to_vec()).chunked(1);
        let mut client = Client::new(mock_stream);
        let line = client.read_line().unwrap();
        assert_eq!(String::from_utf8(line).unwrap(), greeting);
    }

    #[test]
    fn readline_eof() {
        let mock_stream = MockStream::default().with_eof();
        let mut client = Client::new(mock_stream);
        if let Err(Error::ConnectionLost) = client.read_line() {
        } else {
            unreachable!("EOF read did not return connection lost");
        }
    }

    #[test]
    fn readline_err() {
        let mock_stream = MockStream::default().with_err();
        let mut client = Client::new(mock_stream);
        let err = client.read_line().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }

    #[test]
    fn truncated_literal_is_connection_loss() {
        let mut client = client(b"* 1 FETCH (BODY[] {10}\r\nabc");
        assert!(matches!(client.read_line(), Err(Error::ConnectionLost)));
    }

    #[test]
    fn huge_literal_length_is_malformed() {
        let mut client = client(b"* 1 FETCH (BODY[] {99999999999999999999999}\r\n");
        assert!(matches!(
            client.read_line(),
            Err(Error::Parse(ParseError::LiteralLength(_)))
        ));
    }

    #[test]
    fn create_command() {
        let mut imap_stream = Client::new(MockStream::default());
        assert_eq!(imap_stream.create_command(), "a1");
        assert_eq!(imap_stream.create_command(), "a2");
    }

    #[test]
    fn login() {
        let mut client = client(b"a1 OK Logged in\r\n");
        client.login("username", "password").unwrap();
        assert_eq!(written(&client), "a1 LOGIN \"username\" \"password\"\r\n");
    }

    #[test]
    fn login_rejected() {
        let mut client = client(b"a1 NO [AUTHENTICATIONFAILED] Authentication failed.\r\n");
        match client.login("username", "wrong") {
            Err(Error::No(text)) => assert_eq!(text, "Authentication failed."),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_response_carries_text() {
        let mut client = client(b"a1 BAD Unknown command\r\n");
        match client.send_command(&Command::new("FROB")) {
            Err(Error::Bad(text)) => assert_eq!(text, "Unknown command"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn logout() {
        let mut client = client(b"* BYE Logging out\r\na1 OK Logout completed.\r\n");
        client.logout().unwrap();
        assert_eq!(written(&client), "a1 LOGOUT\r\n");
    }

    #[test]
    fn literal_waits_for_continuation() {
        let mut client = client(
            b"+ Ready for literal data\r\n\
              * 3 EXISTS\r\n\
              a1 OK [APPENDUID 38505 3955] APPEND completed\r\n",
        );
        let cmd = Command::new("APPEND").mailbox("Sent").literal(b"Subject: hi\r\n\r\nbody");
        let response = client.send_command(&cmd).unwrap();
        assert_eq!(
            written(&client),
            "a1 APPEND \"Sent\" {19}\r\nSubject: hi\r\n\r\nbody\r\n"
        );
        assert_eq!(response.untagged, vec![b"* 3 EXISTS\r\n".to_vec()]);
        assert_eq!(
            response.code,
            Some(ResponseCode::AppendUid {
                uid_validity: 38505,
                uids: vec![3955..=3955],
            })
        );
    }

    #[test]
    fn literal_refused() {
        let mut client = client(b"a1 NO [TRYCREATE] No such mailbox\r\n");
        let cmd = Command::new("APPEND").mailbox("Gone").literal(b"x");
        assert!(matches!(client.send_command(&cmd), Err(Error::No(_))));
    }

    #[test]
    fn select() {
        let mut client = client(
            b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
            * OK [PERMANENTFLAGS (\\* \\Answered \\Flagged \\Deleted \\Draft \\Seen)] \
              Limited\r\n\
            * 1 EXISTS\r\n\
            * 1 RECENT\r\n\
            * OK [UNSEEN 1] First unseen.\r\n\
            * OK [UIDVALIDITY 1257842737] UIDs valid\r\n\
            * OK [UIDNEXT 2] Predicted next UID\r\n\
            a1 OK [READ-WRITE] Select completed.\r\n",
        );
        let mailbox = client.select("INBOX").unwrap();
        assert_eq!(written(&client), "a1 SELECT \"INBOX\"\r\n");
        assert_eq!(mailbox.exists, 1);
        assert_eq!(mailbox.recent, 1);
        assert_eq!(mailbox.unseen, Some(1));
        assert_eq!(mailbox.uid_next, Some(2));
        assert_eq!(mailbox.uid_validity, Some(1257842737));
        assert_eq!(mailbox.flags.len(), 5);
        assert_eq!(mailbox.permanent_flags.as_ref().map(Vec::len), Some(6));
        assert!(!mailbox.read_only);
    }

    #[test]
    fn capability() {
        let mut client = client(
            b"* CAPABILITY IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n\
            a1 OK CAPABILITY completed\r\n",
        );
        let capabilities = client.capabilities().unwrap();
        assert_eq!(written(&client), "a1 CAPABILITY\r\n");
        assert_eq!(capabilities.len(), 4);
        for e in ["IMAP4rev1", "STARTTLS", "AUTH=GSSAPI", "logindisabled"] {
            assert!(capabilities.has(e));
        }
    }

    #[test]
    fn authenticate_plain() {
        let mut client = client(b"+ \r\na1 OK Authenticated\r\n");
        let auth = crate::authenticator::PlainAuthenticator {
            user: "user",
            password: "pass",
        };
        client.authenticate("PLAIN", &auth).unwrap();
        assert_eq!(
            written(&client),
            "a1 AUTHENTICATE PLAIN\r\nAHVzZXIAcGFzcw==\r\n"
        );
    }

    #[test]
    fn cancelled_before_write() {
        let mut client = client(b"a1 OK NOOP completed\r\n");
        let cancel = Cancellable::new();
        client.set_cancellable(cancel.clone());
        cancel.cancel();
        assert!(matches!(
            client.send_command(&Command::new("NOOP")),
            Err(Error::Cancelled)
        ));
        assert!(client.stream.get_ref().written().is_empty());
    }

    #[test]
    fn streaming_read() {
        let mut client = client(
            b"* 1 FETCH (UID 10)\r\n\
              * 2 FETCH (UID 11)\r\n\
              a1 OK done\r\n",
        );
        client
            .start_command(&Command::new("FETCH").atom("1:2").atom("UID"))
            .unwrap();
        let mut seen = 0;
        loop {
            match client.read_next_response().unwrap() {
                ResponseLine::Untagged(_) => seen += 1,
                ResponseLine::Tagged(done) => {
                    assert_eq!(done.status, Status::Ok);
                    break;
                }
                ResponseLine::Continuation(_) => unreachable!(),
            }
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn literal_length_detection() {
        assert_eq!(literal_length(b"* 1 FETCH (BODY[] {42}\r\n").unwrap(), Some(42));
        assert_eq!(literal_length(b"* 1 FETCH (BODY[] {42+}\r\n").unwrap(), Some(42));
        assert_eq!(literal_length(b"* OK {not a literal}\r\n").unwrap(), None);
        assert_eq!(literal_length(b"* OK fine\r\n").unwrap(), None);
    }
}

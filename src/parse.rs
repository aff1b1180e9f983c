//! Decoding of server responses.
//!
//! Status responses (`OK`/`NO`/`BAD`/`BYE` with their bracketed codes) are handed to
//! `imap-proto`. Data responses are parsed here with nom, leniently: items may come in any
//! order and unknown `FETCH` items are skipped.

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{cut, map, opt, recognize};
use nom::error::{ErrorKind, FromExternalError};
use nom::multi::{many0, many1, separated_list0};
use nom::sequence::{delimited, preceded};
use nom::IResult;
use tracing::warn;

use crate::client::{Response, Status, Tagged};
use crate::error::{Error, ParseError, Result};
use crate::types::*;
use crate::utf7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    Invalid,
    Truncated,
    Unterminated,
    LiteralLength,
}

#[derive(Debug)]
struct Failure<'a> {
    input: &'a [u8],
    fault: Fault,
}

impl<'a> nom::error::ParseError<&'a [u8]> for Failure<'a> {
    fn from_error_kind(input: &'a [u8], _kind: ErrorKind) -> Self {
        let fault = if input.is_empty() {
            Fault::Truncated
        } else {
            Fault::Invalid
        };
        Failure { input, fault }
    }

    fn append(_input: &'a [u8], _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a, E> FromExternalError<&'a [u8], E> for Failure<'a> {
    fn from_external_error(input: &'a [u8], kind: ErrorKind, _e: E) -> Self {
        <Self as nom::error::ParseError<&'a [u8]>>::from_error_kind(input, kind)
    }
}

type PResult<'a, O> = IResult<&'a [u8], O, Failure<'a>>;

fn fail<O>(input: &[u8], fault: Fault) -> PResult<'_, O> {
    Err(nom::Err::Failure(Failure { input, fault }))
}

fn reject<O>(input: &[u8]) -> PResult<'_, O> {
    Err(nom::Err::Error(Failure {
        input,
        fault: Fault::Invalid,
    }))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end().to_string()
}

fn finish<'a, O>(line: &'a [u8], result: PResult<'a, O>) -> std::result::Result<O, ParseError> {
    match result {
        Ok((_, o)) => Ok(o),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(match e.fault {
            Fault::Invalid => {
                tracing::trace!(at = %lossy(e.input), "parse failed");
                ParseError::Invalid(line.to_vec())
            }
            Fault::Truncated => ParseError::Truncated(lossy(line)),
            Fault::Unterminated => ParseError::Unterminated(lossy(line)),
            Fault::LiteralLength => ParseError::LiteralLength(lossy(line)),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Truncated(lossy(line))),
    }
}

fn strip_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

fn is_atom_char(b: u8) -> bool {
    b > 0x20
        && b < 0x7f
        && !matches!(b, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
}

fn is_astring_char(b: u8) -> bool {
    is_atom_char(b) || matches!(b, b']' | b'%' | b'*')
}

fn number64(i: &[u8]) -> PResult<'_, u64> {
    let (rest, digits) = digit1(i)?;
    match std::str::from_utf8(digits).ok().and_then(|s| s.parse().ok()) {
        Some(n) => Ok((rest, n)),
        None => reject(i),
    }
}

fn number(i: &[u8]) -> PResult<'_, u32> {
    let (rest, n) = number64(i)?;
    match u32::try_from(n) {
        Ok(n) => Ok((rest, n)),
        Err(_) => reject(i),
    }
}

fn sp(i: &[u8]) -> PResult<'_, &[u8]> {
    take_while1(|b| b == b' ')(i)
}

fn quoted(i: &[u8]) -> PResult<'_, Vec<u8>> {
    let (mut rest, _) = char('"')(i)?;
    let mut out = Vec::new();
    loop {
        match rest.first() {
            None | Some(b'\r') | Some(b'\n') => return fail(i, Fault::Unterminated),
            Some(b'"') => return Ok((&rest[1..], out)),
            Some(b'\\') => match rest.get(1) {
                Some(&c) if c != b'\r' && c != b'\n' => {
                    out.push(c);
                    rest = &rest[2..];
                }
                _ => return fail(i, Fault::Unterminated),
            },
            Some(&c) => {
                out.push(c);
                rest = &rest[1..];
            }
        }
    }
}

fn literal(i: &[u8]) -> PResult<'_, Vec<u8>> {
    let (rest, _) = char('{')(i)?;
    let (rest, digits) = match digit1::<_, Failure>(rest) {
        Ok(r) => r,
        Err(_) => return fail(i, Fault::LiteralLength),
    };
    let (rest, _) = opt(char('+'))(rest)?;
    let rest = match rest.strip_prefix(b"}\r\n") {
        Some(rest) => rest,
        None => return fail(i, Fault::LiteralLength),
    };
    let n: usize = match std::str::from_utf8(digits).ok().and_then(|s| s.parse().ok()) {
        Some(n) => n,
        None => return fail(i, Fault::LiteralLength),
    };
    if rest.len() < n {
        return fail(i, Fault::LiteralLength);
    }
    Ok((&rest[n..], rest[..n].to_vec()))
}

fn string(i: &[u8]) -> PResult<'_, Vec<u8>> {
    alt((quoted, literal))(i)
}

fn nil(i: &[u8]) -> PResult<'_, &[u8]> {
    tag_no_case("NIL")(i)
}

fn nstring(i: &[u8]) -> PResult<'_, Option<Vec<u8>>> {
    alt((map(string, Some), map(nil, |_| None)))(i)
}

fn astring(i: &[u8]) -> PResult<'_, Vec<u8>> {
    alt((string, map(take_while1(is_astring_char), |s: &[u8]| s.to_vec())))(i)
}

fn flag(i: &[u8]) -> PResult<'_, Flag<'static>> {
    let (rest, raw) = alt((
        tag("\\*"),
        recognize(preceded(opt(char('\\')), take_while1(is_atom_char))),
    ))(i)?;
    Ok((rest, Flag::from(String::from_utf8_lossy(raw).into_owned())))
}

fn flag_list(i: &[u8]) -> PResult<'_, Vec<Flag<'static>>> {
    delimited(
        char('('),
        separated_list0(sp, flag),
        preceded(take_while(|b| b == b' '), char(')')),
    )(i)
}

fn bare(i: &[u8]) -> PResult<'_, &[u8]> {
    take_while1(|b: u8| b > 0x20 && b < 0x7f && !matches!(b, b'(' | b')' | b'"' | b'{'))(i)
}

/// Any value: parenthesized list, string, or bare token.
fn value(i: &[u8]) -> PResult<'_, ()> {
    alt((paren_list, map(string, |_| ()), map(bare, |_| ())))(i)
}

fn paren_list(i: &[u8]) -> PResult<'_, ()> {
    let (i, _) = char('(')(i)?;
    let (i, _) = separated_list0(sp, value)(i)?;
    let (i, _) = take_while(|b| b == b' ')(i)?;
    let (i, _) = char(')')(i)?;
    Ok((i, ()))
}

fn raw_list(i: &[u8]) -> PResult<'_, String> {
    map(recognize(paren_list), |raw: &[u8]| {
        String::from_utf8_lossy(raw).into_owned()
    })(i)
}

fn mailbox_name(raw: Vec<u8>) -> String {
    let name = String::from_utf8_lossy(&raw).into_owned();
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        utf7::decode_lossy(&name)
    }
}

enum FetchItem {
    Flags(Vec<Flag<'static>>),
    Uid(Uid),
    Size(u32),
    InternalDate(String),
    Envelope(String),
    BodyStructure(String),
    Section(String, Option<Vec<u8>>),
    Skipped,
}

fn section(i: &[u8]) -> PResult<'_, String> {
    let (i, spec) = delimited(char('['), take_while(|b| b != b']'), char(']'))(i)?;
    let (i, _) = opt(delimited(char('<'), digit1, char('>')))(i)?;
    Ok((i, String::from_utf8_lossy(spec).into_owned()))
}

fn fetch_item(i: &[u8]) -> PResult<'_, FetchItem> {
    let (rest, name) = take_while1(|b| is_atom_char(b) && b != b'[')(i)?;
    let name = name.to_ascii_uppercase();
    // once the item name is read, a bad value fails the whole response
    let result = cut(|rest| fetch_value(&name, rest))(rest);
    result
}

fn fetch_value<'a>(name: &[u8], rest: &'a [u8]) -> PResult<'a, FetchItem> {
    match name {
        b"BODY" | b"BINARY" if rest.first() == Some(&b'[') => {
            let (rest, spec) = section(rest)?;
            let (rest, data) = preceded(char(' '), nstring)(rest)?;
            Ok((rest, FetchItem::Section(spec, data)))
        }
        b"FLAGS" => map(preceded(char(' '), flag_list), FetchItem::Flags)(rest),
        b"UID" => map(preceded(char(' '), number), FetchItem::Uid)(rest),
        b"RFC822.SIZE" => map(preceded(char(' '), number), FetchItem::Size)(rest),
        b"INTERNALDATE" => map(preceded(char(' '), string), |d| {
            FetchItem::InternalDate(String::from_utf8_lossy(&d).into_owned())
        })(rest),
        b"ENVELOPE" => map(preceded(char(' '), raw_list), FetchItem::Envelope)(rest),
        b"BODY" | b"BODYSTRUCTURE" => {
            map(preceded(char(' '), raw_list), FetchItem::BodyStructure)(rest)
        }
        b"RFC822" | b"RFC822.HEADER" | b"RFC822.TEXT" => {
            let spec = match name {
                b"RFC822.HEADER" => "HEADER",
                b"RFC822.TEXT" => "TEXT",
                _ => "",
            };
            map(preceded(char(' '), nstring), |data| {
                FetchItem::Section(spec.to_string(), data)
            })(rest)
        }
        _ => {
            let (rest, _) = opt(section)(rest)?;
            map(preceded(char(' '), value), |_| FetchItem::Skipped)(rest)
        }
    }
}

fn msg_atts(i: &[u8], message: Seq) -> PResult<'_, Fetch> {
    let (rest, items) = delimited(
        char('('),
        separated_list0(sp, fetch_item),
        preceded(take_while(|b| b == b' '), char(')')),
    )(i)?;
    let mut fetch = Fetch {
        message,
        ..Fetch::default()
    };
    for item in items {
        match item {
            FetchItem::Flags(flags) => fetch.flags = Some(flags),
            FetchItem::Uid(uid) => fetch.uid = Some(uid),
            FetchItem::Size(size) => fetch.size = Some(size),
            FetchItem::InternalDate(date) => fetch.internal_date = Some(date),
            FetchItem::Envelope(env) => fetch.envelope = Some(env),
            FetchItem::BodyStructure(bs) => fetch.body_structure = Some(bs),
            FetchItem::Section(spec, data) => fetch.sections.push((spec, data)),
            FetchItem::Skipped => {}
        }
    }
    Ok((rest, fetch))
}

fn list_body(i: &[u8]) -> PResult<'_, Name> {
    let (i, _) = char(' ')(i)?;
    let (i, attributes) = delimited(
        char('('),
        separated_list0(sp, recognize(preceded(opt(char('\\')), take_while1(is_atom_char)))),
        char(')'),
    )(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, delimiter) = alt((
        map(quoted, |q| q.first().map(|&b| b as char)),
        map(nil, |_| None),
    ))(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, name) = astring(i)?;
    Ok((
        i,
        Name {
            attributes: attributes
                .into_iter()
                .map(|a| NameAttribute::from(String::from_utf8_lossy(a).into_owned()))
                .collect(),
            delimiter,
            name: mailbox_name(name),
        },
    ))
}

fn status_body(i: &[u8]) -> PResult<'_, MailboxStatus> {
    let (i, _) = char(' ')(i)?;
    let (i, name) = astring(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, pairs) = delimited(
        char('('),
        separated_list0(
            sp,
            nom::sequence::separated_pair(take_while1(is_atom_char), char(' '), number64),
        ),
        char(')'),
    )(i)?;
    let mut status = MailboxStatus {
        mailbox: mailbox_name(name),
        ..MailboxStatus::default()
    };
    for (key, n) in pairs {
        let n = u32::try_from(n).ok();
        match key.to_ascii_uppercase().as_slice() {
            b"MESSAGES" => status.messages = n,
            b"RECENT" => status.recent = n,
            b"UNSEEN" => status.unseen = n,
            b"UIDNEXT" => status.uid_next = n,
            b"UIDVALIDITY" => status.uid_validity = n,
            _ => {}
        }
    }
    Ok((i, status))
}

fn namespace_entry(i: &[u8]) -> PResult<'_, NamespaceEntry> {
    let (i, _) = char('(')(i)?;
    let (i, prefix) = string(i)?;
    let (i, _) = sp(i)?;
    let (i, delimiter) = alt((
        map(quoted, |q| q.first().map(|&b| b as char)),
        map(nil, |_| None),
    ))(i)?;
    let (i, _) = many0(preceded(sp, value))(i)?;
    let (i, _) = char(')')(i)?;
    Ok((
        i,
        NamespaceEntry {
            prefix: mailbox_name(prefix),
            delimiter,
        },
    ))
}

fn namespace_desc(i: &[u8]) -> PResult<'_, Vec<NamespaceEntry>> {
    alt((
        map(nil, |_| Vec::new()),
        delimited(
            char('('),
            many1(preceded(take_while(|b| b == b' '), namespace_entry)),
            char(')'),
        ),
    ))(i)
}

/// The condition of an untagged status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// `* OK`
    Ok,
    /// `* NO`
    No,
    /// `* BAD`
    Bad,
    /// `* BYE`; the server is about to close the connection.
    Bye,
    /// `* PREAUTH`
    PreAuth,
}

/// One classified untagged response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Untagged {
    /// `* n EXISTS`
    Exists(u32),
    /// `* n RECENT`
    Recent(u32),
    /// `* n EXPUNGE`
    Expunge(Seq),
    /// `* n FETCH (...)`
    Fetch(Fetch),
    /// `* FLAGS (...)`
    Flags(Vec<Flag<'static>>),
    /// `* CAPABILITY ...`
    Capability(Capabilities),
    /// `* LIST ...`
    List(Name),
    /// `* LSUB ...`
    Lsub(Name),
    /// `* STATUS ...`
    Status(MailboxStatus),
    /// `* SEARCH ...`
    Search(Vec<u32>),
    /// `* NAMESPACE ...`; only the personal namespaces are kept.
    Namespace(Vec<NamespaceEntry>),
    /// `* OK`/`NO`/`BAD`/`BYE`/`PREAUTH` with an optional code.
    Condition {
        /// Which condition.
        condition: Condition,
        /// The bracketed response code.
        code: Option<ResponseCode>,
        /// The text after the code.
        text: String,
    },
    /// Anything else; the keyword is kept for logging.
    Other(String),
}

fn untagged_numbered(i: &[u8]) -> PResult<'_, Untagged> {
    let (i, n) = number(i)?;
    let (i, _) = char(' ')(i)?;
    let (rest, keyword) = take_while1(|b: u8| b.is_ascii_alphabetic())(i)?;
    match keyword.to_ascii_uppercase().as_slice() {
        b"EXISTS" => Ok((rest, Untagged::Exists(n))),
        b"RECENT" => Ok((rest, Untagged::Recent(n))),
        b"EXPUNGE" => Ok((rest, Untagged::Expunge(n))),
        b"FETCH" => {
            let (rest, _) = char(' ')(rest)?;
            map(|i| msg_atts(i, n), Untagged::Fetch)(rest)
        }
        other => Ok((rest, Untagged::Other(String::from_utf8_lossy(other).into_owned()))),
    }
}

fn untagged_keyword(i: &[u8]) -> PResult<'_, Untagged> {
    let (rest, keyword) = take_while1(|b: u8| b.is_ascii_alphabetic())(i)?;
    match keyword.to_ascii_uppercase().as_slice() {
        b"CAPABILITY" => map(many0(preceded(sp, take_while1(is_astring_char))), |caps| {
            Untagged::Capability(Capabilities::new(
                caps.into_iter().map(|c: &[u8]| String::from_utf8_lossy(c).into_owned()),
            ))
        })(rest),
        b"FLAGS" => map(preceded(char(' '), flag_list), Untagged::Flags)(rest),
        b"LIST" => map(list_body, Untagged::List)(rest),
        b"LSUB" => map(list_body, Untagged::Lsub)(rest),
        b"STATUS" => map(status_body, Untagged::Status)(rest),
        b"SEARCH" => map(many0(preceded(sp, number)), Untagged::Search)(rest),
        b"NAMESPACE" => {
            let (rest, _) = char(' ')(rest)?;
            map(namespace_desc, Untagged::Namespace)(rest)
        }
        other => Ok((rest, Untagged::Other(String::from_utf8_lossy(other).into_owned()))),
    }
}

fn condition_of(body: &[u8]) -> Option<Condition> {
    let word_end = body
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(body.len());
    match body[..word_end].to_ascii_uppercase().as_slice() {
        b"OK" => Some(Condition::Ok),
        b"NO" => Some(Condition::No),
        b"BAD" => Some(Condition::Bad),
        b"BYE" => Some(Condition::Bye),
        b"PREAUTH" => Some(Condition::PreAuth),
        _ => None,
    }
}

/// Split `[CODE ...] text` by hand when `imap-proto` rejects the line.
fn split_text(rest: &[u8]) -> String {
    let rest = String::from_utf8_lossy(rest).trim().to_string();
    if rest.starts_with('[') {
        if let Some(end) = rest.find(']') {
            return rest[end + 1..].trim().to_string();
        }
    }
    rest
}

fn after_words(line: &[u8], words: usize) -> &[u8] {
    let mut rest = line;
    for _ in 0..words {
        match rest.iter().position(|&b| b == b' ') {
            Some(p) => rest = &rest[p + 1..],
            None => return &[],
        }
    }
    rest
}

/// Classify one untagged response line (with literals inlined).
pub fn parse_untagged(line: &[u8]) -> std::result::Result<Untagged, ParseError> {
    let body = strip_crlf(line);
    let rest = match body.strip_prefix(b"* ") {
        Some(rest) => rest,
        None => return Err(ParseError::Invalid(line.to_vec())),
    };
    if let Some(condition) = condition_of(rest) {
        let (code, text) = match imap_proto::parser::parse_response(line) {
            Ok((
                _,
                imap_proto::Response::Data {
                    code: Some(code),
                    information,
                    ..
                },
            )) => (
                Some(ResponseCode::from(code)),
                information.map(|s| s.to_string()).unwrap_or_default(),
            ),
            // codes imap-proto does not know stay in its text
            _ => (None, split_text(after_words(rest, 1))),
        };
        return Ok(Untagged::Condition {
            condition,
            code,
            text,
        });
    }
    finish(line, alt((untagged_numbered, untagged_keyword))(rest))
}

/// Parse the tagged completion line of a command.
pub fn parse_tagged(line: &[u8]) -> Result<Tagged> {
    let body = strip_crlf(line);
    let status_word = after_words(body, 1);
    let word_end = status_word
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(status_word.len());
    let status = match status_word[..word_end].to_ascii_uppercase().as_slice() {
        b"OK" => Status::Ok,
        b"NO" => Status::No,
        b"BAD" => Status::Bad,
        _ => return Err(Error::Parse(ParseError::Invalid(line.to_vec()))),
    };
    let (code, text) = match imap_proto::parser::parse_response(line) {
        Ok((
            _,
            imap_proto::Response::Done {
                code: Some(code),
                information,
                ..
            },
        )) => (
            Some(ResponseCode::from(code)),
            information.map(|s| s.to_string()).unwrap_or_default(),
        ),
        _ => (None, split_text(after_words(body, 2))),
    };
    Ok(Tagged { status, code, text })
}

/// Parse a single `FETCH` response.
pub fn parse_fetch(line: &[u8]) -> std::result::Result<Fetch, ParseError> {
    match parse_untagged(line)? {
        Untagged::Fetch(fetch) => Ok(fetch),
        _ => Err(ParseError::Invalid(line.to_vec())),
    }
}

/// Parse a single `LIST` or `LSUB` response.
pub fn parse_list(line: &[u8]) -> std::result::Result<Name, ParseError> {
    match parse_untagged(line)? {
        Untagged::List(name) | Untagged::Lsub(name) => Ok(name),
        _ => Err(ParseError::Invalid(line.to_vec())),
    }
}

/// All `FETCH` responses among `lines`; a malformed one fails the whole batch.
pub fn parse_fetches(lines: &[Vec<u8>]) -> std::result::Result<Vec<Fetch>, ParseError> {
    let mut fetches = Vec::new();
    for line in lines {
        if let Untagged::Fetch(fetch) = parse_untagged(line)? {
            fetches.push(fetch);
        }
    }
    Ok(fetches)
}

/// All `LIST`/`LSUB` names among `lines`. Malformed lines are skipped.
pub fn parse_names(lines: &[Vec<u8>]) -> Vec<Name> {
    lines
        .iter()
        .filter_map(|line| match parse_untagged(line) {
            Ok(Untagged::List(name)) | Ok(Untagged::Lsub(name)) => Some(name),
            Ok(_) => None,
            Err(e) => {
                warn!("skipping malformed list response: {}", e);
                None
            }
        })
        .collect()
}

/// The numbers of all `SEARCH` responses among `lines`.
pub fn parse_search(lines: &[Vec<u8>]) -> std::result::Result<Vec<u32>, ParseError> {
    let mut ids = Vec::new();
    for line in lines {
        if let Untagged::Search(found) = parse_untagged(line)? {
            ids.extend(found);
        }
    }
    Ok(ids)
}

/// The first `STATUS` response among `lines`.
pub fn parse_status(lines: &[Vec<u8>]) -> std::result::Result<MailboxStatus, ParseError> {
    for line in lines {
        if let Untagged::Status(status) = parse_untagged(line)? {
            return Ok(status);
        }
    }
    Err(ParseError::Truncated("no STATUS response".to_string()))
}

/// The personal namespaces from the `NAMESPACE` response among `lines`.
pub fn parse_namespace(
    lines: &[Vec<u8>],
) -> std::result::Result<Vec<NamespaceEntry>, ParseError> {
    for line in lines {
        if let Untagged::Namespace(entries) = parse_untagged(line)? {
            return Ok(entries);
        }
    }
    Err(ParseError::Truncated("no NAMESPACE response".to_string()))
}

/// The `CAPABILITY` response among `lines`.
pub fn parse_capabilities(
    lines: &[Vec<u8>],
) -> std::result::Result<Capabilities, ParseError> {
    for line in lines {
        if let Untagged::Capability(caps) = parse_untagged(line)? {
            return Ok(caps);
        }
    }
    Err(ParseError::Truncated("no CAPABILITY response".to_string()))
}

/// Response codes carried by untagged status responses.
pub fn response_codes(lines: &[Vec<u8>]) -> Vec<ResponseCode> {
    lines
        .iter()
        .filter_map(|line| match parse_untagged(line) {
            Ok(Untagged::Condition {
                code: Some(code), ..
            }) => Some(code),
            _ => None,
        })
        .collect()
}

/// The mailbox state reported by `SELECT` or `EXAMINE`. Lines that fail to parse are logged and
/// skipped.
pub fn parse_mailbox(response: &Response) -> Mailbox {
    let mut mailbox = Mailbox::default();
    let apply = |code: &ResponseCode, mailbox: &mut Mailbox| match code {
        ResponseCode::UidValidity(v) => mailbox.uid_validity = Some(*v),
        ResponseCode::UidNext(n) => mailbox.uid_next = Some(*n),
        ResponseCode::Unseen(n) => mailbox.unseen = Some(*n),
        ResponseCode::PermanentFlags(flags) => {
            mailbox.permanent_flags = Some(flags.iter().map(|f| Flag::from(f.clone())).collect())
        }
        ResponseCode::ReadOnly => mailbox.read_only = true,
        ResponseCode::ReadWrite => mailbox.read_only = false,
        _ => {}
    };
    for line in &response.untagged {
        match parse_untagged(line) {
            Ok(Untagged::Exists(n)) => mailbox.exists = n,
            Ok(Untagged::Recent(n)) => mailbox.recent = n,
            Ok(Untagged::Flags(flags)) => mailbox.flags = flags,
            Ok(Untagged::Condition {
                code: Some(code), ..
            }) => apply(&code, &mut mailbox),
            Ok(_) => {}
            Err(e) => warn!("skipping malformed SELECT response: {}", e),
        }
    }
    if let Some(ref code) = response.code {
        apply(code, &mut mailbox);
    }
    mailbox
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_items_any_order() {
        let fetch =
            parse_fetch(b"* 12 FETCH (RFC822.SIZE 4423 FLAGS (\\Seen $Label1) UID 104)\r\n")
                .unwrap();
        assert_eq!(fetch.message, 12);
        assert_eq!(fetch.uid, Some(104));
        assert_eq!(fetch.size, Some(4423));
        assert_eq!(
            fetch.flags,
            Some(vec![Flag::Seen, Flag::Custom("$Label1".into())])
        );
        assert_eq!(fetch.message_flags(), Some(MessageFlag::Seen.into()));
    }

    #[test]
    fn fetch_skips_unknown_items() {
        let fetch = parse_fetch(
            b"* 1 FETCH (X-GM-LABELS (\\Inbox \"Work\") MODSEQ (624140003) UID 5 \
              X-GM-MSGID 1278455344230334865)\r\n",
        )
        .unwrap();
        assert_eq!(fetch.uid, Some(5));
    }

    #[test]
    fn fetch_literal_with_crlf() {
        let fetch = parse_fetch(b"* 2 FETCH (UID 9 BODY[1.MIME] {11}\r\nab\r\n\r\ncd)ef)\r\n")
            .unwrap();
        assert_eq!(fetch.section("1.mime"), Some(&b"ab\r\n\r\ncd)ef"[..]));
    }

    #[test]
    fn fetch_rfc822_and_nil_sections() {
        let fetch = parse_fetch(
            b"* 3 FETCH (RFC822 {5}\r\nhello RFC822.HEADER NIL BODY[TEXT]<0> \"x\")\r\n",
        )
        .unwrap();
        assert_eq!(fetch.body(), Some(&b"hello"[..]));
        assert_eq!(fetch.section("HEADER"), None);
        assert_eq!(fetch.section("TEXT"), Some(&b"x"[..]));
        assert_eq!(fetch.sections.len(), 3);
    }

    #[test]
    fn fetch_bodystructure_is_raw() {
        let fetch = parse_fetch(
            b"* 4 FETCH (BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \
              \"7BIT\" 1152 23) INTERNALDATE \"17-Jul-1996 02:44:25 -0700\")\r\n",
        )
        .unwrap();
        assert!(fetch
            .body_structure
            .as_deref()
            .unwrap()
            .starts_with("(\"TEXT\" \"PLAIN\""));
        assert_eq!(
            fetch.internal_date.as_deref(),
            Some("17-Jul-1996 02:44:25 -0700")
        );
    }

    #[test]
    fn unterminated_quote() {
        match parse_fetch(b"* 4 FETCH (INTERNALDATE \"17-Jul-1996)\r\n") {
            Err(ParseError::Unterminated(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_literal_length() {
        match parse_fetch(b"* 4 FETCH (BODY[] {40}\r\nshort)\r\n") {
            Err(ParseError::LiteralLength(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn truncated_line() {
        match parse_fetch(b"* 4 FETCH (UID 7 FLAGS (\\Seen\r\n") {
            Err(ParseError::Truncated(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn list_quoted_name() {
        let name = parse_list(b"* LIST (\\HasNoChildren) \".\" \"INBOX.Sent Items\"\r\n").unwrap();
        assert_eq!(name.name(), "INBOX.Sent Items");
        assert_eq!(name.delimiter(), Some('.'));
        assert!(name.has(&NameAttribute::HasNoChildren));
    }

    #[test]
    fn list_atom_and_utf7_name() {
        let name = parse_list(b"* LSUB () \"/\" Entw&APw-rfe\r\n").unwrap();
        assert_eq!(name.name(), "Entwürfe");
        let name = parse_list(b"* LIST (\\Noselect) NIL inbox\r\n").unwrap();
        assert_eq!(name.name(), "INBOX");
        assert_eq!(name.delimiter(), None);
        assert!(name.has(&NameAttribute::NoSelect));
    }

    #[test]
    fn list_literal_name() {
        let name = parse_list(b"* LIST () \"\\\\\" {8}\r\nfoo\\\"bar\r\n").unwrap();
        assert_eq!(name.delimiter(), Some('\\'));
        assert_eq!(name.name(), "foo\\\"bar");
    }

    #[test]
    fn status_counts() {
        let lines = vec![
            b"* STATUS \"INBOX\" (MESSAGES 231 UIDNEXT 44292 UNSEEN 3 HIGHESTMODSEQ 90060115205545359)\r\n"
                .to_vec(),
        ];
        let status = parse_status(&lines).unwrap();
        assert_eq!(status.mailbox, "INBOX");
        assert_eq!(status.messages, Some(231));
        assert_eq!(status.uid_next, Some(44292));
        assert_eq!(status.unseen, Some(3));
        assert_eq!(status.uid_validity, None);
    }

    #[test]
    fn search_results() {
        let lines = vec![b"* SEARCH 2 84 882\r\n".to_vec(), b"* SEARCH\r\n".to_vec()];
        assert_eq!(parse_search(&lines).unwrap(), vec![2, 84, 882]);
    }

    #[test]
    fn namespace_personal() {
        let lines = vec![b"* NAMESPACE ((\"INBOX.\" \".\")) NIL ((\"#shared.\" \".\"))\r\n".to_vec()];
        assert_eq!(
            parse_namespace(&lines).unwrap(),
            vec![NamespaceEntry {
                prefix: "INBOX.".to_string(),
                delimiter: Some('.'),
            }]
        );
    }

    #[test]
    fn untagged_counts() {
        assert_eq!(parse_untagged(b"* 23 EXISTS\r\n").unwrap(), Untagged::Exists(23));
        assert_eq!(parse_untagged(b"* 4 expunge\r\n").unwrap(), Untagged::Expunge(4));
        assert_eq!(
            parse_untagged(b"* ENABLED CONDSTORE\r\n").unwrap(),
            Untagged::Other("ENABLED".to_string())
        );
    }

    #[test]
    fn untagged_codes() {
        let lines = vec![
            b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n".to_vec(),
            b"* OK [COPYUID 38505 304,319:320 3956:3958] Done\r\n".to_vec(),
        ];
        let codes = response_codes(&lines);
        assert_eq!(codes[0], ResponseCode::UidValidity(3857529045));
        assert_eq!(
            codes[1],
            ResponseCode::CopyUid {
                uid_validity: 38505,
                source: vec![304..=304, 319..=320],
                dest: vec![3956..=3958],
            }
        );
    }

    #[test]
    fn tagged_with_code() {
        let done = parse_tagged(b"a7 NO [TRYCREATE] Mailbox doesn't exist\r\n").unwrap();
        assert_eq!(done.status, Status::No);
        assert_eq!(done.code, Some(ResponseCode::TryCreate));
        assert_eq!(done.text, "Mailbox doesn't exist");
    }

    #[test]
    fn tagged_with_unknown_code() {
        let done =
            parse_tagged(b"a1 NO [AUTHENTICATIONFAILED] Authentication failed.\r\n").unwrap();
        assert_eq!(done.status, Status::No);
        assert_eq!(done.code, None);
        assert_eq!(done.text, "Authentication failed.");
    }

    #[test]
    fn bye_condition() {
        match parse_untagged(b"* BYE Autologout; idle for too long\r\n").unwrap() {
            Untagged::Condition { condition, .. } => assert_eq!(condition, Condition::Bye),
            other => panic!("unexpected {:?}", other),
        }
    }
}

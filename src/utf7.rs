//! Modified UTF-7 mailbox name encoding, [RFC 3501 section
//! 5.1.3](https://tools.ietf.org/html/rfc3501#section-5.1.3).

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::error::ParseError;

const MUTF7: GeneralPurpose = GeneralPurpose::new(
    &alphabet::IMAP_MUTF7,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

fn is_direct(c: char) -> bool {
    (' '..='~').contains(&c)
}

fn flush_shifted(out: &mut String, pending: &mut Vec<u16>) {
    if pending.is_empty() {
        return;
    }
    let bytes: Vec<u8> = pending.iter().flat_map(|u| u.to_be_bytes()).collect();
    out.push('&');
    out.push_str(&MUTF7.encode(bytes));
    out.push('-');
    pending.clear();
}

/// Encode a mailbox name for the wire.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending = Vec::new();
    for c in name.chars() {
        if is_direct(c) {
            flush_shifted(&mut out, &mut pending);
            if c == '&' {
                out.push_str("&-");
            } else {
                out.push(c);
            }
        } else {
            let mut units = [0u16; 2];
            pending.extend_from_slice(c.encode_utf16(&mut units));
        }
    }
    flush_shifted(&mut out, &mut pending);
    out
}

/// Decode a mailbox name received from the server.
pub fn decode(name: &str) -> Result<String, ParseError> {
    let invalid = || ParseError::Invalid(name.as_bytes().to_vec());
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('-').ok_or_else(invalid)?;
        let shifted = &after[..end];
        if shifted.is_empty() {
            out.push('&');
        } else {
            let bytes = MUTF7.decode(shifted).map_err(|_| invalid())?;
            if bytes.len() % 2 != 0 {
                return Err(invalid());
            }
            let units = bytes
                .chunks(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            for c in char::decode_utf16(units) {
                out.push(c.map_err(|_| invalid())?);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Decode a name, falling back to the raw form when the server sent something that is not
/// valid modified UTF-7.
pub(crate) fn decode_lossy(name: &str) -> String {
    decode(name).unwrap_or_else(|_| {
        tracing::debug!(name, "mailbox name is not modified UTF-7; using it verbatim");
        name.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rfc_example() {
        assert_eq!(
            encode("~peter/mail/台北/日本語"),
            "~peter/mail/&U,BTFw-/&ZeVnLIqe-"
        );
        assert_eq!(
            decode("~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap(),
            "~peter/mail/台北/日本語"
        );
    }

    #[test]
    fn ampersand() {
        assert_eq!(encode("Tom & Jerry"), "Tom &- Jerry");
        assert_eq!(decode("Tom &- Jerry").unwrap(), "Tom & Jerry");
    }

    #[test]
    fn plain_ascii_untouched() {
        assert_eq!(encode("INBOX.Sent"), "INBOX.Sent");
    }

    #[test]
    fn unterminated_shift_is_invalid() {
        assert!(decode("&U,BTFw").is_err());
        assert_eq!(decode_lossy("&U,BTFw"), "&U,BTFw");
    }

    proptest! {
        #[test]
        fn round_trip(name in "\\PC{0,24}") {
            prop_assert_eq!(decode(&encode(&name)).unwrap(), name);
        }
    }
}

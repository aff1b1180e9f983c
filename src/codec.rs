//! Content-Transfer-Encoding decoding for cached MIME parts.

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, ParseError, Result};

/// A `Content-Transfer-Encoding` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TransferEncoding {
    /// `7bit`
    #[default]
    SevenBit,
    /// `8bit`
    EightBit,
    /// `binary`
    Binary,
    /// `base64`
    Base64,
    /// `quoted-printable`
    QuotedPrintable,
}

impl FromStr for TransferEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7bit" | "" => Ok(TransferEncoding::SevenBit),
            "8bit" => Ok(TransferEncoding::EightBit),
            "binary" => Ok(TransferEncoding::Binary),
            "base64" => Ok(TransferEncoding::Base64),
            "quoted-printable" => Ok(TransferEncoding::QuotedPrintable),
            other => Err(Error::Parse(ParseError::Invalid(other.as_bytes().to_vec()))),
        }
    }
}

/// Decode `data` according to `encoding`. Base64 ignores line breaks and other whitespace;
/// quoted-printable is decoded robustly, keeping malformed escapes as they are.
pub fn decode(encoding: TransferEncoding, data: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        TransferEncoding::SevenBit | TransferEncoding::EightBit | TransferEncoding::Binary => {
            Ok(data.to_vec())
        }
        TransferEncoding::Base64 => {
            let cleaned: Vec<u8> = data
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            STANDARD
                .decode(&cleaned)
                .map_err(|_| Error::Parse(ParseError::Invalid(data.to_vec())))
        }
        TransferEncoding::QuotedPrintable => {
            quoted_printable::decode(data, quoted_printable::ParseMode::Robust)
                .map_err(|_| Error::Parse(ParseError::Invalid(data.to_vec())))
        }
    }
}

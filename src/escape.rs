//! Delimiter argument decoding.
//!
//! Accepts a literal one-byte character or a backslash escape: `\n`, `\t`,
//! `\0`, `\xNN` (hex) or `\NNN` (octal).

use thiserror::Error;

/// Why a delimiter argument could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EscapeError {
    #[error("delimiter must not be empty")]
    Empty,

    #[error("delimiter must be a single byte, got '{0}'")]
    TooLong(String),

    #[error("invalid hex escape '{0}'")]
    InvalidHex(String),

    #[error("octal escape '{0}' is out of range (max \\377)")]
    OctalOutOfRange(String),

    #[error("unknown escape sequence '{0}'")]
    Unknown(String),
}

/// Map a control-character escape letter to its byte.
fn control_char(c: u8) -> Option<u8> {
    match c {
        b'a' => Some(0x07),
        b'b' => Some(0x08),
        b'f' => Some(0x0c),
        b'n' => Some(b'\n'),
        b'r' => Some(b'\r'),
        b't' => Some(b'\t'),
        b'v' => Some(0x0b),
        _ => None,
    }
}

/// Decode a delimiter argument into exactly one byte.
///
/// Unknown escapes of ASCII punctuation stand for the character itself, so
/// `\\` and `\,` both work.
pub fn parse_delimiter(arg: &str) -> Result<u8, EscapeError> {
    let bytes = arg.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return Err(EscapeError::Empty);
    };

    if first != b'\\' || rest.is_empty() {
        return match rest {
            [] => Ok(first),
            _ => Err(EscapeError::TooLong(arg.to_string())),
        };
    }

    match rest {
        [b'x', hex @ ..] => {
            if hex.is_empty() || hex.len() > 2 || !hex.iter().all(u8::is_ascii_hexdigit) {
                return Err(EscapeError::InvalidHex(arg.to_string()));
            }
            u8::from_str_radix(&arg[2..], 16).map_err(|_| EscapeError::InvalidHex(arg.to_string()))
        }
        digits if digits[0].is_ascii_digit() => {
            if digits.len() > 3 || !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                return Err(EscapeError::Unknown(arg.to_string()));
            }
            let value = digits
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            u8::try_from(value).map_err(|_| EscapeError::OctalOutOfRange(arg.to_string()))
        }
        [c] => control_char(*c)
            .or_else(|| c.is_ascii_punctuation().then_some(*c))
            .ok_or_else(|| EscapeError::Unknown(arg.to_string())),
        _ => Err(EscapeError::TooLong(arg.to_string())),
    }
}

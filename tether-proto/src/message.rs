//! Wire constants and reply classification for host↔guest communication.

use std::fmt;

/// Sentinel closing every frame on the wire (`04 CA FE BA BE 04 FA CE`).
pub const TERMINATOR: [u8; 8] = [0x04, 0xCA, 0xFE, 0xBA, 0xBE, 0x04, 0xFA, 0xCE];

/// Single control byte used by the file-write sub-protocol.
///
/// The guest emits it once when it is ready to receive raw bytes; the host
/// sends it once more after the payload to mark end-of-data.
pub const READY: u8 = 0x04;

/// Payload of the acknowledgement frame the command wrapper sends after
/// every primary frame.
pub const ACK: &[u8] = b"OK";

/// Prefix marking a primary frame as a guest-side runtime fault.
pub const EXCEPT_PREFIX: &[u8] = b"EXCEPT:";

/// A guest runtime fault decoded from an `EXCEPT:<hex>` payload.
///
/// The guest reports faults as a 64-bit word holding up to eight ASCII
/// characters packed little-endian (`"Compiler"` is `0x72656C69706D6F43`).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct GuestFault {
    /// The packed word, if the hex text parsed.
    pub word: Option<u64>,
    /// Human-readable mnemonic.
    pub name: String,
}

impl GuestFault {
    /// Builds a fault from a packed word.
    pub fn from_word(word: u64) -> Self {
        Self {
            word: Some(word),
            name: decode_word(word),
        }
    }

    /// Parses the text following [`EXCEPT_PREFIX`].
    ///
    /// Never fails: text that is not a hex word is kept verbatim as the name.
    pub fn parse(text: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(text);
        let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let word = u64::from_str_radix(digits, 16).ok().or_else(|| {
            i64::from_str_radix(digits, 16)
                .ok()
                .map(|v| u64::from_ne_bytes(v.to_ne_bytes()))
        });

        match word {
            Some(w) => Self::from_word(w),
            None => Self {
                word: None,
                name: trimmed.to_owned(),
            },
        }
    }
}

impl fmt::Display for GuestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Reinterprets a packed word as its ASCII mnemonic.
///
/// Total over all inputs: NUL bytes are dropped and non-ASCII bytes become
/// U+FFFD, so the result never exceeds eight characters.
pub fn decode_word(word: u64) -> String {
    word.to_le_bytes()
        .into_iter()
        .filter(|&b| b != 0)
        .map(|b| {
            if b.is_ascii() {
                char::from(b)
            } else {
                char::REPLACEMENT_CHARACTER
            }
        })
        .collect()
}

/// Interprets a tagged payload.
///
/// Returns `(true, mnemonic)` for `EXCEPT:` payloads and `(false, text)`
/// otherwise. Untagged payloads are never exceptions.
pub fn decode(payload: &[u8]) -> (bool, String) {
    match payload.strip_prefix(EXCEPT_PREFIX) {
        Some(rest) => (true, GuestFault::parse(rest).name),
        None => (false, String::from_utf8_lossy(payload).into_owned()),
    }
}

/// Primary-frame outcome of one exchange, classified once at the wire
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Reply {
    /// Untagged payload bytes, verbatim.
    Plain(Vec<u8>),
    /// The guest raised a runtime fault while running the command.
    Exception(GuestFault),
    /// No primary frame arrived before the deadline.
    Timeout,
}

impl Reply {
    /// Classifies a primary-frame payload.
    pub fn classify(payload: Vec<u8>) -> Self {
        match payload.strip_prefix(EXCEPT_PREFIX) {
            Some(rest) => Self::Exception(GuestFault::parse(rest)),
            None => Self::Plain(payload),
        }
    }

    /// Returns the plain payload, if any.
    pub fn as_plain(&self) -> Option<&[u8]> {
        match self {
            Self::Plain(p) => Some(p),
            _ => None,
        }
    }

    /// Consumes the reply, returning the plain payload, if any.
    pub fn into_plain(self) -> Option<Vec<u8>> {
        match self {
            Self::Plain(p) => Some(p),
            _ => None,
        }
    }

    /// Returns `true` for [`Reply::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

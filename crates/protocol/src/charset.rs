//! Session filename charset codec.
//!
//! Path names travel as raw bytes in the peer's encoding. Each session
//! agrees on one charset at construction time; the codec enforces up front
//! that the protocol's structural ASCII characters survive a round trip, so
//! later path splitting and line framing can operate on bytes directly.

use encoding_rs::Encoding;
use thiserror::Error;

/// Characters that must map to their ASCII values in any session charset.
const REQUIRED_ASCII: &[char] = &['/', '.', '\n', '\r', '\0'];

/// Rejected charset configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CharsetError {
    /// The label does not name a known encoding.
    #[error("unknown charset label: {0:?}")]
    UnknownLabel(String),

    /// The encoding mangles one of the protocol's structural characters.
    #[error("charset {charset} cannot round-trip required character {ch:?}")]
    NotRoundTrippable {
        /// Canonical name of the offending encoding.
        charset: &'static str,
        /// First required character that failed.
        ch: char,
    },
}

/// Strict two-way text codec for one session.
#[derive(Clone, Copy, Debug)]
pub struct TextCodec {
    encoding: &'static Encoding,
}

impl TextCodec {
    /// Creates a codec for the given label, validating the required ASCII
    /// round trip.
    pub fn new(label: &str) -> Result<Self, CharsetError> {
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| CharsetError::UnknownLabel(label.to_owned()))?;
        let codec = Self { encoding };

        for &ch in REQUIRED_ASCII {
            let mut buf = [0u8; 4];
            let text = &*ch.encode_utf8(&mut buf);
            let passes = match codec.encode(text) {
                Some(bytes) => {
                    bytes.len() == 1
                        && bytes[0] == ch as u8
                        && codec.decode(&bytes).as_deref() == Some(text)
                }
                None => false,
            };
            if !passes {
                return Err(CharsetError::NotRoundTrippable {
                    charset: encoding.name(),
                    ch,
                });
            }
        }
        Ok(codec)
    }

    /// UTF-8 codec, the default when no charset is negotiated.
    #[must_use]
    pub fn utf8() -> Self {
        Self {
            encoding: encoding_rs::UTF_8,
        }
    }

    /// Canonical name of the underlying encoding.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encodes text to wire bytes; `None` when any character is
    /// unrepresentable.
    #[must_use]
    pub fn encode(&self, text: &str) -> Option<Vec<u8>> {
        let (bytes, _, had_errors) = self.encoding.encode(text);
        if had_errors {
            None
        } else {
            Some(bytes.into_owned())
        }
    }

    /// Decodes wire bytes to text; `None` when the bytes are malformed in
    /// this encoding. A `None` marks the name as untransferrable rather than
    /// failing the session.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(std::borrow::Cow::into_owned)
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::utf8()
    }
}

//! One decoder for every byte field a passkey client may send.
//!
//! Browsers and native authenticators disagree on encodings: signatures arrive as
//! base64url, padded base64 or hex depending on the SDK. Everything funnels through
//! [`decode_bytes`] so call sites never branch on format, unless a deployment
//! pins the format with [`ByteFormat`].

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// Wire format of a byte field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteFormat {
    /// Sniff the format; an even-length run of hex digits is read as hex.
    #[default]
    Auto,
    Hex,
    /// Any base64 flavour, padded or not.
    Base64,
}

impl ByteFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "hex" => Some(Self::Hex),
            "base64" | "base64url" => Some(Self::Base64),
            _ => None,
        }
    }
}

/// Decode hex (optionally `0x`-prefixed), base64 or base64url, padded or not.
///
/// Hex wins when the input is an even-length run of hex digits, so a base64
/// string drawn only from `[0-9a-fA-F]` is misread. Clients with such output
/// need [`decode_as`] with [`ByteFormat::Base64`].
#[must_use]
pub fn decode_bytes(input: &str) -> Option<Vec<u8>> {
    decode_as(input, ByteFormat::Auto)
}

#[must_use]
pub fn decode_as(input: &str, format: ByteFormat) -> Option<Vec<u8>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let hex_candidate = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    match format {
        ByteFormat::Hex => hex::decode(hex_candidate).ok(),
        ByteFormat::Base64 => decode_base64_any(trimmed),
        ByteFormat::Auto => {
            if hex_candidate.len() % 2 == 0 && hex_candidate.chars().all(|c| c.is_ascii_hexdigit()) {
                if let Ok(bytes) = hex::decode(hex_candidate) {
                    return Some(bytes);
                }
            }
            decode_base64_any(trimmed)
        }
    }
}

/// Decode standard or url-safe base64 with or without padding.
#[must_use]
pub fn decode_base64_any(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(canonical_base64url(input).as_bytes())
        .ok()
}

/// Rewrite any base64 flavour into unpadded base64url text.
#[must_use]
pub fn canonical_base64url(input: &str) -> String {
    input
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect()
}

#[must_use]
pub fn encode_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_supported_flavour_to_same_bytes() {
        let expected = vec![0xfb, 0xff, 0x01, 0x02];
        assert_eq!(decode_bytes("fbff0102"), Some(expected.clone()));
        assert_eq!(decode_bytes("0xFBFF0102"), Some(expected.clone()));
        assert_eq!(decode_bytes("+/8BAg=="), Some(expected.clone()));
        assert_eq!(decode_bytes("-_8BAg"), Some(expected));
    }

    #[test]
    fn canonical_base64url_strips_padding_and_swaps_alphabet() {
        assert_eq!(canonical_base64url(" ab+/cd== "), "ab-_cd");
    }

    #[test]
    fn pinned_format_never_guesses() {
        // Valid base64 made only of hex digits.
        let ambiguous = "deadbeef";
        assert_eq!(decode_bytes(ambiguous), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(
            decode_as(ambiguous, ByteFormat::Base64),
            Some(vec![0x75, 0xe6, 0x9d, 0x6d, 0xe7, 0x9f])
        );
        assert_eq!(decode_as("-_8BAg", ByteFormat::Hex), None);
        assert_eq!(ByteFormat::parse(" Base64URL "), Some(ByteFormat::Base64));
        assert_eq!(ByteFormat::parse("binary"), None);
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert_eq!(decode_bytes("   "), None);
        assert_eq!(decode_bytes("not base64 !!"), None);
    }
}

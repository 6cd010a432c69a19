use crate::encoding::decode_bytes;
use crate::error::VerificationError;

pub const UNCOMPRESSED_KEY_LEN: usize = 65;
const UNCOMPRESSED_PREFIX: u8 = 0x04;

/// Decode a P-256 public key and return it in uncompressed SEC1 form when possible.
///
/// A bare 64-byte `X || Y` gains the `0x04` prefix; other shapes are returned as decoded.
#[must_use]
pub fn normalize_public_key(encoded: &str) -> Option<Vec<u8>> {
    let bytes = decode_bytes(encoded)?;
    if bytes.len() == UNCOMPRESSED_KEY_LEN - 1 {
        let mut prefixed = Vec::with_capacity(UNCOMPRESSED_KEY_LEN);
        prefixed.push(UNCOMPRESSED_PREFIX);
        prefixed.extend_from_slice(&bytes);
        return Some(prefixed);
    }
    Some(bytes)
}

/// Check the presented key against the one registered for the wallet on the target contract.
///
/// Nothing registered means nothing to compare. Anything registered requires a presented
/// key that decodes to the same bytes.
pub fn verify_signing_key(
    presented: Option<&str>,
    registered: Option<&str>,
) -> Result<(), VerificationError> {
    let Some(registered) = registered else {
        return Ok(());
    };
    let registered = normalize_public_key(registered).ok_or(VerificationError::InvalidEncoding("registered_key"))?;
    let presented = presented
        .and_then(normalize_public_key)
        .ok_or(VerificationError::SigningKeyMismatch)?;
    if presented == registered {
        Ok(())
    } else {
        Err(VerificationError::SigningKeyMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_base64url;

    fn key_bytes() -> Vec<u8> {
        let mut key = vec![UNCOMPRESSED_PREFIX];
        key.extend(1..=64u8);
        key
    }

    #[test]
    fn hex_and_base64url_forms_of_same_key_match() {
        let key = key_bytes();
        let hex_form = hex::encode(&key);
        let b64_form = encode_base64url(&key);
        assert_eq!(verify_signing_key(Some(&b64_form), Some(&hex_form)), Ok(()));
    }

    #[test]
    fn bare_coordinates_are_prefixed() {
        let key = key_bytes();
        let bare = hex::encode(&key[1..]);
        assert_eq!(normalize_public_key(&bare), Some(key.clone()));
        assert_eq!(verify_signing_key(Some(&bare), Some(&hex::encode(&key))), Ok(()));
    }

    #[test]
    fn mismatch_and_missing_presented_key_are_fatal() {
        let key = key_bytes();
        let mut other = key.clone();
        other[10] ^= 0xff;
        assert_eq!(
            verify_signing_key(Some(&hex::encode(&other)), Some(&hex::encode(&key))),
            Err(VerificationError::SigningKeyMismatch)
        );
        assert_eq!(
            verify_signing_key(None, Some(&hex::encode(&key))),
            Err(VerificationError::SigningKeyMismatch)
        );
        assert_eq!(verify_signing_key(None, None), Ok(()));
    }
}

//! Binding between the signed action payload and the WebAuthn challenge.
//!
//! The client derives the challenge from the first 32 bytes of the payload,
//! zero-padded, base64url encoded without padding. The server recomputes the same
//! value and compares it to `clientDataJSON.challenge`.

use serde::Deserialize;

use crate::encoding::{canonical_base64url, decode_base64_any, encode_base64url};
use crate::error::VerificationError;

pub const CHALLENGE_LEN: usize = 32;
pub const WEBAUTHN_GET_TYPE: &str = "webauthn.get";

/// Parsed `clientDataJSON`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientData {
    #[serde(rename = "type")]
    pub kind: String,
    pub challenge: String,
    #[serde(default)]
    pub origin: Option<String>,
}

impl ClientData {
    /// Accepts the JSON text itself or its base64/base64url encoding.
    pub fn parse(raw: &str) -> Result<Self, VerificationError> {
        let trimmed = raw.trim();
        let json_bytes = if trimmed.starts_with('{') {
            trimmed.as_bytes().to_vec()
        } else {
            decode_base64_any(trimmed).ok_or(VerificationError::InvalidEncoding("client_data"))?
        };
        let parsed: Self = serde_json::from_slice(&json_bytes)
            .map_err(|error| VerificationError::InvalidClientData(error.to_string()))?;
        if parsed.challenge.trim().is_empty() {
            return Err(VerificationError::InvalidClientData(
                "challenge is empty".to_string(),
            ));
        }
        Ok(parsed)
    }

    #[must_use]
    pub fn normalized_challenge(&self) -> String {
        canonical_base64url(&self.challenge)
    }
}

/// Find which form of the payload the client signed over.
///
/// The UTF-8 text is tried first. A payload that is not JSON and also decodes as
/// base64 is then tried as its decoded bytes. Returns the signed bytes and the
/// matching challenge; on mismatch the error carries the text form's challenge.
pub fn bind_payload(
    payload: &str,
    client_data: &ClientData,
) -> Result<(Vec<u8>, String), VerificationError> {
    let text = payload_text(payload);
    let text_mismatch = match verify_challenge(&text, client_data) {
        Ok(expected) => return Ok((text, expected)),
        Err(error) => error,
    };

    let trimmed = payload.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        if let Some(decoded) = decode_base64_any(trimmed) {
            if let Ok(expected) = verify_challenge(&decoded, client_data) {
                return Ok((decoded, expected));
            }
        }
    }
    Err(text_mismatch)
}

/// The payload as UTF-8 text, surrounding whitespace removed.
#[must_use]
pub fn payload_text(payload: &str) -> Vec<u8> {
    payload.trim().as_bytes().to_vec()
}

#[must_use]
pub fn expected_challenge(payload: &[u8]) -> String {
    let mut challenge = [0u8; CHALLENGE_LEN];
    let take = payload.len().min(CHALLENGE_LEN);
    challenge[..take].copy_from_slice(&payload[..take]);
    encode_base64url(&challenge)
}

/// Compare the recomputed challenge with the authenticator's; returns the expected value.
pub fn verify_challenge(payload: &[u8], client_data: &ClientData) -> Result<String, VerificationError> {
    let expected = expected_challenge(payload);
    let actual = client_data.normalized_challenge();
    if expected != actual {
        return Err(VerificationError::ChallengeMismatch { expected, actual });
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str =
        r#"{"source":"W","asset":"X","amount":"100","action":"deposit","timestamp":123}"#;
    const PAYLOAD_CHALLENGE: &str = "eyJzb3VyY2UiOiJXIiwiYXNzZXQiOiJYIiwiYW1vdW4";

    fn client_data(challenge: &str) -> ClientData {
        ClientData {
            kind: WEBAUTHN_GET_TYPE.to_string(),
            challenge: challenge.to_string(),
            origin: Some("https://app.example".to_string()),
        }
    }

    #[test]
    fn canonical_payload_binds_to_first_32_bytes() -> Result<(), VerificationError> {
        assert_eq!(expected_challenge(PAYLOAD.as_bytes()), PAYLOAD_CHALLENGE);
        let (signed, expected) = bind_payload(PAYLOAD, &client_data(PAYLOAD_CHALLENGE))?;
        assert_eq!(expected, PAYLOAD_CHALLENGE);
        assert_eq!(signed, PAYLOAD.as_bytes());
        Ok(())
    }

    #[test]
    fn plain_text_that_looks_like_base64_binds_as_text() -> Result<(), VerificationError> {
        let challenge = expected_challenge(b"withdraw");
        let (signed, expected) = bind_payload("withdraw", &client_data(&challenge))?;
        assert_eq!(signed, b"withdraw");
        assert_eq!(expected, challenge);
        Ok(())
    }

    #[test]
    fn encoded_payload_binds_as_decoded_bytes() -> Result<(), VerificationError> {
        let raw = b"\x00\x01binary-action".to_vec();
        let encoded = encode_base64url(&raw);
        let challenge = expected_challenge(&raw);
        let (signed, _) = bind_payload(&encoded, &client_data(&challenge))?;
        assert_eq!(signed, raw);

        let result = bind_payload(&encoded, &client_data(PAYLOAD_CHALLENGE));
        let Err(VerificationError::ChallengeMismatch { expected, .. }) = result else {
            assert!(false, "expected challenge mismatch, got {result:?}");
            return Ok(());
        };
        assert_eq!(expected, expected_challenge(encoded.as_bytes()));
        Ok(())
    }

    #[test]
    fn single_altered_byte_is_a_mismatch() {
        let altered = PAYLOAD.replacen("\"W\"", "\"V\"", 1);
        let result = verify_challenge(altered.as_bytes(), &client_data(PAYLOAD_CHALLENGE));
        let Err(VerificationError::ChallengeMismatch { expected, actual }) = result else {
            assert!(false, "expected challenge mismatch, got {result:?}");
            return;
        };
        assert_ne!(expected, actual);
        assert_eq!(actual, PAYLOAD_CHALLENGE);
    }

    #[test]
    fn short_payload_is_zero_padded() {
        assert_eq!(
            expected_challenge(b"short"),
            "c2hvcnQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        );
    }

    #[test]
    fn padded_standard_base64_challenge_still_matches() -> Result<(), VerificationError> {
        let padded = format!("{PAYLOAD_CHALLENGE}=");
        verify_challenge(PAYLOAD.as_bytes(), &client_data(&padded))?;
        Ok(())
    }

    #[test]
    fn client_data_parses_from_base64url() -> Result<(), VerificationError> {
        let json = format!(
            r#"{{"type":"webauthn.get","challenge":"{PAYLOAD_CHALLENGE}","origin":"https://app.example"}}"#
        );
        let encoded = encode_base64url(json.as_bytes());
        let parsed = ClientData::parse(&encoded)?;
        assert_eq!(parsed.kind, WEBAUTHN_GET_TYPE);
        assert_eq!(parsed.normalized_challenge(), PAYLOAD_CHALLENGE);
        Ok(())
    }
}

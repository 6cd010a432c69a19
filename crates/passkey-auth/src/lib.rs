//! Passkey (WebAuthn, P-256) authorization checks for geotrigger executions.
//!
//! The runtime calls [`verify_authorization`] with the raw fields a client sends
//! back after signing. Every byte field goes through [`encoding::decode_bytes`],
//! signatures are folded to low-S `r || s`, and the signed payload is bound to
//! the WebAuthn challenge.

pub mod authenticator;
pub mod challenge;
pub mod encoding;
mod error;
pub mod keys;
pub mod payload;
pub mod signature;

use serde::{Deserialize, Serialize};

pub use authenticator::AuthenticatorData;
pub use challenge::{
    ClientData, bind_payload, expected_challenge, payload_text, verify_challenge,
};
pub use encoding::ByteFormat;
pub use error::VerificationError;
pub use keys::{normalize_public_key, verify_signing_key};
pub use payload::{SignaturePayload, digest_hex};
pub use signature::{RAW_SIGNATURE_LEN, normalize_signature};

/// How a challenge mismatch is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePolicy {
    #[default]
    Enforce,
    /// Log and continue; for clients whose payload serialization is known to drift.
    WarnOnly,
}

impl ChallengePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "enforce" | "strict" => Some(Self::Enforce),
            "warn" | "warn_only" | "warn-only" => Some(Self::WarnOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierPolicy {
    pub challenge: ChallengePolicy,
    /// When set, `sha256(rp_id)` must match the authenticator data.
    pub expected_rp_id: Option<String>,
    /// Maximum skew between the payload timestamp and now, in either direction.
    pub payload_max_age_seconds: Option<i64>,
    pub require_user_present: bool,
    pub signature_format: ByteFormat,
}

impl Default for VerifierPolicy {
    fn default() -> Self {
        Self {
            challenge: ChallengePolicy::Enforce,
            expected_rp_id: None,
            payload_max_age_seconds: Some(300),
            require_user_present: true,
            signature_format: ByteFormat::Auto,
        }
    }
}

/// Raw fields of a passkey authorization as received from a client.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationInput<'a> {
    pub signature: &'a str,
    pub authenticator_data: &'a str,
    pub client_data: &'a str,
    pub signature_payload: &'a str,
    /// Public key the client claims to have signed with.
    pub signing_key: Option<&'a str>,
    /// Key on record for this wallet and contract, if any.
    pub registered_key: Option<&'a str>,
    /// Wallet the payload `source` must name.
    pub expected_source: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedAuthorization {
    pub signature: [u8; RAW_SIGNATURE_LEN],
    pub challenge: String,
    pub authenticator: AuthenticatorData,
    pub client_data: ClientData,
    pub payload: Option<SignaturePayload>,
    /// Hex sha256 of the signed payload bytes; callers consume it as a nonce.
    pub payload_digest: String,
    pub warnings: Vec<String>,
}

/// Run every passkey check in order: signing key, signature, client data,
/// challenge, authenticator data, then payload source and freshness.
///
/// Replay protection is left to the caller, keyed by `payload_digest`.
pub fn verify_authorization(
    input: &AuthorizationInput<'_>,
    policy: &VerifierPolicy,
    now_unix: i64,
) -> Result<VerifiedAuthorization, VerificationError> {
    verify_signing_key(input.signing_key, input.registered_key)?;

    let signature_bytes =
        encoding::decode_as(input.signature, policy.signature_format)
            .ok_or(VerificationError::InvalidEncoding("signature"))?;
    let signature = normalize_signature(&signature_bytes)?;

    let client_data = ClientData::parse(input.client_data)?;
    if client_data.kind != challenge::WEBAUTHN_GET_TYPE {
        return Err(VerificationError::InvalidClientData(format!(
            "unexpected type {}",
            client_data.kind
        )));
    }

    let mut warnings = Vec::new();
    let (signed, challenge) = match bind_payload(input.signature_payload, &client_data) {
        Ok(bound) => bound,
        Err(VerificationError::ChallengeMismatch { expected, actual })
            if policy.challenge == ChallengePolicy::WarnOnly =>
        {
            tracing::warn!(
                expected = %expected,
                actual = %actual,
                "passkey challenge mismatch accepted under warn-only policy"
            );
            warnings.push(format!("challenge_mismatch: expected {expected}, got {actual}"));
            (payload_text(input.signature_payload), expected)
        }
        Err(error) => return Err(error),
    };

    let authenticator_bytes = encoding::decode_bytes(input.authenticator_data)
        .ok_or(VerificationError::InvalidEncoding("authenticator_data"))?;
    let authenticator = AuthenticatorData::parse(&authenticator_bytes)?;
    if policy.require_user_present {
        authenticator.require_user_present()?;
    }
    if let Some(rp_id) = policy.expected_rp_id.as_deref() {
        authenticator.check_rp_id(rp_id)?;
    }

    let payload = SignaturePayload::parse(&signed);
    if let Some(payload) = payload.as_ref() {
        check_payload(payload, input.expected_source, policy, now_unix)?;
    }

    Ok(VerifiedAuthorization {
        signature,
        challenge,
        authenticator,
        client_data,
        payload,
        payload_digest: digest_hex(&signed),
        warnings,
    })
}

fn check_payload(
    payload: &SignaturePayload,
    expected_source: Option<&str>,
    policy: &VerifierPolicy,
    now_unix: i64,
) -> Result<(), VerificationError> {
    if let (Some(expected), Some(actual)) = (expected_source, payload.source.as_deref()) {
        if expected != actual {
            return Err(VerificationError::PayloadSourceMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    if let (Some(max_age), Some(timestamp)) = (policy.payload_max_age_seconds, payload.timestamp_seconds()) {
        let age_seconds = now_unix - timestamp;
        if age_seconds.abs() > max_age {
            return Err(VerificationError::PayloadExpired { age_seconds });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::encoding::encode_base64url;

    const PAYLOAD: &str =
        r#"{"source":"W","asset":"X","amount":"100","action":"deposit","timestamp":123}"#;
    const NOW: i64 = 150;

    fn client_data_json(challenge: &str) -> String {
        format!(r#"{{"type":"webauthn.get","challenge":"{challenge}","origin":"https://app.example"}}"#)
    }

    fn authenticator_data(flags: u8) -> String {
        let mut bytes = Sha256::digest(b"app.example").to_vec();
        bytes.push(flags);
        bytes.extend_from_slice(&7u32.to_be_bytes());
        hex::encode(bytes)
    }

    fn raw_signature() -> String {
        let mut bytes = vec![0x11; 32];
        bytes.extend(vec![0x22; 32]);
        hex::encode(bytes)
    }

    fn input<'a>(client_data: &'a str, authenticator: &'a str, signature: &'a str) -> AuthorizationInput<'a> {
        AuthorizationInput {
            signature,
            authenticator_data: authenticator,
            client_data,
            signature_payload: PAYLOAD,
            signing_key: None,
            registered_key: None,
            expected_source: Some("W"),
        }
    }

    #[test]
    fn accepts_a_bound_authorization() -> Result<(), VerificationError> {
        let client_data = encode_base64url(client_data_json(&expected_challenge(PAYLOAD.as_bytes())).as_bytes());
        let authenticator = authenticator_data(0x05);
        let signature = raw_signature();
        let policy = VerifierPolicy {
            expected_rp_id: Some("app.example".to_string()),
            ..VerifierPolicy::default()
        };

        let verified = verify_authorization(&input(&client_data, &authenticator, &signature), &policy, NOW)?;

        assert_eq!(verified.challenge, "eyJzb3VyY2UiOiJXIiwiYXNzZXQiOiJYIiwiYW1vdW4");
        assert_eq!(verified.authenticator.sign_count, 7);
        assert_eq!(verified.payload_digest, digest_hex(PAYLOAD.as_bytes()));
        assert!(verified.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn pinned_signature_format_is_honoured() -> Result<(), VerificationError> {
        let client_data = client_data_json(&expected_challenge(PAYLOAD.as_bytes()));
        let authenticator = authenticator_data(0x01);
        let mut bytes = vec![0x11; 32];
        bytes.extend(vec![0x22; 32]);
        let signature = encode_base64url(&bytes);
        let request = input(&client_data, &authenticator, &signature);

        let as_hex = VerifierPolicy {
            signature_format: ByteFormat::Hex,
            ..VerifierPolicy::default()
        };
        assert_eq!(
            verify_authorization(&request, &as_hex, NOW),
            Err(VerificationError::InvalidEncoding("signature"))
        );

        let as_base64 = VerifierPolicy {
            signature_format: ByteFormat::Base64,
            ..VerifierPolicy::default()
        };
        let verified = verify_authorization(&request, &as_base64, NOW)?;
        assert_eq!(verified.signature.to_vec(), bytes);
        Ok(())
    }

    #[test]
    fn challenge_mismatch_is_fatal_unless_warn_only() -> Result<(), VerificationError> {
        let client_data = client_data_json(&expected_challenge(b"something else entirely"));
        let authenticator = authenticator_data(0x01);
        let signature = raw_signature();
        let request = input(&client_data, &authenticator, &signature);

        let strict = verify_authorization(&request, &VerifierPolicy::default(), NOW);
        assert!(matches!(strict, Err(VerificationError::ChallengeMismatch { .. })));

        let lenient = VerifierPolicy {
            challenge: ChallengePolicy::WarnOnly,
            ..VerifierPolicy::default()
        };
        let verified = verify_authorization(&request, &lenient, NOW)?;
        assert_eq!(verified.warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn signing_key_mismatch_wins_even_under_warn_only() {
        let client_data = client_data_json("bogus");
        let authenticator = authenticator_data(0x01);
        let signature = raw_signature();
        let mut request = input(&client_data, &authenticator, &signature);
        request.registered_key = Some("04aa");
        request.signing_key = Some("04bb");
        let policy = VerifierPolicy {
            challenge: ChallengePolicy::WarnOnly,
            ..VerifierPolicy::default()
        };
        assert_eq!(
            verify_authorization(&request, &policy, NOW),
            Err(VerificationError::SigningKeyMismatch)
        );
    }

    #[test]
    fn payload_checks_cover_source_and_freshness() {
        let client_data = client_data_json(&expected_challenge(PAYLOAD.as_bytes()));
        let authenticator = authenticator_data(0x01);
        let signature = raw_signature();
        let mut request = input(&client_data, &authenticator, &signature);

        request.expected_source = Some("OTHER");
        assert!(matches!(
            verify_authorization(&request, &VerifierPolicy::default(), NOW),
            Err(VerificationError::PayloadSourceMismatch { .. })
        ));

        request.expected_source = Some("W");
        assert_eq!(
            verify_authorization(&request, &VerifierPolicy::default(), 10_000),
            Err(VerificationError::PayloadExpired { age_seconds: 9_877 })
        );
    }

    #[test]
    fn wrong_client_data_type_and_missing_presence_are_rejected() {
        let challenge = expected_challenge(PAYLOAD.as_bytes());
        let create = format!(r#"{{"type":"webauthn.create","challenge":"{challenge}"}}"#);
        let present = authenticator_data(0x01);
        let absent = authenticator_data(0x00);
        let signature = raw_signature();

        assert!(matches!(
            verify_authorization(&input(&create, &present, &signature), &VerifierPolicy::default(), NOW),
            Err(VerificationError::InvalidClientData(_))
        ));
        let get = client_data_json(&challenge);
        assert!(matches!(
            verify_authorization(&input(&get, &absent, &signature), &VerifierPolicy::default(), NOW),
            Err(VerificationError::InvalidAuthenticatorData(_))
        ));
    }

    #[test]
    fn challenge_policy_parses_aliases() {
        assert_eq!(ChallengePolicy::parse("WARN"), Some(ChallengePolicy::WarnOnly));
        assert_eq!(ChallengePolicy::parse("enforce"), Some(ChallengePolicy::Enforce));
        assert_eq!(ChallengePolicy::parse("maybe"), None);
    }
}

/// Errors produced while verifying a passkey authorization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("invalid signature length: {0} bytes")]
    InvalidSignatureLength(usize),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("challenge mismatch: expected {expected}, got {actual}")]
    ChallengeMismatch { expected: String, actual: String },
    #[error("signing key does not match the key registered for this wallet")]
    SigningKeyMismatch,
    #[error("invalid client data: {0}")]
    InvalidClientData(String),
    #[error("invalid authenticator data: {0}")]
    InvalidAuthenticatorData(String),
    #[error("invalid encoding for {0}")]
    InvalidEncoding(&'static str),
    #[error("signature payload source {actual} does not match wallet {expected}")]
    PayloadSourceMismatch { expected: String, actual: String },
    #[error("signature payload is stale ({age_seconds}s old)")]
    PayloadExpired { age_seconds: i64 },
    #[error("signature payload was already used")]
    PayloadReplayed,
}

impl VerificationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignatureLength(_) => "invalid_signature_length",
            Self::MalformedSignature(_) => "malformed_signature",
            Self::ChallengeMismatch { .. } => "challenge_mismatch",
            Self::SigningKeyMismatch => "signing_key_mismatch",
            Self::InvalidClientData(_) => "invalid_client_data",
            Self::InvalidAuthenticatorData(_) => "invalid_authenticator_data",
            Self::InvalidEncoding(_) => "invalid_encoding",
            Self::PayloadSourceMismatch { .. } => "payload_source_mismatch",
            Self::PayloadExpired { .. } => "payload_expired",
            Self::PayloadReplayed => "payload_replayed",
        }
    }
}

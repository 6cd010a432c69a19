//! Canonical action payload signed by the passkey.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Timestamps above this are taken to be milliseconds.
const MILLISECOND_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignaturePayload {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Deposit and contract-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignaturePayload {
    /// `None` when the payload is not a JSON object.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn timestamp_seconds(&self) -> Option<i64> {
        self.timestamp.map(|timestamp| {
            if timestamp > MILLISECOND_THRESHOLD {
                timestamp / 1000
            } else {
                timestamp
            }
        })
    }
}

/// Hex sha256 of the signed bytes; used as the one-time nonce.
#[must_use]
pub fn digest_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_fields_and_keeps_the_rest() {
        let raw = br#"{"source":"W","asset":"X","amount":"100","action":"deposit","timestamp":123,"pool":"P1"}"#;
        let payload = SignaturePayload::parse(raw);
        assert!(payload.is_some());
        if let Some(payload) = payload {
            assert_eq!(payload.source.as_deref(), Some("W"));
            assert_eq!(payload.amount, Some(Value::String("100".to_string())));
            assert_eq!(payload.timestamp_seconds(), Some(123));
            assert_eq!(payload.extra.get("pool"), Some(&Value::String("P1".to_string())));
        }
    }

    #[test]
    fn millisecond_timestamps_are_scaled() {
        let payload = SignaturePayload::parse(br#"{"timestamp":1700000000123}"#);
        assert_eq!(
            payload.and_then(|p| p.timestamp_seconds()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn non_object_payloads_are_not_parsed() {
        assert!(SignaturePayload::parse(b"[1,2]").is_none());
        assert!(SignaturePayload::parse(b"deposit 100").is_none());
    }

    #[test]
    fn digest_is_stable_hex() {
        assert_eq!(digest_hex(b"abc").len(), 64);
        assert_eq!(
            digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

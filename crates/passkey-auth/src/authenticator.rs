use sha2::{Digest, Sha256};

use crate::error::VerificationError;

pub const MIN_AUTHENTICATOR_DATA_LEN: usize = 37;
pub const FLAG_USER_PRESENT: u8 = 0x01;
pub const FLAG_USER_VERIFIED: u8 = 0x04;

/// Fixed-width prefix of WebAuthn authenticator data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
}

impl AuthenticatorData {
    /// Parse the 37-byte header; extensions and attested credential data are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, VerificationError> {
        if bytes.len() < MIN_AUTHENTICATOR_DATA_LEN {
            return Err(VerificationError::InvalidAuthenticatorData(format!(
                "expected at least {MIN_AUTHENTICATOR_DATA_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&bytes[..32]);
        let flags = bytes[32];
        let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);
        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
        })
    }

    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }

    pub fn require_user_present(&self) -> Result<(), VerificationError> {
        if self.user_present() {
            Ok(())
        } else {
            Err(VerificationError::InvalidAuthenticatorData(
                "user presence flag not set".to_string(),
            ))
        }
    }

    /// Compare the embedded hash against `sha256(rp_id)`.
    pub fn check_rp_id(&self, rp_id: &str) -> Result<(), VerificationError> {
        let expected: [u8; 32] = Sha256::digest(rp_id.as_bytes()).into();
        if expected == self.rp_id_hash {
            Ok(())
        } else {
            Err(VerificationError::InvalidAuthenticatorData(format!(
                "rp id hash does not match {rp_id}"
            )))
        }
    }
}

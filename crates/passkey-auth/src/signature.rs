//! ECDSA P-256 signature normalization.
//!
//! Authenticators emit ASN.1 DER (`SEQUENCE { INTEGER r, INTEGER s }`), while the
//! on-chain verifier expects the fixed 64-byte `r || s` form with a low `s`.

use crate::error::VerificationError;

pub const RAW_SIGNATURE_LEN: usize = 64;
const SCALAR_LEN: usize = 32;

/// secp256r1 group order `n`.
const P256_ORDER: [u8; SCALAR_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84, 0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63,
    0x25, 0x51,
];

/// `n / 2`, the largest accepted `s` after normalization.
const P256_HALF_ORDER: [u8; SCALAR_LEN] = [
    0x7f, 0xff, 0xff, 0xff, 0x80, 0x00, 0x00, 0x00, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xde, 0x73, 0x7d, 0x56, 0xd3, 0x8b, 0xcf, 0x42, 0x79, 0xdc, 0xe5, 0x61, 0x7e, 0x31,
    0x92, 0xa8,
];

/// Normalize a DER (70..=72 bytes) or raw (64 bytes) signature to low-S `r || s`.
pub fn normalize_signature(signature: &[u8]) -> Result<[u8; RAW_SIGNATURE_LEN], VerificationError> {
    let (r, mut s) = match signature.len() {
        RAW_SIGNATURE_LEN => {
            let mut r = [0u8; SCALAR_LEN];
            let mut s = [0u8; SCALAR_LEN];
            r.copy_from_slice(&signature[..SCALAR_LEN]);
            s.copy_from_slice(&signature[SCALAR_LEN..]);
            (r, s)
        }
        70..=72 => parse_der(signature)?,
        other => return Err(VerificationError::InvalidSignatureLength(other)),
    };

    if is_zero(&r) || is_zero(&s) {
        return Err(VerificationError::MalformedSignature(
            "signature scalar is zero".to_string(),
        ));
    }
    if s > P256_HALF_ORDER {
        s = sub_from_order(&s);
    }

    let mut out = [0u8; RAW_SIGNATURE_LEN];
    out[..SCALAR_LEN].copy_from_slice(&r);
    out[SCALAR_LEN..].copy_from_slice(&s);
    Ok(out)
}

fn parse_der(der: &[u8]) -> Result<([u8; SCALAR_LEN], [u8; SCALAR_LEN]), VerificationError> {
    if der.first() != Some(&0x30) {
        return Err(malformed("missing SEQUENCE tag"));
    }
    let declared = der.get(1).copied().map(usize::from).unwrap_or_default();
    if declared != der.len() - 2 {
        return Err(malformed("SEQUENCE length does not match signature length"));
    }

    let (r, next) = read_integer(der, 2)?;
    let (s, end) = read_integer(der, next)?;
    if end != der.len() {
        return Err(malformed("trailing bytes after s"));
    }
    Ok((r, s))
}

fn read_integer(der: &[u8], offset: usize) -> Result<([u8; SCALAR_LEN], usize), VerificationError> {
    if der.get(offset) != Some(&0x02) {
        return Err(malformed("missing INTEGER tag"));
    }
    let len = der
        .get(offset + 1)
        .copied()
        .map(usize::from)
        .ok_or_else(|| malformed("truncated INTEGER length"))?;
    let start = offset + 2;
    let end = start + len;
    let value = der
        .get(start..end)
        .ok_or_else(|| malformed("truncated INTEGER value"))?;
    if value.is_empty() {
        return Err(malformed("empty INTEGER"));
    }

    let first_significant = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let significant = &value[first_significant..];
    if significant.len() > SCALAR_LEN {
        return Err(malformed("INTEGER wider than 32 bytes"));
    }

    let mut scalar = [0u8; SCALAR_LEN];
    scalar[SCALAR_LEN - significant.len()..].copy_from_slice(significant);
    Ok((scalar, end))
}

fn sub_from_order(s: &[u8; SCALAR_LEN]) -> [u8; SCALAR_LEN] {
    let mut out = [0u8; SCALAR_LEN];
    let mut borrow = 0i16;
    for idx in (0..SCALAR_LEN).rev() {
        let mut diff = i16::from(P256_ORDER[idx]) - i16::from(s[idx]) - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[idx] = diff as u8;
    }
    out
}

fn is_zero(scalar: &[u8; SCALAR_LEN]) -> bool {
    scalar.iter().all(|b| *b == 0)
}

fn malformed(reason: &str) -> VerificationError {
    VerificationError::MalformedSignature(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn der_encode(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut body = vec![0x02, r.len() as u8];
        body.extend_from_slice(r);
        body.push(0x02);
        body.push(s.len() as u8);
        body.extend_from_slice(s);
        let mut out = vec![0x30, body.len() as u8];
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn der_with_padded_r_normalizes_to_raw() -> Result<(), VerificationError> {
        let mut r = vec![0x00];
        r.extend_from_slice(&[0x81; 32]);
        let s = [0x11; 32];
        let der = der_encode(&r, &s);
        assert_eq!(der.len(), 71);

        let raw = normalize_signature(&der)?;
        assert_eq!(&raw[..32], &[0x81; 32]);
        assert_eq!(&raw[32..], &[0x11; 32]);
        Ok(())
    }

    #[test]
    fn raw_signature_passes_through_when_already_low_s() -> Result<(), VerificationError> {
        let mut raw = [0x22u8; 64];
        raw[32] = 0x01;
        assert_eq!(normalize_signature(&raw)?, raw);
        Ok(())
    }

    #[test]
    fn high_s_is_folded_below_half_order() -> Result<(), VerificationError> {
        let mut raw = [0x22u8; 64];
        let mut high_s = P256_ORDER;
        high_s[31] -= 5;
        raw[32..].copy_from_slice(&high_s);

        let normalized = normalize_signature(&raw)?;
        let mut expected_s = [0u8; 32];
        expected_s[31] = 5;
        assert_eq!(&normalized[32..], &expected_s);
        Ok(())
    }

    #[test]
    fn unexpected_lengths_are_rejected() {
        assert_eq!(
            normalize_signature(&[0u8; 65]),
            Err(VerificationError::InvalidSignatureLength(65))
        );
        assert_eq!(
            normalize_signature(&[0u8; 69]),
            Err(VerificationError::InvalidSignatureLength(69))
        );
    }

    #[test]
    fn der_with_wrong_tag_is_malformed() {
        let mut der = der_encode(&[0x01; 33], &[0x02; 33]);
        der[0] = 0x31;
        assert!(matches!(
            normalize_signature(&der),
            Err(VerificationError::MalformedSignature(_))
        ));
    }
}

//! Turning a card's DER signature into an Ethereum signature.
//!
//! The card returns `30 len 02 r_len r 02 s_len s`. We parse it, move S into
//! the lower half of the curve order, and check the result against the slot
//! key before handing it out.

use std::cmp::Ordering;

use p256::FieldBytes;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey};

use crate::error::{Error, Result};
use crate::signature::Signature;

/// Half the order of P-256.
const HALF_N: [u8; 32] = [
    0x7F, 0xFF, 0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xDE, 0x73, 0x7D, 0x56, 0xD3, 0x8B, 0xCF, 0x42, 0x79, 0xDC, 0xE5, 0x61, 0x7E, 0x31, 0x92, 0xA8,
];

/// The order of P-256.
const N: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xBC, 0xE6, 0xFA, 0xAD, 0xA7, 0x17, 0x9E, 0x84, 0xF3, 0xB9, 0xCA, 0xC2, 0xFC, 0x63, 0x25, 0x51,
];

/// Parses a DER ECDSA signature into fixed-width `(r, s)`.
///
/// # Errors
///
/// Returns [`Error::InvalidSignature`] if the encoding is malformed.
///
/// ```
/// use yubikey_device_kit::crypto::parse_der_signature;
///
/// let der = [0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02];
/// let (r, s) = parse_der_signature(&der).unwrap();
/// assert_eq!((r[31], s[31]), (1, 2));
/// ```
pub fn parse_der_signature(der: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let [0x30, body_len, body @ ..] = der else {
        return Err(Error::InvalidSignature("missing DER sequence".to_string()));
    };
    if usize::from(*body_len) != body.len() {
        return Err(Error::InvalidSignature("DER length mismatch".to_string()));
    }

    let (r, rest) = der_integer(body)?;
    let (s, rest) = der_integer(rest)?;
    if !rest.is_empty() {
        return Err(Error::InvalidSignature("trailing DER bytes".to_string()));
    }

    Ok((r, s))
}

/// Reads one `02 len value` integer, returning it right-aligned in 32 bytes.
fn der_integer(input: &[u8]) -> Result<([u8; 32], &[u8])> {
    let [0x02, len, rest @ ..] = input else {
        return Err(Error::InvalidSignature("missing DER integer".to_string()));
    };
    let len = usize::from(*len);
    if len == 0 || len > rest.len() {
        return Err(Error::InvalidSignature("DER integer overflows".to_string()));
    }

    let (value, rest) = rest.split_at(len);
    let value = match value {
        [0x00, tail @ ..] if !tail.is_empty() => tail,
        v => v,
    };
    if value.len() > 32 {
        return Err(Error::InvalidSignature("integer too large".to_string()));
    }

    let mut out = [0u8; 32];
    out[32 - value.len()..].copy_from_slice(value);
    Ok((out, rest))
}

/// Moves S into the lower half of the curve order.
///
/// Returns `(s, flipped)`.
#[must_use]
pub fn normalize_s(s: [u8; 32]) -> ([u8; 32], bool) {
    if s.cmp(&HALF_N) == Ordering::Greater {
        (sub_be(&N, &s), true)
    } else {
        (s, false)
    }
}

/// `a - b` over 32-byte big-endian integers, `a >= b`.
fn sub_be(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut diff = i16::from(a[i]) - i16::from(b[i]) - borrow;
        borrow = i16::from(diff < 0);
        if diff < 0 {
            diff += 256;
        }
        out[i] = diff as u8;
    }
    out
}

/// Builds the Ethereum signature of `digest` from the card's DER output.
///
/// S is normalized to low-S, the result is verified against `public_key`,
/// and `v` records whether S was negated.
///
/// # Errors
///
/// Returns [`Error::InvalidSignature`] if the DER is malformed or the
/// signature does not verify.
pub fn ethereum_signature(
    der: &[u8],
    digest: &[u8; 32],
    public_key: &VerifyingKey,
) -> Result<Signature> {
    let (r, s) = parse_der_signature(der)?;
    let (s, flipped) = normalize_s(s);

    let signature = Signature::new(r, s, u8::from(flipped));
    if !verify_prehash(digest, &signature, public_key) {
        return Err(Error::InvalidSignature(
            "signature does not verify against the slot key".to_string(),
        ));
    }

    Ok(signature)
}

/// Verifies `signature` over a prehashed `digest`.
#[must_use]
pub fn verify_prehash(digest: &[u8; 32], signature: &Signature, public_key: &VerifyingKey) -> bool {
    P256Signature::from_scalars(
        FieldBytes::from(*signature.r()),
        FieldBytes::from(*signature.s()),
    )
    .is_ok_and(|sig| public_key.verify_prehash(digest, &sig).is_ok())
}

//! Ethereum addresses of secp256r1 keys.
//!
//! The address of a P-256 key is computed exactly like a secp256k1 one:
//! `keccak256(x || y)[12..]` over the uncompressed point without its `0x04`
//! prefix.

use alloy_primitives::{Address, keccak256};
use p256::ecdsa::VerifyingKey;

use crate::error::{Error, Result};

/// Derives the Ethereum address of a P-256 public key.
#[must_use]
pub fn address_of(public_key: &VerifyingKey) -> Address {
    let encoded = public_key.to_encoded_point(false);
    address_of_point(&encoded.as_bytes()[1..])
}

/// Derives an address from raw public key bytes, either 64 (`x || y`) or
/// 65 (`0x04 || x || y`) bytes long.
///
/// # Errors
///
/// Returns [`Error::InvalidPublicKey`] for any other length or prefix.
pub fn address_from_public_key_bytes(bytes: &[u8]) -> Result<Address> {
    match bytes {
        [0x04, point @ ..] if point.len() == 64 => Ok(address_of_point(point)),
        point if point.len() == 64 => Ok(address_of_point(point)),
        [prefix, ..] if bytes.len() == 65 => Err(Error::InvalidPublicKey(format!(
            "65-byte public key must start with 0x04, got {prefix:#04x}"
        ))),
        _ => Err(Error::InvalidPublicKey(format!(
            "expected 64 or 65 bytes, got {}",
            bytes.len()
        ))),
    }
}

fn address_of_point(xy: &[u8]) -> Address {
    Address::from_slice(&keccak256(xy)[12..])
}

//! Unsigned Ethereum transactions: decoding, signing hash, signed encoding.
//!
//! Two payloads are accepted, both hex-encoded RLP:
//!
//! - **EIP-155 legacy**: `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`
//! - **EIP-1559**: `0x02 || rlp([chainId, nonce, maxPriorityFeePerGas,
//!   maxFeePerGas, gas, to, value, data, accessList])`
//!
//! The unsigned payload is exactly the preimage of the signing hash, so
//! [`Transaction::signing_hash`] is `keccak256` of what was decoded.
//!
//! # Example
//!
//! ```
//! use yubikey_device_kit::Transaction;
//!
//! let tx = Transaction::from_hex(
//!     "0xec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080",
//! )
//! .unwrap();
//! assert_eq!(tx.chain_id(), 1);
//! ```

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rlp::{Decodable, Encodable, Header, RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signature::Signature;

/// An access list entry of an EIP-1559 transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
#[serde(rename_all = "camelCase")]
pub struct AccessListEntry {
    /// The address being accessed.
    pub address: Address,

    /// The storage keys being accessed at this address.
    pub storage_keys: Vec<B256>,
}

/// An EIP-155 legacy transaction.
///
/// See [EIP-155].
///
/// [EIP-155]: https://eips.ethereum.org/EIPS/eip-155
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTransaction {
    /// The chain ID for replay protection.
    pub chain_id: u64,

    /// The transaction nonce.
    pub nonce: u64,

    /// The gas price in wei.
    pub gas_price: U256,

    /// The gas limit.
    pub gas_limit: u64,

    /// The recipient address, or `None` for contract creation.
    pub to: Option<Address>,

    /// The value to transfer in wei.
    pub value: U256,

    /// The transaction input data.
    pub data: Bytes,
}

impl LegacyTransaction {
    /// Encodes the EIP-155 signing payload
    /// `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`.
    #[must_use]
    pub fn encode_unsigned(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        encode_rlp_list(&mut buf, |buf| {
            self.encode_common_fields(buf);
            self.chain_id.encode(buf);
            0u8.encode(buf);
            0u8.encode(buf);
        });
        buf
    }

    /// Decodes an EIP-155 signing payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransaction`] if the payload is not a nine
    /// field list ending in `chainId, 0, 0`.
    pub fn decode_unsigned(bytes: &[u8]) -> Result<Self> {
        let mut fields = list_payload(bytes)?;

        let nonce = u64::decode(&mut fields)?;
        let gas_price = U256::decode(&mut fields)?;
        let gas_limit = u64::decode(&mut fields)?;
        let to = decode_to(&mut fields)?;
        let value = U256::decode(&mut fields)?;
        let data = Bytes::decode(&mut fields)?;

        if fields.is_empty() {
            return Err(Error::InvalidTransaction(
                "legacy transaction without EIP-155 chain id".to_string(),
            ));
        }
        let chain_id = u64::decode(&mut fields)?;
        let (r, s) = (u64::decode(&mut fields)?, u64::decode(&mut fields)?);
        if r != 0 || s != 0 {
            return Err(Error::InvalidTransaction(
                "legacy payload is already signed".to_string(),
            ));
        }
        ensure_consumed(fields)?;

        Ok(Self {
            chain_id,
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
        })
    }

    /// `keccak256` of the EIP-155 signing payload.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.encode_unsigned())
    }

    /// Encodes the signed transaction `rlp([..., v, r, s])` with
    /// `v = chainId * 2 + 35 + parity`.
    #[must_use]
    pub fn signed_rlp(&self, signature: &Signature) -> Vec<u8> {
        let v = self.chain_id * 2 + 35 + u64::from(signature.v());

        let mut buf = Vec::with_capacity(192);
        encode_rlp_list(&mut buf, |buf| {
            self.encode_common_fields(buf);
            v.encode(buf);
            signature.r_u256().encode(buf);
            signature.s_u256().encode(buf);
        });
        buf
    }

    fn encode_common_fields(&self, buf: &mut Vec<u8>) {
        self.nonce.encode(buf);
        self.gas_price.encode(buf);
        self.gas_limit.encode(buf);
        encode_to(self.to.as_ref(), buf);
        self.value.encode(buf);
        self.data.encode(buf);
    }
}

/// An EIP-1559 (type 2) transaction.
///
/// [EIP-1559]: https://eips.ethereum.org/EIPS/eip-1559
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip1559Transaction {
    /// The chain ID.
    pub chain_id: u64,

    /// The transaction nonce.
    pub nonce: u64,

    /// The maximum priority fee per gas (tip).
    pub max_priority_fee_per_gas: U256,

    /// The maximum total fee per gas.
    pub max_fee_per_gas: U256,

    /// The gas limit.
    pub gas_limit: u64,

    /// The recipient address, or `None` for contract creation.
    pub to: Option<Address>,

    /// The value to transfer in wei.
    pub value: U256,

    /// The transaction input data.
    pub data: Bytes,

    /// The access list.
    pub access_list: Vec<AccessListEntry>,
}

impl Eip1559Transaction {
    /// The transaction type identifier for EIP-1559.
    pub const TX_TYPE: u8 = 0x02;

    /// Encodes the signing payload `0x02 || rlp([...])`.
    #[must_use]
    pub fn encode_unsigned(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.push(Self::TX_TYPE);
        encode_rlp_list(&mut buf, |buf| self.encode_fields(buf));
        buf
    }

    /// Decodes the RLP list that follows the `0x02` type byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransaction`] on malformed or trailing fields.
    pub fn decode_unsigned(bytes: &[u8]) -> Result<Self> {
        let mut fields = list_payload(bytes)?;

        let tx = Self {
            chain_id: u64::decode(&mut fields)?,
            nonce: u64::decode(&mut fields)?,
            max_priority_fee_per_gas: U256::decode(&mut fields)?,
            max_fee_per_gas: U256::decode(&mut fields)?,
            gas_limit: u64::decode(&mut fields)?,
            to: decode_to(&mut fields)?,
            value: U256::decode(&mut fields)?,
            data: Bytes::decode(&mut fields)?,
            access_list: Vec::<AccessListEntry>::decode(&mut fields)?,
        };
        ensure_consumed(fields)?;

        Ok(tx)
    }

    /// `keccak256` of the signing payload.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.encode_unsigned())
    }

    /// Encodes the signed envelope `0x02 || rlp([..., yParity, r, s])`.
    #[must_use]
    pub fn signed_rlp(&self, signature: &Signature) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.push(Self::TX_TYPE);
        encode_rlp_list(&mut buf, |buf| {
            self.encode_fields(buf);
            signature.v().encode(buf);
            signature.r_u256().encode(buf);
            signature.s_u256().encode(buf);
        });
        buf
    }

    fn encode_fields(&self, buf: &mut Vec<u8>) {
        self.chain_id.encode(buf);
        self.nonce.encode(buf);
        self.max_priority_fee_per_gas.encode(buf);
        self.max_fee_per_gas.encode(buf);
        self.gas_limit.encode(buf);
        encode_to(self.to.as_ref(), buf);
        self.value.encode(buf);
        self.data.encode(buf);
        self.access_list.encode(buf);
    }
}

/// A transaction in one of the supported formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transaction {
    /// EIP-155 legacy transaction.
    #[serde(rename = "legacy")]
    Legacy(LegacyTransaction),
    /// EIP-1559 (type 2) transaction.
    #[serde(rename = "eip1559")]
    Eip1559(Eip1559Transaction),
}

impl Transaction {
    /// Decodes a hex-encoded unsigned payload, with or without `0x`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransaction`] if the payload is empty, not
    /// hex, or not a supported unsigned transaction.
    pub fn from_hex(payload: &str) -> Result<Self> {
        let payload = payload.trim();
        let hex_str = payload.strip_prefix("0x").unwrap_or(payload);
        if hex_str.is_empty() {
            return Err(Error::InvalidTransaction("empty payload".to_string()));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidTransaction(format!("payload is not hex: {e}")))?;
        Self::decode_unsigned(&bytes)
    }

    /// Decodes an unsigned payload, dispatching on its first byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransaction`] for unknown types and malformed
    /// payloads.
    pub fn decode_unsigned(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [] => Err(Error::InvalidTransaction("empty payload".to_string())),
            [Eip1559Transaction::TX_TYPE, rest @ ..] => {
                Eip1559Transaction::decode_unsigned(rest).map(Self::Eip1559)
            }
            [first, ..] if *first >= alloy_rlp::EMPTY_LIST_CODE => {
                LegacyTransaction::decode_unsigned(bytes).map(Self::Legacy)
            }
            [first, ..] => Err(Error::InvalidTransaction(format!(
                "unsupported transaction type {first:#04x}"
            ))),
        }
    }

    /// The signing payload this transaction was decoded from.
    #[must_use]
    pub fn encode_unsigned(&self) -> Vec<u8> {
        match self {
            Self::Legacy(tx) => tx.encode_unsigned(),
            Self::Eip1559(tx) => tx.encode_unsigned(),
        }
    }

    /// Returns the hash the device signs.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        match self {
            Self::Legacy(tx) => tx.signing_hash(),
            Self::Eip1559(tx) => tx.signing_hash(),
        }
    }

    /// Returns the chain ID.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.chain_id,
            Self::Eip1559(tx) => tx.chain_id,
        }
    }

    /// Encodes the signed transaction, ready for `eth_sendRawTransaction`.
    #[must_use]
    pub fn signed_rlp(&self, signature: &Signature) -> Vec<u8> {
        match self {
            Self::Legacy(tx) => tx.signed_rlp(signature),
            Self::Eip1559(tx) => tx.signed_rlp(signature),
        }
    }
}

/// Writes a list header followed by whatever `f` encodes.
fn encode_rlp_list<F>(out: &mut Vec<u8>, f: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut content = Vec::new();
    f(&mut content);

    Header {
        list: true,
        payload_length: content.len(),
    }
    .encode(out);
    out.extend_from_slice(&content);
}

/// Returns the payload of the single RLP list that makes up `bytes`.
fn list_payload(bytes: &[u8]) -> Result<&[u8]> {
    let mut buf = bytes;
    let header = Header::decode(&mut buf)?;
    if !header.list {
        return Err(Error::InvalidTransaction("expected an RLP list".to_string()));
    }
    if buf.len() != header.payload_length {
        return Err(Error::InvalidTransaction(format!(
            "list length {} does not match payload length {}",
            header.payload_length,
            buf.len()
        )));
    }
    Ok(buf)
}

fn ensure_consumed(fields: &[u8]) -> Result<()> {
    if fields.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidTransaction(format!(
            "{} unexpected trailing bytes",
            fields.len()
        )))
    }
}

/// `to` is either 20 bytes or the empty string for contract creation.
fn decode_to(buf: &mut &[u8]) -> Result<Option<Address>> {
    let to = Bytes::decode(buf)?;
    match to.len() {
        0 => Ok(None),
        20 => Ok(Some(Address::from_slice(&to))),
        n => Err(Error::InvalidTransaction(format!(
            "recipient must be 20 bytes, got {n}"
        ))),
    }
}

fn encode_to(to: Option<&Address>, out: &mut Vec<u8>) {
    match to {
        Some(address) => address.encode(out),
        None => out.push(alloy_rlp::EMPTY_STRING_CODE),
    }
}

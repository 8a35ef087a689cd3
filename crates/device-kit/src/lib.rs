//! YubiKey device kit.
//!
//! Discovers YubiKeys over PC/SC, opens sessions on them and runs keyed
//! Ethereum actions (get-address, sign-transaction) with the PIV applet's
//! secp256r1 keys. With [EIP-7951] Ethereum verifies P-256 signatures
//! natively, so no curve conversion is involved.
//!
//! # Overview
//!
//! - [`DeviceDirectory`]: discovery feed, connect, disconnect
//! - [`SessionStateProvider`]: per-session status stream
//! - [`KeyedActionRunner`]: keyed actions as streams of
//!   [`DeviceActionState`]
//! - [`DeviceKit`]: all three over a [`yubikey::CardConnector`]
//! - [`EthKeyring`]: the keyed actions bound to one session
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        DeviceDirectory / SessionStateProvider / Runner       │
//! ├─────────────────────────────────────────────────────────────┤
//! │   DeviceKit: sessions, watch channels, blocking card tasks   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transaction  │     Path     │   Address    │   Signature   │
//! │   decoding    │  → PIV slot  │  derivation  │  DER → r,s,v  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    YubiKey PIV Layer                         │
//! │      APDU encode │ PIV session │ Slots │ CardConnector       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        PC/SC (pcsc)                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Derivation paths
//!
//! PIV keys are not hierarchical. A path such as `44'/60'/0'/0` is
//! validated and its last, unhardened component picks a slot: `0` → 9a,
//! `1` → 9c, `2` → 9d, `3` → 9e.
//!
//! # Feature Flags
//!
//! - `pcsc` (default): the PC/SC [`yubikey::CardConnector`]. Without it the
//!   kit only runs over connectors you provide.
//!
//! # Security Considerations
//!
//! - Private keys never leave the YubiKey
//! - Slots 9a, 9c and 9d need the PIN before signing, 9e does not
//! - Signatures are normalized to low-S and verified against the slot key
//!
//! [EIP-7951]: https://eips.ethereum.org/EIPS/eip-7951

pub mod action;
pub mod address;
pub mod crypto;
pub mod error;
pub mod keyring;
pub mod kit;
pub mod path;
pub mod session;
pub mod signature;
pub mod transaction;
pub mod yubikey;

pub use action::{
    ActionError, ActionState, ActionStep, ActionStream, DeviceActionState, ErrorCode,
};
pub use error::{Error, Result};
pub use keyring::EthKeyring;
pub use kit::{
    DeviceDirectory, DeviceKit, GetAddressOutput, GetAddressRequest, KeyedActionRunner,
    KitOptions, SessionStateProvider, SignTransactionOutput, SignTransactionRequest,
};
pub use path::DerivationPath;
pub use session::{DeviceId, DeviceSessionId, DeviceSessionState, DeviceStatus, DiscoveredDevice};
pub use signature::Signature;
pub use transaction::{AccessListEntry, Eip1559Transaction, LegacyTransaction, Transaction};

pub use alloy_primitives::{Address, B256, Bytes, U256};

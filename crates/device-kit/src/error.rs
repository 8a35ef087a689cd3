//! Error types for the YubiKey device kit.
//!
//! [`enum@Error`] covers every failure a collaborator can report: discovery and
//! connection problems, session bookkeeping, PIV status words, and the
//! decoding of the inputs handed to a keyed action.
//!
//! # Example
//!
//! ```
//! use yubikey_device_kit::Error;
//!
//! let err = Error::SlotEmpty(0x9a);
//! assert_eq!(err.to_string(), "PIV slot 0x9a is empty");
//! ```

use core::result::Result as CoreResult;
use std::time::Duration;

use alloy_rlp::Error as AlloyRlpError;
use hex::FromHexError;
use thiserror::Error;

/// The main error type for the device kit.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Discovery and connection
    // =========================================================================
    /// No YubiKey reader is present.
    #[error("no YubiKey device found")]
    DeviceNotFound,

    /// Discovery gave up before a device appeared.
    #[error("no YubiKey device discovered within {0:?}")]
    DiscoveryTimeout(Duration),

    /// The smart card subsystem or the card itself refused the connection.
    #[error("failed to connect to YubiKey: {0}")]
    ConnectionFailed(String),

    /// The card went away while a session was open.
    #[error("YubiKey device disconnected")]
    DeviceDisconnected,

    // =========================================================================
    // Sessions
    // =========================================================================
    /// No open session carries this identifier.
    #[error("unknown device session {0}")]
    UnknownSession(String),

    /// Another action is already exchanging APDUs on this session.
    #[error("device session {0} is busy")]
    SessionBusy(String),

    // =========================================================================
    // PIV status
    // =========================================================================
    /// The PIN was rejected; carries the remaining attempts when the card
    /// reports them.
    #[error("invalid PIN")]
    InvalidPin(Option<u8>),

    /// The PIN is blocked after too many failed attempts.
    #[error("PIN is locked after too many failed attempts")]
    PinLocked,

    /// The card refused the operation (missing touch or security status).
    #[error("operation denied by the device")]
    Denied,

    /// The requested PIV slot holds no key or certificate.
    #[error("PIV slot {0:#04x} is empty")]
    SlotEmpty(u8),

    /// The key in the slot is not a P-256 key.
    #[error("key in slot {0:#04x} is not a P-256 key")]
    InvalidKeyType(u8),

    // =========================================================================
    // APDU exchange
    // =========================================================================
    /// Sending the command failed at the transport level.
    #[error("APDU command failed: {0}")]
    ApduError(String),

    /// The card answered with a status word we have no mapping for.
    #[error("unexpected status word: SW1={0:#04x}, SW2={1:#04x}")]
    UnexpectedStatusWord(u8, u8),

    /// The card answered with bytes we could not parse.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // =========================================================================
    // Action inputs and outputs
    // =========================================================================
    /// The derivation path does not parse or maps to no slot.
    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// The transaction payload is not a supported unsigned transaction.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The public key read from the card is malformed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The signature returned by the card is malformed or does not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A hex payload could not be decoded.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// The blocking task driving the card panicked or was cancelled.
    #[error("device task failed: {0}")]
    TaskFailed(String),
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::HexDecodeFailed(err.to_string())
    }
}

impl From<AlloyRlpError> for Error {
    fn from(err: AlloyRlpError) -> Self {
        Error::InvalidTransaction(err.to_string())
    }
}

/// A specialized [`Result`] type for device kit operations.
pub type Result<T> = CoreResult<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(Error::DeviceNotFound.to_string(), "no YubiKey device found");
        assert_eq!(
            Error::UnexpectedStatusWord(0x6d, 0x00).to_string(),
            "unexpected status word: SW1=0x6d, SW2=0x00"
        );
        assert_eq!(
            Error::DiscoveryTimeout(Duration::from_secs(2)).to_string(),
            "no YubiKey device discovered within 2s"
        );
    }

    #[test]
    fn from_hex_error() {
        let hex_err = FromHexError::InvalidHexCharacter { c: 'z', index: 3 };
        let err: Error = hex_err.into();
        assert!(matches!(err, Error::HexDecodeFailed(_)));
    }

    #[test]
    fn from_rlp_error() {
        let err: Error = AlloyRlpError::InputTooShort.into();
        assert!(matches!(err, Error::InvalidTransaction(_)));
    }
}

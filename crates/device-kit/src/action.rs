//! Progressive results of keyed device actions.
//!
//! A keyed action is observed as a stream of [`DeviceActionState`]s: zero or
//! more `Pending` updates followed by exactly one terminal `Completed` or
//! `Error`, after which the stream ends.

use core::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One emission of an action stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum DeviceActionState<O, E, I> {
    /// Still running; carries the current step.
    Pending(I),
    /// Finished with an output.
    Completed(O),
    /// Finished with an error.
    Error(E),
}

impl<O, E, I> DeviceActionState<O, E, I> {
    /// Whether this is the last emission of its stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending(_))
    }

    /// The output, if completed.
    #[must_use]
    pub const fn output(&self) -> Option<&O> {
        match self {
            Self::Completed(output) => Some(output),
            _ => None,
        }
    }

    /// The error, if failed.
    #[must_use]
    pub const fn error(&self) -> Option<&E> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// What the device is doing while an action is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionStep {
    /// Talking to the card.
    Processing,
    /// Verifying the PIN.
    VerifyPin,
    /// Waiting for the signature, which may need a touch.
    ConfirmOnDevice,
}

/// Machine-readable classification of an [`ActionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Denied,
    InvalidPin,
    PinLocked,
    SlotEmpty,
    InvalidDerivationPath,
    InvalidTransaction,
    DeviceDisconnected,
    UnknownSession,
    SessionBusy,
    Communication,
    Unknown,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Denied => Self::Denied,
            Error::InvalidPin(_) => Self::InvalidPin,
            Error::PinLocked => Self::PinLocked,
            Error::SlotEmpty(_) => Self::SlotEmpty,
            Error::InvalidDerivationPath(_) => Self::InvalidDerivationPath,
            Error::InvalidTransaction(_) | Error::HexDecodeFailed(_) => Self::InvalidTransaction,
            Error::DeviceDisconnected | Error::DeviceNotFound => Self::DeviceDisconnected,
            Error::UnknownSession(_) => Self::UnknownSession,
            Error::SessionBusy(_) => Self::SessionBusy,
            Error::ConnectionFailed(_)
            | Error::ApduError(_)
            | Error::UnexpectedStatusWord(..)
            | Error::MalformedResponse(_) => Self::Communication,
            _ => Self::Unknown,
        }
    }
}

/// The terminal error of a keyed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    /// Classification.
    pub code: ErrorCode,
    /// Human readable description.
    pub message: String,
}

impl ActionError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<Error> for ActionError {
    fn from(err: Error) -> Self {
        Self::new(ErrorCode::from(&err), err.to_string())
    }
}

/// The emission type of every keyed action in this crate.
pub type ActionState<O> = DeviceActionState<O, ActionError, ActionStep>;

/// A boxed stream of [`ActionState`]s.
pub type ActionStream<O> = BoxStream<'static, ActionState<O>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let pending: ActionState<u8> = DeviceActionState::Pending(ActionStep::Processing);
        let done: ActionState<u8> = DeviceActionState::Completed(7);
        let failed: ActionState<u8> =
            DeviceActionState::Error(ActionError::new(ErrorCode::Denied, "no"));

        assert!(!pending.is_terminal());
        assert!(done.is_terminal());
        assert!(failed.is_terminal());
        assert_eq!(done.output(), Some(&7));
        assert_eq!(failed.error().map(|e| e.code), Some(ErrorCode::Denied));
        assert!(pending.output().is_none() && pending.error().is_none());
    }

    #[test]
    fn error_codes_from_kit_errors() {
        let cases = [
            (Error::Denied, ErrorCode::Denied),
            (Error::InvalidPin(Some(2)), ErrorCode::InvalidPin),
            (Error::PinLocked, ErrorCode::PinLocked),
            (Error::SlotEmpty(0x9a), ErrorCode::SlotEmpty),
            (
                Error::InvalidDerivationPath("x".into()),
                ErrorCode::InvalidDerivationPath,
            ),
            (
                Error::InvalidTransaction("x".into()),
                ErrorCode::InvalidTransaction,
            ),
            (Error::DeviceDisconnected, ErrorCode::DeviceDisconnected),
            (Error::UnknownSession("s".into()), ErrorCode::UnknownSession),
            (Error::SessionBusy("s".into()), ErrorCode::SessionBusy),
            (Error::UnexpectedStatusWord(0x6d, 0), ErrorCode::Communication),
            (Error::TaskFailed("panic".into()), ErrorCode::Unknown),
        ];
        for (err, code) in cases {
            assert_eq!(ErrorCode::from(&err), code, "{err}");
        }
    }

    #[test]
    fn action_error_keeps_message() {
        let err = ActionError::from(Error::SlotEmpty(0x9c));
        assert_eq!(err.code, ErrorCode::SlotEmpty);
        assert_eq!(err.message, "PIV slot 0x9c is empty");
    }

    #[test]
    fn serialized_shape() {
        let state: ActionState<u8> =
            DeviceActionState::Error(ActionError::new(ErrorCode::PinLocked, "locked"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["value"]["code"], "PIN_LOCKED");

        let pending: ActionState<u8> = DeviceActionState::Pending(ActionStep::ConfirmOnDevice);
        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["value"], "confirmOnDevice");
    }
}

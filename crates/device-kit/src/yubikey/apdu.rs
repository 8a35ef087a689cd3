//! ISO 7816-4 command and response units.
//!
//! Only short APDUs are produced: every command the kit sends (applet
//! selection, PIN verification, certificate reads and 32-byte digest
//! signing) fits in 255 data bytes. Long answers arrive as `61xx` chains and
//! are reassembled by [`PivSession`](super::PivSession) with
//! [`Apdu::get_response`].
//!
//! ```text
//! | CLA | INS | P1 | P2 | Lc | Data | Le |
//! | Data ... | SW1 | SW2 |
//! ```

use crate::error::{Error, Result};

/// `GET RESPONSE` instruction.
const INS_GET_RESPONSE: u8 = 0xC0;

/// An APDU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    /// Expected response length; `None` omits the Le byte.
    le: Option<u16>,
}

impl Apdu {
    /// Maximum short APDU data length.
    pub const MAX_SHORT_DATA: usize = 255;

    /// Creates a command without an Le byte.
    #[must_use]
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le: None,
        }
    }

    /// Creates a command that expects up to `le` response bytes (`256` is
    /// encoded as `0x00`).
    #[must_use]
    pub const fn with_le(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, le: u16) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le: Some(le),
        }
    }

    /// Builds the `GET RESPONSE` command that fetches the next `61xx` chunk.
    #[must_use]
    pub const fn get_response(remaining: u8) -> Self {
        let le = if remaining == 0 { 256 } else { remaining as u16 };
        Self::with_le(0x00, INS_GET_RESPONSE, 0x00, 0x00, Vec::new(), le)
    }

    /// Returns the instruction byte.
    #[must_use]
    pub const fn ins(&self) -> u8 {
        self.ins
    }

    /// Returns the second parameter byte (the key reference for PIV).
    #[must_use]
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Returns the command data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the command in short form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ApduError`] if the data or Le do not fit a short APDU.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_SHORT_DATA {
            return Err(Error::ApduError(format!(
                "command data of {} bytes does not fit a short APDU",
                self.data.len()
            )));
        }

        let mut bytes = Vec::with_capacity(6 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if !self.data.is_empty() {
            bytes.push(self.data.len() as u8);
            bytes.extend_from_slice(&self.data);
        }

        match self.le {
            None => {}
            Some(256) => bytes.push(0x00),
            Some(le @ 1..=255) => bytes.push(le as u8),
            Some(le) => {
                return Err(Error::ApduError(format!("Le {le} does not fit a short APDU")));
            }
        }

        Ok(bytes)
    }
}

/// A response from the card: payload plus status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    data: Vec<u8>,
    sw1: u8,
    sw2: u8,
}

impl ApduResponse {
    /// Success status word.
    pub const SW_SUCCESS: u16 = 0x9000;

    /// Splits raw response bytes into payload and status word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] when fewer than two bytes arrive.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some((data, status)) = bytes.split_last_chunk::<2>() else {
            return Err(Error::MalformedResponse(format!(
                "response of {} bytes has no status word",
                bytes.len()
            )));
        };

        Ok(Self {
            data: data.to_vec(),
            sw1: status[0],
            sw2: status[1],
        })
    }

    /// Builds a response from a payload and status word.
    #[must_use]
    pub fn new(data: Vec<u8>, status_word: u16) -> Self {
        let [sw1, sw2] = status_word.to_be_bytes();
        Self { data, sw1, sw2 }
    }

    /// Returns the response data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the response and returns the data.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns the status word as a [`u16`].
    #[must_use]
    pub const fn status_word(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// `true` for `9000`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status_word() == Self::SW_SUCCESS
    }

    /// Remaining byte count of a `61xx` chain (`0` means 256 or more).
    #[must_use]
    pub const fn remaining_bytes(&self) -> Option<u8> {
        if self.sw1 == 0x61 {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// Accepts `9000` and `61xx`, maps everything else to an [`Error`].
    ///
    /// # Errors
    ///
    /// See [`ApduResponse::to_error`].
    pub const fn check(&self) -> Result<()> {
        if self.is_success() || self.remaining_bytes().is_some() {
            Ok(())
        } else {
            Err(self.to_error())
        }
    }

    /// Converts the status word to the matching [`Error`].
    #[must_use]
    pub const fn to_error(&self) -> Error {
        match (self.sw1, self.sw2) {
            (0x63, 0xC0) | (0x69, 0x83) => Error::PinLocked,
            (0x63, 0xC1..=0xCF) => Error::InvalidPin(Some(self.sw2 & 0x0F)),
            (0x69, 0x82) | (0x69, 0x85) => Error::Denied,
            (0x6A, 0x82) => Error::SlotEmpty(0),
            _ => Error::UnexpectedStatusWord(self.sw1, self.sw2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apdu_to_bytes_short() {
        let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00, vec![0xA0, 0x00]);
        assert_eq!(
            apdu.to_bytes().unwrap(),
            vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0xA0, 0x00]
        );
    }

    #[test]
    fn apdu_le_256_encodes_as_zero() {
        let apdu = Apdu::with_le(0x00, 0xCB, 0x3F, 0xFF, vec![0x5C], 256);
        assert_eq!(
            apdu.to_bytes().unwrap(),
            vec![0x00, 0xCB, 0x3F, 0xFF, 0x01, 0x5C, 0x00]
        );
    }

    #[test]
    fn apdu_rejects_oversized_data() {
        let apdu = Apdu::new(0x00, 0xDB, 0x3F, 0xFF, vec![0u8; 300]);
        assert!(matches!(apdu.to_bytes(), Err(Error::ApduError(_))));
    }

    #[test]
    fn get_response_requests_remaining() {
        assert_eq!(
            Apdu::get_response(0x10).to_bytes().unwrap(),
            vec![0x00, 0xC0, 0x00, 0x00, 0x10]
        );
        assert_eq!(
            Apdu::get_response(0x00).to_bytes().unwrap(),
            vec![0x00, 0xC0, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn response_from_bytes() {
        let response = ApduResponse::from_bytes(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(response.data(), &[0x01, 0x02]);
        assert!(response.is_success());

        assert!(ApduResponse::from_bytes(&[0x90]).is_err());
    }

    #[test]
    fn response_more_data_is_not_an_error() {
        let response = ApduResponse::new(vec![0xAA], 0x6120);
        assert_eq!(response.remaining_bytes(), Some(0x20));
        assert!(response.check().is_ok());
    }

    #[test]
    fn status_words_map_to_errors() {
        assert!(matches!(
            ApduResponse::new(vec![], 0x63C2).to_error(),
            Error::InvalidPin(Some(2))
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x63C0).to_error(),
            Error::PinLocked
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x6985).to_error(),
            Error::Denied
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x6A82).to_error(),
            Error::SlotEmpty(_)
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x6D00).to_error(),
            Error::UnexpectedStatusWord(0x6D, 0x00)
        ));
    }
}

//! PIV applet operations.
//!
//! The keyed actions need four of them: select the applet, verify the PIN,
//! read the certificate of a slot to learn its public key, and run
//! `GENERAL AUTHENTICATE` over a 32-byte digest.

use std::fmt;

use p256::EncodedPoint;
use p256::ecdsa::VerifyingKey;
use tracing::trace;

use super::Transport;
use super::apdu::Apdu;
use super::slot::Slot;
use crate::error::{Error, Result};

/// The PIV applet AID.
const PIV_AID: [u8; 9] = [0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00];

/// PIV instruction codes.
mod ins {
    pub(super) const SELECT: u8 = 0xA4;
    pub(super) const VERIFY: u8 = 0x20;
    pub(super) const AUTHENTICATE: u8 = 0x87;
    pub(super) const GET_DATA: u8 = 0xCB;
}

/// Algorithm reference for ECC P-256.
const ALG_ECCP256: u8 = 0x11;

/// PIN key reference.
const PIN_REFERENCE: u8 = 0x80;

/// PIV PINs are 6 to 8 bytes, padded with `0xFF`.
const PIN_MAX_LEN: usize = 8;
const PIN_MIN_LEN: usize = 6;

/// A PIV session over one opened card.
pub struct PivSession {
    transport: Box<dyn Transport>,
    selected: bool,
    pin_verified: bool,
}

impl fmt::Debug for PivSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PivSession")
            .field("selected", &self.selected)
            .field("pin_verified", &self.pin_verified)
            .finish_non_exhaustive()
    }
}

impl PivSession {
    /// Wraps a transport; call [`select`](Self::select) before anything else.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            selected: false,
            pin_verified: false,
        }
    }

    /// Selects the PIV applet. Resets the PIN state.
    ///
    /// # Errors
    ///
    /// Returns an error if the card is unreachable or has no PIV applet.
    pub fn select(&mut self) -> Result<()> {
        let apdu = Apdu::new(0x00, ins::SELECT, 0x04, 0x00, PIV_AID.to_vec());
        self.exchange(&apdu)?;

        self.selected = true;
        self.pin_verified = false;
        Ok(())
    }

    /// Verifies the PIN.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPin`] if the PIN is rejected or malformed
    /// - [`Error::PinLocked`] if the PIN is blocked
    pub fn verify_pin(&mut self, pin: &str) -> Result<()> {
        self.ensure_selected()?;

        let pin_bytes = pin.as_bytes();
        if !(PIN_MIN_LEN..=PIN_MAX_LEN).contains(&pin_bytes.len()) {
            return Err(Error::InvalidPin(None));
        }

        let mut padded_pin = [0xFF; PIN_MAX_LEN];
        padded_pin[..pin_bytes.len()].copy_from_slice(pin_bytes);

        let apdu = Apdu::new(0x00, ins::VERIFY, 0x00, PIN_REFERENCE, padded_pin.to_vec());
        self.exchange(&apdu)?;

        self.pin_verified = true;
        Ok(())
    }

    /// Reads the public key of `slot` from its certificate.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotEmpty`] if the slot has no certificate
    /// - [`Error::InvalidKeyType`] if the certificate holds no P-256 key
    pub fn public_key(&mut self, slot: Slot) -> Result<VerifyingKey> {
        self.ensure_selected()?;

        let object_id = slot.object_id();
        let data = vec![0x5C, 0x03, object_id[0], object_id[1], object_id[2]];
        let apdu = Apdu::with_le(0x00, ins::GET_DATA, 0x3F, 0xFF, data, 256);

        let certificate = match self.exchange(&apdu) {
            Ok(data) => data,
            Err(Error::SlotEmpty(_)) => return Err(Error::SlotEmpty(slot.id())),
            Err(e) => return Err(e),
        };

        if certificate.is_empty() {
            return Err(Error::SlotEmpty(slot.id()));
        }

        find_p256_point(&certificate).ok_or(Error::InvalidKeyType(slot.id()))
    }

    /// Signs a 32-byte digest with the key in `slot`, returning the DER
    /// signature.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPin`] if the slot needs a PIN that was not verified
    /// - [`Error::Denied`] if the card wants a touch that never came
    pub fn sign_digest(&mut self, slot: Slot, digest: &[u8; 32]) -> Result<Vec<u8>> {
        self.ensure_selected()?;

        if slot.requires_pin() && !self.pin_verified {
            return Err(Error::InvalidPin(None));
        }

        // 7C len { 82 00 (response placeholder), 81 len digest }
        let mut template = Vec::with_capacity(6 + digest.len());
        template.extend_from_slice(&[0x7C, (4 + digest.len()) as u8, 0x82, 0x00, 0x81]);
        template.push(digest.len() as u8);
        template.extend_from_slice(digest);

        let apdu = Apdu::with_le(0x00, ins::AUTHENTICATE, ALG_ECCP256, slot.id(), template, 256);
        let response = self.exchange(&apdu)?;

        dynamic_template_value(&response, 0x82)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::InvalidSignature("no signature in response".to_string()))
    }

    /// Whether the underlying card is still reachable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn ensure_selected(&self) -> Result<()> {
        if self.selected {
            Ok(())
        } else {
            Err(Error::ApduError("PIV applet not selected".to_string()))
        }
    }

    /// Sends `apdu`, follows `61xx` chains and returns the joined payload.
    fn exchange(&mut self, apdu: &Apdu) -> Result<Vec<u8>> {
        let mut response = self.transport.transmit(apdu)?;
        response.check()?;

        let mut data = Vec::new();
        while let Some(remaining) = response.remaining_bytes() {
            trace!(remaining, "fetching chained response");
            data.extend_from_slice(response.data());
            response = self.transport.transmit(&Apdu::get_response(remaining))?;
            response.check()?;
        }

        data.extend_from_slice(response.data());
        Ok(data)
    }
}

/// Reads one BER-TLV header at `i`, returning `(tag, value_start, len)`.
fn read_tlv(data: &[u8], i: usize) -> Option<(u8, usize, usize)> {
    let tag = *data.get(i)?;
    let first = *data.get(i + 1)? as usize;

    let (start, len) = if first < 0x80 {
        (i + 2, first)
    } else {
        let len_bytes = first & 0x7F;
        if len_bytes == 0 || len_bytes > 2 {
            return None;
        }
        let len = data
            .get(i + 2..i + 2 + len_bytes)?
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (i + 2 + len_bytes, len)
    };

    (start + len <= data.len()).then_some((tag, start, len))
}

/// Extracts the value of `tag` inside a `7C` dynamic authentication template.
fn dynamic_template_value(data: &[u8], tag: u8) -> Option<&[u8]> {
    let (outer, start, len) = read_tlv(data, 0)?;
    if outer != 0x7C {
        return None;
    }

    let inner = &data[start..start + len];
    let mut i = 0;
    while i < inner.len() {
        let (t, value_start, value_len) = read_tlv(inner, i)?;
        if t == tag {
            return Some(&inner[value_start..value_start + value_len]);
        }
        i = value_start + value_len;
    }

    None
}

/// Finds the first uncompressed P-256 point inside a DER certificate.
fn find_p256_point(data: &[u8]) -> Option<VerifyingKey> {
    data.windows(65)
        .filter(|window| window[0] == 0x04)
        .find_map(|window| {
            let point = EncodedPoint::from_bytes(window).ok()?;
            VerifyingKey::from_encoded_point(&point).ok()
        })
}

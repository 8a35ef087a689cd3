//! PC/SC backend.
//!
//! Works wherever a PC/SC service runs: built in on macOS and Windows,
//! `pcscd` on Linux. Readers are matched by name against a configurable list
//! of fragments (`Yubico`, `YubiKey` by default).

use std::fmt;

use pcsc::{Card, Context, Protocols, Scope, ShareMode};
use tracing::debug;

use super::apdu::{Apdu, ApduResponse};
use super::{CardConnector, Transport};
use crate::error::{Error, Result};

/// Reader name fragments that identify a YubiKey.
pub const DEFAULT_READER_FILTERS: [&str; 2] = ["Yubico", "YubiKey"];

/// Largest short APDU answer: 256 data bytes plus the status word.
const MAX_RESPONSE_LEN: usize = 258;

/// Opens YubiKey readers through the system PC/SC service.
#[derive(Debug, Clone)]
pub struct PcscConnector {
    reader_filters: Vec<String>,
}

impl Default for PcscConnector {
    fn default() -> Self {
        Self::new(DEFAULT_READER_FILTERS.iter().map(ToString::to_string).collect())
    }
}

impl PcscConnector {
    /// Creates a connector that accepts readers whose name contains any of
    /// `reader_filters`.
    #[must_use]
    pub const fn new(reader_filters: Vec<String>) -> Self {
        Self { reader_filters }
    }

    fn context() -> Result<Context> {
        Context::establish(Scope::User).map_err(|e| {
            Error::ConnectionFailed(format!("failed to establish PC/SC context: {e}"))
        })
    }

    fn matches(&self, name: &str) -> bool {
        self.reader_filters.iter().any(|f| name.contains(f.as_str()))
    }
}

impl CardConnector for PcscConnector {
    fn list_readers(&self) -> Result<Vec<String>> {
        let ctx = Self::context()?;

        let mut readers_buf = vec![0u8; 2048];
        let readers = match ctx.list_readers(&mut readers_buf) {
            Ok(readers) => readers,
            // pcsc-lite reports an empty reader list as an error
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::ConnectionFailed(format!("failed to list readers: {e}")));
            }
        };

        Ok(readers
            .map(|r| r.to_string_lossy().into_owned())
            .filter(|name| self.matches(name))
            .collect())
    }

    fn open(&self, reader: &str) -> Result<Box<dyn Transport>> {
        let ctx = Self::context()?;

        let mut readers_buf = vec![0u8; 2048];
        let reader_name = ctx
            .list_readers(&mut readers_buf)
            .map_err(|e| Error::ConnectionFailed(format!("failed to list readers: {e}")))?
            .find(|r| r.to_string_lossy() == reader)
            .ok_or(Error::DeviceNotFound)?;

        let card = ctx
            .connect(reader_name, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| Error::ConnectionFailed(format!("failed to connect to {reader}: {e}")))?;

        debug!(reader, "opened PC/SC card");
        Ok(Box::new(PcscTransport { card }))
    }
}

/// An opened PC/SC card.
pub struct PcscTransport {
    card: Card,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport").finish_non_exhaustive()
    }
}

impl Transport for PcscTransport {
    fn transmit(&mut self, apdu: &Apdu) -> Result<ApduResponse> {
        let command = apdu.to_bytes()?;
        let mut response_buf = [0u8; MAX_RESPONSE_LEN];

        let response = self.card.transmit(&command, &mut response_buf).map_err(|e| match e {
            pcsc::Error::RemovedCard | pcsc::Error::ResetCard | pcsc::Error::NoSmartcard => {
                Error::DeviceDisconnected
            }
            other => Error::ApduError(format!("transmit failed: {other}")),
        })?;

        ApduResponse::from_bytes(response)
    }

    fn is_connected(&self) -> bool {
        self.card.status2_owned().is_ok()
    }
}

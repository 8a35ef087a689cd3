//! YubiKey PIV access.
//!
//! - [`apdu`]: command/response units and status word mapping
//! - [`piv`]: the PIV applet operations the keyed actions need
//! - [`slot`]: slot identifiers and PIN policy
//! - `pcsc_transport`: the PC/SC backend (feature `pcsc`, on by default)
//!
//! [`Transport`] carries APDUs for one opened card and [`CardConnector`]
//! lists readers and opens them; the [`DeviceKit`](crate::DeviceKit) only
//! talks to these two traits, so tests script a card without hardware.

pub mod apdu;
pub mod piv;
pub mod slot;

#[cfg(feature = "pcsc")]
pub mod pcsc_transport;

pub use apdu::{Apdu, ApduResponse};
pub use piv::PivSession;
pub use slot::Slot;

#[cfg(feature = "pcsc")]
pub use pcsc_transport::{PcscConnector, PcscTransport};

use crate::error::Result;

/// Transport for one opened card.
pub trait Transport: Send {
    /// Sends an APDU command and receives the response.
    ///
    /// # Errors
    ///
    /// Returns an error if communication fails.
    fn transmit(&mut self, apdu: &Apdu) -> Result<ApduResponse>;

    /// Whether the card is still reachable.
    fn is_connected(&self) -> bool;
}

/// Lists smart card readers and opens a [`Transport`] on one of them.
pub trait CardConnector: Send + Sync + 'static {
    /// Returns the names of the readers that hold a YubiKey.
    ///
    /// # Errors
    ///
    /// Returns an error if the smart card subsystem is unavailable.
    fn list_readers(&self) -> Result<Vec<String>>;

    /// Opens the card in the named reader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`](crate::Error::DeviceNotFound) if the
    /// reader is gone, or a connection error if the card refuses.
    fn open(&self, reader: &str) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted card for unit tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::{Apdu, ApduResponse, Transport};
    use crate::error::{Error, Result};

    /// Replays canned responses and records the instructions it saw.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct MockTransport {
        pub(crate) responses: Arc<Mutex<VecDeque<ApduResponse>>>,
        pub(crate) sent: Arc<Mutex<Vec<Apdu>>>,
    }

    impl MockTransport {
        pub(crate) fn new(responses: Vec<ApduResponse>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                sent: Arc::default(),
            }
        }

        pub(crate) fn sent_instructions(&self) -> Vec<u8> {
            self.sent.lock().unwrap().iter().map(Apdu::ins).collect()
        }
    }

    impl Transport for MockTransport {
        fn transmit(&mut self, apdu: &Apdu) -> Result<ApduResponse> {
            self.sent.lock().unwrap().push(apdu.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::ApduError("no response scripted".to_string()))
        }

        fn is_connected(&self) -> bool {
            true
        }
    }
}

//! Session-bound Ethereum keyring.

use std::sync::Arc;

use crate::action::ActionStream;
use crate::kit::{
    GetAddressOutput, GetAddressRequest, KeyedActionRunner, SignTransactionOutput,
    SignTransactionRequest,
};
use crate::session::DeviceSessionId;
use crate::transaction::Transaction;

/// Ethereum actions bound to one device session.
///
/// ```no_run
/// # async fn demo(kit: yubikey_device_kit::DeviceKit<yubikey_device_kit::yubikey::PcscConnector>,
/// #               session: yubikey_device_kit::DeviceSessionId) {
/// use std::sync::Arc;
/// use futures::StreamExt;
/// use yubikey_device_kit::EthKeyring;
///
/// let keyring = EthKeyring::new(Arc::new(kit), session);
/// let mut updates = keyring.get_address("44'/60'/0'/0");
/// while let Some(state) = updates.next().await {
///     println!("{state:?}");
/// }
/// # }
/// ```
pub struct EthKeyring<R: ?Sized> {
    runner: Arc<R>,
    session_id: DeviceSessionId,
}

impl<R: ?Sized> Clone for EthKeyring<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            session_id: self.session_id,
        }
    }
}

impl<R: KeyedActionRunner + ?Sized> EthKeyring<R> {
    #[must_use]
    pub const fn new(runner: Arc<R>, session_id: DeviceSessionId) -> Self {
        Self { runner, session_id }
    }

    /// The session this keyring acts on.
    #[must_use]
    pub const fn session_id(&self) -> DeviceSessionId {
        self.session_id
    }

    /// Reads the address of the slot `derivation_path` maps to.
    pub fn get_address(&self, derivation_path: &str) -> ActionStream<GetAddressOutput> {
        self.runner.get_address(
            self.session_id,
            GetAddressRequest {
                derivation_path: derivation_path.to_owned(),
            },
        )
    }

    /// Signs `transaction` with the slot `derivation_path` maps to.
    pub fn sign_transaction(
        &self,
        derivation_path: &str,
        transaction: Transaction,
    ) -> ActionStream<SignTransactionOutput> {
        self.runner.sign_transaction(
            self.session_id,
            SignTransactionRequest {
                derivation_path: derivation_path.to_owned(),
                transaction,
            },
        )
    }
}

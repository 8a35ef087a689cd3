//! Collaborator contracts and the YubiKey-backed [`DeviceKit`].
//!
//! Clients see three seams:
//!
//! - [`DeviceDirectory`]: a discovery feed plus `connect`/`disconnect`
//! - [`SessionStateProvider`]: a subscribable status stream per session
//! - [`KeyedActionRunner`]: get-address and sign-transaction as
//!   [`ActionStream`]s
//!
//! [`DeviceKit`] implements all three over any [`CardConnector`]. Card I/O
//! is blocking, so every exchange runs on tokio's blocking pool while the
//! session's card is held behind a mutex. A second action on a busy session
//! fails with [`Error::SessionBusy`] instead of queueing. The session stays
//! `Busy` until the card work ends, even if the caller drops the stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use alloy_primitives::Bytes;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::{debug, info, warn};

use crate::action::{ActionError, ActionState, ActionStep, ActionStream, DeviceActionState};
use crate::address::address_of;
use crate::crypto::ethereum_signature;
use crate::error::{Error, Result};
use crate::path::DerivationPath;
use crate::session::{DeviceId, DeviceSessionId, DeviceSessionState, DeviceStatus, DiscoveredDevice};
use crate::signature::Signature;
use crate::transaction::Transaction;
use crate::yubikey::{CardConnector, PivSession, Slot};

// =============================================================================
// Contracts
// =============================================================================

/// Finds devices and opens sessions on them.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Starts a discovery feed.
    ///
    /// The feed yields each newly seen device once. If nothing shows up
    /// within the discovery timeout it yields [`Error::DiscoveryTimeout`]
    /// and ends.
    fn start_discovering(&self) -> BoxStream<'static, Result<DiscoveredDevice>>;

    /// Opens a session on a discovered device.
    async fn connect(&self, device_id: &DeviceId) -> Result<DeviceSessionId>;

    /// Closes a session. Its state stream reports `NotConnected` and ends.
    async fn disconnect(&self, session_id: DeviceSessionId) -> Result<()>;
}

/// Publishes the status of open sessions.
pub trait SessionStateProvider: Send + Sync {
    /// Current state first, then every change. Unknown sessions yield a
    /// single `NotConnected` state.
    fn session_state(&self, session_id: DeviceSessionId) -> BoxStream<'static, DeviceSessionState>;
}

/// Runs keyed Ethereum actions on a session.
pub trait KeyedActionRunner: Send + Sync {
    fn get_address(
        &self,
        session_id: DeviceSessionId,
        request: GetAddressRequest,
    ) -> ActionStream<GetAddressOutput>;

    fn sign_transaction(
        &self,
        session_id: DeviceSessionId,
        request: SignTransactionRequest,
    ) -> ActionStream<SignTransactionOutput>;
}

/// Input of get-address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAddressRequest {
    /// `44'/60'/0'/0` style path, validated by the runner.
    pub derivation_path: String,
}

/// Output of get-address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAddressOutput {
    /// EIP-55 checksummed address.
    pub address: String,
    /// Uncompressed SEC1 public key, hex with `0x`.
    pub public_key: String,
}

impl GetAddressOutput {
    fn from_key(key: &VerifyingKey) -> Self {
        Self {
            address: address_of(key).to_checksum(None),
            public_key: format!("0x{}", hex::encode(key.to_encoded_point(false).as_bytes())),
        }
    }
}

/// Input of sign-transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignTransactionRequest {
    pub derivation_path: String,
    /// An already decoded unsigned transaction.
    pub transaction: Transaction,
}

/// Output of sign-transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignTransactionOutput {
    pub signature: Signature,
    /// The signed transaction, ready to broadcast.
    pub signed_transaction: Bytes,
}

// =============================================================================
// DeviceKit
// =============================================================================

/// Timing and credentials of a [`DeviceKit`].
#[derive(Debug, Clone)]
pub struct KitOptions {
    /// How often discovery lists readers.
    pub discovery_poll_interval: Duration,
    /// How long discovery waits for a first device.
    pub discovery_timeout: Duration,
    /// How often open sessions check that their card is still there.
    pub session_poll_interval: Duration,
    /// PIN used before signing with a slot that needs one.
    pub pin: Option<String>,
}

impl Default for KitOptions {
    fn default() -> Self {
        Self {
            discovery_poll_interval: Duration::from_millis(500),
            discovery_timeout: Duration::from_secs(30),
            session_poll_interval: Duration::from_secs(1),
            pin: None,
        }
    }
}

/// The YubiKey implementation of the collaborator contracts.
pub struct DeviceKit<C> {
    inner: Arc<KitInner<C>>,
}

impl<C> Clone for DeviceKit<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct KitInner<C> {
    connector: Arc<C>,
    options: KitOptions,
    sessions: Mutex<HashMap<DeviceSessionId, Arc<SessionEntry>>>,
}

struct SessionEntry {
    id: DeviceSessionId,
    card: Arc<AsyncMutex<PivSession>>,
    state: watch::Sender<DeviceSessionState>,
    /// Set while a keyed action owns the session.
    acting: AtomicBool,
}

impl SessionEntry {
    fn publish(&self, status: DeviceStatus) {
        let changed = self.state.send_if_modified(|state| {
            let changed = state.device_status != status;
            state.device_status = status;
            changed
        });
        if changed {
            debug!(session = %self.id, %status, "session status changed");
        }
    }

    fn status(&self) -> DeviceStatus {
        self.state.borrow().device_status
    }
}

#[cfg(feature = "pcsc")]
impl DeviceKit<crate::yubikey::PcscConnector> {
    /// A kit over the system PC/SC service, matching readers against
    /// `reader_filters`.
    #[must_use]
    pub fn pcsc(reader_filters: Vec<String>, options: KitOptions) -> Self {
        Self::new(crate::yubikey::PcscConnector::new(reader_filters), options)
    }
}

impl<C: CardConnector> DeviceKit<C> {
    #[must_use]
    pub fn new(connector: C, options: KitOptions) -> Self {
        Self {
            inner: Arc::new(KitInner {
                connector: Arc::new(connector),
                options,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the options this kit was built with.
    #[must_use]
    pub fn options(&self) -> &KitOptions {
        &self.inner.options
    }

    fn failed<O: Send + 'static>(err: Error) -> ActionStream<O> {
        warn!(error = %err, "rejected device action");
        stream::once(async move { DeviceActionState::Error(ActionError::from(err)) }).boxed()
    }

    /// Runs `action` on the session's card and streams its progress.
    ///
    /// Nothing happens until the stream is polled.
    fn run<O, F>(&self, session_id: DeviceSessionId, action: F) -> ActionStream<O>
    where
        O: Send + 'static,
        F: FnOnce(&mut PivSession, Option<&str>, &Progress<O>) -> Result<O> + Send + 'static,
    {
        let (updates, rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);

        let driver = stream::once(async move { inner.execute(session_id, updates, action).await })
            .filter_map(|()| async { None::<ActionState<O>> });

        stream::select(driver, UnboundedReceiverStream::new(rx)).boxed()
    }
}

impl<C: CardConnector> KitInner<C> {
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceSessionId, Arc<SessionEntry>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, session_id: DeviceSessionId) -> Result<Arc<SessionEntry>> {
        self.lock_sessions()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))
    }

    async fn execute<O, F>(
        &self,
        session_id: DeviceSessionId,
        updates: mpsc::UnboundedSender<ActionState<O>>,
        action: F,
    ) where
        O: Send + 'static,
        F: FnOnce(&mut PivSession, Option<&str>, &Progress<O>) -> Result<O> + Send + 'static,
    {
        let terminal = match self.try_execute(session_id, &updates, action).await {
            Ok(output) => DeviceActionState::Completed(output),
            Err(err) => {
                warn!(session = %session_id, error = %err, "device action failed");
                DeviceActionState::Error(ActionError::from(err))
            }
        };
        // the receiver is gone if the caller dropped the stream
        let _ = updates.send(terminal);
    }

    async fn try_execute<O, F>(
        &self,
        session_id: DeviceSessionId,
        updates: &mpsc::UnboundedSender<ActionState<O>>,
        action: F,
    ) -> Result<O>
    where
        O: Send + 'static,
        F: FnOnce(&mut PivSession, Option<&str>, &Progress<O>) -> Result<O> + Send + 'static,
    {
        let entry = self.session(session_id)?;
        let mut guard = ActionGuard::acquire(Arc::clone(&entry))?;
        // the presence poller may hold the card for one short exchange
        let mut card = Arc::clone(&entry.card).lock_owned().await;
        let progress = Progress(updates.clone());
        let pin = self.options.pin.clone();

        // the guard ends with the card work, not with the stream
        tokio::task::spawn_blocking(move || {
            let result = action(&mut *card, pin.as_deref(), &progress);
            drop(card);
            guard.settle(&result);
            result
        })
        .await
        .unwrap_or_else(|e| Err(Error::TaskFailed(e.to_string())))
    }
}

/// Marks a session busy for the lifetime of one keyed action.
///
/// Dropping it publishes the status the action ended in, `Connected` unless
/// [`settle`](Self::settle) saw otherwise, and frees the session.
struct ActionGuard {
    entry: Arc<SessionEntry>,
    outcome: DeviceStatus,
}

impl ActionGuard {
    fn acquire(entry: Arc<SessionEntry>) -> Result<Self> {
        if entry.acting.swap(true, Ordering::AcqRel) {
            return Err(Error::SessionBusy(entry.id.to_string()));
        }
        entry.publish(DeviceStatus::Busy);
        Ok(Self {
            entry,
            outcome: DeviceStatus::Connected,
        })
    }

    fn settle<T>(&mut self, result: &Result<T>) {
        self.outcome = match result {
            Err(Error::PinLocked) => DeviceStatus::Locked,
            Err(Error::DeviceDisconnected) => DeviceStatus::NotConnected,
            Ok(_) | Err(_) => DeviceStatus::Connected,
        };
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.entry.publish(self.outcome);
        self.entry.acting.store(false, Ordering::Release);
    }
}

/// Reports pending steps of a running action.
struct Progress<O>(mpsc::UnboundedSender<ActionState<O>>);

impl<O> Progress<O> {
    fn step(&self, step: ActionStep) {
        let _ = self.0.send(DeviceActionState::Pending(step));
    }
}

/// Checks a session's card until it disappears or the session is dropped.
async fn poll_session(entry: Weak<SessionEntry>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(entry) = entry.upgrade() else {
            return;
        };
        if entry.status() == DeviceStatus::NotConnected {
            return;
        }

        // a running action reports its own outcome
        if entry.acting.load(Ordering::Acquire) {
            continue;
        }
        let Ok(card) = Arc::clone(&entry.card).try_lock_owned() else {
            continue;
        };
        let connected = tokio::task::spawn_blocking(move || card.is_connected())
            .await
            .unwrap_or(false);

        if !connected {
            info!(session = %entry.id, "device removed");
            entry.publish(DeviceStatus::NotConnected);
            return;
        }
    }
}

struct Discovery<C> {
    connector: Arc<C>,
    poll_interval: Duration,
    timeout: Duration,
    /// `None` when the timeout is too large to represent.
    deadline: Option<Instant>,
    seen: HashSet<String>,
    queued: VecDeque<DiscoveredDevice>,
    polled: bool,
    finished: bool,
}

impl<C: CardConnector> Discovery<C> {
    async fn next(mut self) -> Option<(Result<DiscoveredDevice>, Self)> {
        loop {
            if let Some(device) = self.queued.pop_front() {
                return Some((Ok(device), self));
            }
            if self.finished {
                return None;
            }

            if self.polled {
                tokio::time::sleep(self.poll_interval).await;
            }
            self.polled = true;

            let connector = Arc::clone(&self.connector);
            let readers = tokio::task::spawn_blocking(move || connector.list_readers())
                .await
                .unwrap_or_else(|e| Err(Error::TaskFailed(e.to_string())));

            match readers {
                Ok(readers) => {
                    for reader in readers {
                        if self.seen.insert(reader.clone()) {
                            debug!(reader, "discovered device");
                            self.queued.push_back(DiscoveredDevice {
                                id: DeviceId::new(reader.clone()),
                                name: reader,
                            });
                        }
                    }
                }
                Err(err) => {
                    self.finished = true;
                    return Some((Err(err), self));
                }
            }

            let expired = self.deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if self.seen.is_empty() && expired {
                self.finished = true;
                return Some((Err(Error::DiscoveryTimeout(self.timeout)), self));
            }
        }
    }
}

#[async_trait]
impl<C: CardConnector> DeviceDirectory for DeviceKit<C> {
    fn start_discovering(&self) -> BoxStream<'static, Result<DiscoveredDevice>> {
        let options = &self.inner.options;
        let discovery = Discovery {
            connector: Arc::clone(&self.inner.connector),
            poll_interval: options.discovery_poll_interval,
            timeout: options.discovery_timeout,
            deadline: Instant::now().checked_add(options.discovery_timeout),
            seen: HashSet::new(),
            queued: VecDeque::new(),
            polled: false,
            finished: false,
        };

        stream::unfold(discovery, Discovery::next).boxed()
    }

    async fn connect(&self, device_id: &DeviceId) -> Result<DeviceSessionId> {
        let connector = Arc::clone(&self.inner.connector);
        let reader = device_id.as_str().to_owned();

        let card = tokio::task::spawn_blocking(move || {
            let mut piv = PivSession::new(connector.open(&reader)?);
            piv.select()?;
            Ok::<_, Error>(piv)
        })
        .await
        .map_err(|e| Error::TaskFailed(e.to_string()))??;

        let id = DeviceSessionId::new();
        let (state, _) = watch::channel(DeviceSessionState {
            session_id: id,
            device_status: DeviceStatus::Connected,
            device_name: Some(device_id.to_string()),
        });
        let entry = Arc::new(SessionEntry {
            id,
            card: Arc::new(AsyncMutex::new(card)),
            state,
            acting: AtomicBool::new(false),
        });

        self.inner.lock_sessions().insert(id, Arc::clone(&entry));
        tokio::spawn(poll_session(
            Arc::downgrade(&entry),
            self.inner.options.session_poll_interval,
        ));

        info!(session = %id, device = %device_id, "device session opened");
        Ok(id)
    }

    async fn disconnect(&self, session_id: DeviceSessionId) -> Result<()> {
        let entry = self
            .inner
            .lock_sessions()
            .remove(&session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        entry.publish(DeviceStatus::NotConnected);
        info!(session = %session_id, "device session closed");
        Ok(())
    }
}

impl<C: CardConnector> SessionStateProvider for DeviceKit<C> {
    fn session_state(&self, session_id: DeviceSessionId) -> BoxStream<'static, DeviceSessionState> {
        match self.inner.session(session_id) {
            Ok(entry) => WatchStream::new(entry.state.subscribe()).boxed(),
            Err(_) => stream::once(async move {
                DeviceSessionState {
                    session_id,
                    device_status: DeviceStatus::NotConnected,
                    device_name: None,
                }
            })
            .boxed(),
        }
    }
}

fn slot_for(derivation_path: &str) -> Result<Slot> {
    derivation_path.parse::<DerivationPath>()?.slot()
}

impl<C: CardConnector> KeyedActionRunner for DeviceKit<C> {
    fn get_address(
        &self,
        session_id: DeviceSessionId,
        request: GetAddressRequest,
    ) -> ActionStream<GetAddressOutput> {
        let slot = match slot_for(&request.derivation_path) {
            Ok(slot) => slot,
            Err(err) => return Self::failed(err),
        };

        self.run(session_id, move |card, _pin, progress| {
            progress.step(ActionStep::Processing);
            card.select()?;
            let key = card.public_key(slot)?;
            Ok(GetAddressOutput::from_key(&key))
        })
    }

    fn sign_transaction(
        &self,
        session_id: DeviceSessionId,
        request: SignTransactionRequest,
    ) -> ActionStream<SignTransactionOutput> {
        let slot = match slot_for(&request.derivation_path) {
            Ok(slot) => slot,
            Err(err) => return Self::failed(err),
        };
        let transaction = request.transaction;

        self.run(session_id, move |card, pin, progress| {
            progress.step(ActionStep::Processing);
            card.select()?;
            let key = card.public_key(slot)?;

            if let (true, Some(pin)) = (slot.requires_pin(), pin) {
                progress.step(ActionStep::VerifyPin);
                card.verify_pin(pin)?;
            }

            let digest = transaction.signing_hash();
            progress.step(ActionStep::ConfirmOnDevice);
            let der = card.sign_digest(slot, &digest.0)?;
            let signature = ethereum_signature(&der, &digest.0, &key)?;

            Ok(SignTransactionOutput {
                signature,
                signed_transaction: transaction.signed_rlp(&signature).into(),
            })
        })
    }
}

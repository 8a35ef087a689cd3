//! The action lifecycle adapter.
//!
//! The adapter owns all page state and is only mutated from one task. Work
//! that waits on a collaborator (discovery and connect, the session state
//! subscription, keyed action streams) runs in forwarding tasks that post
//! [`WorkshopEvent`]s back through one channel; [`Adapter::apply`] folds
//! them into [`WorkshopState`].
//!
//! Each keyed action kind goes `Idle -> Loading -> Completed | Failed`. A
//! kind that is loading cannot be started again, and nothing starts unless
//! the session reports itself connected. Events that belong to a replaced session, a superseded connect
//! attempt or an older invocation are dropped.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use yubikey_device_kit::{
    ActionError, ActionState, ActionStep, ActionStream, DeviceActionState, DeviceDirectory,
    DeviceSessionId, DeviceSessionState, ErrorCode, EthKeyring, GetAddressOutput,
    DeviceStatus, KeyedActionRunner, SessionStateProvider, SignTransactionOutput, Transaction,
};

use crate::config::WorkshopConfig;

// =============================================================================
// State
// =============================================================================

/// Lifecycle of one keyed action kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Invocation<O> {
    /// Never started, or its stream ended without a result.
    #[default]
    Idle,
    /// Running; carries the latest pending step, if any arrived yet.
    Loading(Option<ActionStep>),
    /// Finished with an output.
    Completed(O),
    /// Finished with an error.
    Failed(ActionError),
}

impl<O> Invocation<O> {
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    #[must_use]
    pub const fn output(&self) -> Option<&O> {
        match self {
            Self::Completed(output) => Some(output),
            _ => None,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&ActionError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Folds one emission in. Anything after the first terminal emission is
    /// ignored.
    fn absorb(&mut self, state: ActionState<O>) -> bool {
        if !self.is_loading() {
            return false;
        }
        *self = match state {
            DeviceActionState::Pending(step) => Self::Loading(Some(step)),
            DeviceActionState::Completed(output) => Self::Completed(output),
            DeviceActionState::Error(error) => Self::Failed(error),
        };
        true
    }

    /// The stream ended; a still loading invocation drops back to idle.
    fn finish(&mut self) {
        if self.is_loading() {
            *self = Self::Idle;
        }
    }
}

/// The two keyed actions of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    GetAddress,
    SignTransaction,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GetAddress => "get-address",
            Self::SignTransaction => "sign-transaction",
        })
    }
}

/// Which half of discover-and-connect failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStage {
    Discovery,
    Connect,
}

/// Why the page has no session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionError {
    pub stage: ConnectionStage,
    pub code: ErrorCode,
    pub message: String,
}

impl ConnectionError {
    fn new(stage: ConnectionStage, err: &yubikey_device_kit::Error) -> Self {
        Self {
            stage,
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }
}

/// Everything the page shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkshopState {
    pub session_id: Option<DeviceSessionId>,
    /// A discover-and-connect attempt is in flight.
    pub connecting: bool,
    pub connection_error: Option<ConnectionError>,
    /// Last observed state of the current session.
    pub session_state: Option<DeviceSessionState>,
    /// Derivation path field.
    pub derivation_path: String,
    /// Transaction field (hex RLP).
    pub transaction: String,
    pub get_address: Invocation<GetAddressOutput>,
    pub sign_transaction: Invocation<SignTransactionOutput>,
}

impl WorkshopState {
    fn new(config: &WorkshopConfig) -> Self {
        Self {
            session_id: None,
            connecting: false,
            connection_error: None,
            session_state: None,
            derivation_path: config.derivation_path.clone(),
            transaction: config.transaction.clone(),
            get_address: Invocation::Idle,
            sign_transaction: Invocation::Idle,
        }
    }

    /// Whether the current session last reported `Connected`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.session_state.as_ref().is_some_and(|state| {
            Some(state.session_id) == self.session_id
                && state.device_status == DeviceStatus::Connected
        })
    }

    /// Whether `kind` may be started right now.
    #[must_use]
    pub fn can_start(&self, kind: ActionKind) -> bool {
        self.is_ready() && !self.is_loading(kind)
    }

    #[must_use]
    pub const fn is_loading(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::GetAddress => self.get_address.is_loading(),
            ActionKind::SignTransaction => self.sign_transaction.is_loading(),
        }
    }
}

// =============================================================================
// Events and requests
// =============================================================================

/// Something a forwarding task observed.
#[derive(Debug)]
pub enum WorkshopEvent {
    ConnectFinished {
        attempt: u64,
        outcome: Result<DeviceSessionId, ConnectionError>,
    },
    SessionState(DeviceSessionState),
    GetAddress(ActionEvent<GetAddressOutput>),
    SignTransaction(ActionEvent<SignTransactionOutput>),
}

/// One item of a keyed action stream, tagged with where it came from.
#[derive(Debug)]
pub struct ActionEvent<O> {
    pub session_id: DeviceSessionId,
    pub invocation: u64,
    pub update: ActionUpdate<O>,
}

#[derive(Debug)]
pub enum ActionUpdate<O> {
    State(ActionState<O>),
    StreamEnded,
}

/// Input of [`Adapter::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    GetAddress {
        derivation_path: String,
    },
    SignTransaction {
        derivation_path: String,
        /// Hex RLP of the unsigned transaction.
        transaction: String,
    },
}

impl ActionRequest {
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::GetAddress { .. } => ActionKind::GetAddress,
            Self::SignTransaction { .. } => ActionKind::SignTransaction,
        }
    }
}

/// Why [`Adapter::start`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("no active session, connect a device first")]
    NoSession,
    #[error("{0} is already running")]
    AlreadyLoading(ActionKind),
    #[error("device is not ready, wait for the session to report CONNECTED")]
    DeviceNotReady,
}

// =============================================================================
// Adapter
// =============================================================================

/// The collaborators the adapter talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DeviceDirectory>,
    pub sessions: Arc<dyn SessionStateProvider>,
    pub actions: Arc<dyn KeyedActionRunner>,
}

impl Collaborators {
    /// Uses one object for all three contracts.
    pub fn from_kit<K>(kit: K) -> Self
    where
        K: DeviceDirectory + SessionStateProvider + KeyedActionRunner + 'static,
    {
        let kit = Arc::new(kit);
        Self {
            directory: Arc::clone(&kit) as Arc<dyn DeviceDirectory>,
            sessions: Arc::clone(&kit) as Arc<dyn SessionStateProvider>,
            actions: kit,
        }
    }
}

pub struct Adapter {
    collaborators: Collaborators,
    events: mpsc::UnboundedSender<WorkshopEvent>,
    state: WorkshopState,
    keyring: Option<EthKeyring<dyn KeyedActionRunner>>,
    session_task: Option<JoinHandle<()>>,
    connect_attempt: u64,
    next_invocation: u64,
    get_address_invocation: u64,
    sign_transaction_invocation: u64,
}

impl Adapter {
    /// Creates an adapter and the receiving end of its event channel. Feed
    /// every received event back into [`apply`](Self::apply).
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        config: &WorkshopConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WorkshopEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            collaborators,
            events,
            state: WorkshopState::new(config),
            keyring: None,
            session_task: None,
            connect_attempt: 0,
            next_invocation: 0,
            get_address_invocation: 0,
            sign_transaction_invocation: 0,
        };
        (adapter, rx)
    }

    #[must_use]
    pub const fn state(&self) -> &WorkshopState {
        &self.state
    }

    pub fn set_derivation_path(&mut self, path: impl Into<String>) {
        self.state.derivation_path = path.into();
    }

    pub fn set_transaction(&mut self, transaction: impl Into<String>) {
        self.state.transaction = transaction.into();
    }

    /// Builds a request of `kind` from the page fields.
    #[must_use]
    pub fn request(&self, kind: ActionKind) -> ActionRequest {
        let derivation_path = self.state.derivation_path.clone();
        match kind {
            ActionKind::GetAddress => ActionRequest::GetAddress { derivation_path },
            ActionKind::SignTransaction => ActionRequest::SignTransaction {
                derivation_path,
                transaction: self.state.transaction.clone(),
            },
        }
    }

    /// Drops the session, then connects to the first device discovery
    /// yields. The outcome arrives as [`WorkshopEvent::ConnectFinished`].
    pub fn discover_and_connect(&mut self) {
        self.set_session(None);
        self.connect_attempt += 1;
        self.state.connecting = true;

        let attempt = self.connect_attempt;
        let directory = Arc::clone(&self.collaborators.directory);
        let events = self.events.clone();
        info!(attempt, "discovering devices");

        tokio::spawn(async move {
            let outcome = connect_first(directory.as_ref()).await;
            let _ = events.send(WorkshopEvent::ConnectFinished { attempt, outcome });
        });
    }

    /// Starts a keyed action.
    ///
    /// A transaction that does not decode fails the sign-transaction slot
    /// right away and nothing is submitted.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] without touching any state when there is no
    /// session, the kind is already loading, or the session does not report
    /// itself connected.
    pub fn start(&mut self, request: ActionRequest) -> Result<(), Rejected> {
        let kind = request.kind();
        let Some(keyring) = self.keyring.clone() else {
            return Err(Rejected::NoSession);
        };
        if self.state.is_loading(kind) {
            return Err(Rejected::AlreadyLoading(kind));
        }
        if !self.state.is_ready() {
            return Err(Rejected::DeviceNotReady);
        }

        self.next_invocation += 1;
        let invocation = self.next_invocation;
        let session_id = keyring.session_id();
        info!(%kind, invocation, session = %session_id, "starting action");

        match request {
            ActionRequest::GetAddress { derivation_path } => {
                self.get_address_invocation = invocation;
                self.state.get_address = Invocation::Loading(None);
                let stream = keyring.get_address(&derivation_path);
                self.forward(stream, session_id, invocation, WorkshopEvent::GetAddress);
            }
            ActionRequest::SignTransaction {
                derivation_path,
                transaction,
            } => {
                self.sign_transaction_invocation = invocation;
                let transaction = match Transaction::from_hex(&transaction) {
                    Ok(transaction) => transaction,
                    Err(err) => {
                        warn!(error = %err, "transaction does not decode");
                        self.state.sign_transaction = Invocation::Failed(ActionError::from(err));
                        return Ok(());
                    }
                };
                self.state.sign_transaction = Invocation::Loading(None);
                let stream = keyring.sign_transaction(&derivation_path, transaction);
                self.forward(stream, session_id, invocation, WorkshopEvent::SignTransaction);
            }
        }
        Ok(())
    }

    /// Folds one event into the state.
    pub fn apply(&mut self, event: WorkshopEvent) {
        match event {
            WorkshopEvent::ConnectFinished { attempt, outcome } => {
                if attempt != self.connect_attempt {
                    debug!(attempt, "dropping superseded connect outcome");
                    return;
                }
                self.state.connecting = false;
                match outcome {
                    Ok(session_id) => {
                        info!(session = %session_id, "connected");
                        self.state.connection_error = None;
                        self.set_session(Some(session_id));
                    }
                    Err(err) => {
                        warn!(stage = ?err.stage, message = %err.message, "connection failed");
                        self.state.connection_error = Some(err);
                    }
                }
            }
            WorkshopEvent::SessionState(state) => {
                if self.state.session_id != Some(state.session_id) {
                    debug!(session = %state.session_id, "dropping stale session state");
                    return;
                }
                self.state.session_state = Some(state);
            }
            WorkshopEvent::GetAddress(event) => {
                if self.is_current(event.session_id, event.invocation, self.get_address_invocation) {
                    apply_update(ActionKind::GetAddress, &mut self.state.get_address, event.update);
                }
            }
            WorkshopEvent::SignTransaction(event) => {
                if self.is_current(
                    event.session_id,
                    event.invocation,
                    self.sign_transaction_invocation,
                ) {
                    apply_update(
                        ActionKind::SignTransaction,
                        &mut self.state.sign_transaction,
                        event.update,
                    );
                }
            }
        }
    }

    fn is_current(&self, session_id: DeviceSessionId, invocation: u64, current: u64) -> bool {
        let current = self.state.session_id == Some(session_id) && invocation == current;
        if !current {
            debug!(session = %session_id, invocation, "dropping stale action event");
        }
        current
    }

    /// Replaces the session handle and its state subscription. A replaced
    /// session is disconnected.
    fn set_session(&mut self, session_id: Option<DeviceSessionId>) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        if let Some(old) = self.state.session_id.filter(|old| Some(*old) != session_id) {
            let directory = Arc::clone(&self.collaborators.directory);
            tokio::spawn(async move {
                match directory.disconnect(old).await {
                    Ok(()) => debug!(session = %old, "released previous session"),
                    Err(err) => debug!(session = %old, error = %err, "previous session already gone"),
                }
            });
        }
        self.state.session_id = session_id;
        self.state.session_state = None;
        // their events will be dropped as stale, so they would never finish
        self.state.get_address.finish();
        self.state.sign_transaction.finish();

        self.keyring = session_id
            .map(|id| EthKeyring::new(Arc::clone(&self.collaborators.actions), id));

        if let Some(session_id) = session_id {
            let mut states = self.collaborators.sessions.session_state(session_id);
            let events = self.events.clone();
            self.session_task = Some(tokio::spawn(async move {
                while let Some(state) = states.next().await {
                    if events.send(WorkshopEvent::SessionState(state)).is_err() {
                        return;
                    }
                }
            }));
        }
    }

    fn forward<O: Send + 'static>(
        &self,
        mut stream: ActionStream<O>,
        session_id: DeviceSessionId,
        invocation: u64,
        wrap: fn(ActionEvent<O>) -> WorkshopEvent,
    ) {
        let events = self.events.clone();
        let event = move |update| {
            wrap(ActionEvent {
                session_id,
                invocation,
                update,
            })
        };

        tokio::spawn(async move {
            while let Some(state) = stream.next().await {
                if events.send(event(ActionUpdate::State(state))).is_err() {
                    return;
                }
            }
            let _ = events.send(event(ActionUpdate::StreamEnded));
        });
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
    }
}

fn apply_update<O>(kind: ActionKind, invocation: &mut Invocation<O>, update: ActionUpdate<O>) {
    match update {
        ActionUpdate::State(state) => {
            let terminal = state.is_terminal();
            if !invocation.absorb(state) {
                debug!(%kind, "ignoring emission after terminal state");
            } else if terminal {
                match invocation.error() {
                    Some(err) => info!(%kind, code = ?err.code, "action failed"),
                    None => info!(%kind, "action completed"),
                }
            }
        }
        ActionUpdate::StreamEnded => invocation.finish(),
    }
}

/// Takes the first discovered device and connects to it.
async fn connect_first(directory: &dyn DeviceDirectory) -> Result<DeviceSessionId, ConnectionError> {
    let device = {
        let mut discovery = directory.start_discovering();
        match discovery.next().await {
            Some(Ok(device)) => device,
            Some(Err(err)) => return Err(ConnectionError::new(ConnectionStage::Discovery, &err)),
            None => {
                return Err(ConnectionError {
                    stage: ConnectionStage::Discovery,
                    code: ErrorCode::Unknown,
                    message: "discovery ended without a device".to_string(),
                });
            }
        }
    };

    info!(device = %device.id, "connecting");
    directory
        .connect(&device.id)
        .await
        .map_err(|err| ConnectionError::new(ConnectionStage::Connect, &err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(value: &str) -> GetAddressOutput {
        GetAddressOutput {
            address: value.to_string(),
            public_key: "0x04".to_string(),
        }
    }

    #[test]
    fn pending_keeps_loading_and_updates_snapshot() {
        let mut invocation = Invocation::<GetAddressOutput>::Loading(None);
        assert!(invocation.absorb(DeviceActionState::Pending(ActionStep::Processing)));
        assert_eq!(invocation, Invocation::Loading(Some(ActionStep::Processing)));
        assert!(invocation.is_loading());
    }

    #[test]
    fn first_terminal_emission_wins() {
        let mut invocation = Invocation::Loading(None);
        invocation.absorb(DeviceActionState::Completed(address("0xA")));
        invocation.absorb(DeviceActionState::Error(ActionError::new(ErrorCode::Denied, "late")));
        invocation.absorb(DeviceActionState::Completed(address("0xB")));

        assert_eq!(invocation.output(), Some(&address("0xA")));
        assert!(invocation.error().is_none());

        let mut invocation = Invocation::<GetAddressOutput>::Loading(None);
        invocation.absorb(DeviceActionState::Error(ActionError::new(ErrorCode::Denied, "no")));
        invocation.absorb(DeviceActionState::Completed(address("0xB")));
        assert!(invocation.output().is_none());
        assert_eq!(invocation.error().map(|e| e.code), Some(ErrorCode::Denied));
    }

    #[test]
    fn stream_end_clears_loading_but_keeps_results() {
        let mut loading = Invocation::<GetAddressOutput>::Loading(Some(ActionStep::Processing));
        loading.finish();
        assert_eq!(loading, Invocation::Idle);

        let mut done = Invocation::Completed(address("0xA"));
        done.finish();
        assert_eq!(done.output(), Some(&address("0xA")));
    }

    #[test]
    fn idle_ignores_emissions() {
        let mut idle = Invocation::<GetAddressOutput>::Idle;
        assert!(!idle.absorb(DeviceActionState::Completed(address("0xA"))));
        assert_eq!(idle, Invocation::Idle);
    }

    fn session_state(session_id: DeviceSessionId, device_status: DeviceStatus) -> DeviceSessionState {
        DeviceSessionState {
            session_id,
            device_status,
            device_name: None,
        }
    }

    #[test]
    fn enablement_needs_connected_session_and_idle_kind() {
        let mut state = WorkshopState::new(&WorkshopConfig::default());
        assert!(!state.can_start(ActionKind::GetAddress));

        let session_id = DeviceSessionId::new();
        state.session_id = Some(session_id);
        assert!(!state.can_start(ActionKind::GetAddress));

        state.session_state = Some(session_state(session_id, DeviceStatus::Connected));
        assert!(state.can_start(ActionKind::GetAddress));

        state.get_address = Invocation::Loading(None);
        assert!(!state.can_start(ActionKind::GetAddress));
        assert!(state.can_start(ActionKind::SignTransaction));
    }

    #[test]
    fn busy_locked_or_foreign_sessions_are_not_ready() {
        let session_id = DeviceSessionId::new();
        let mut state = WorkshopState::new(&WorkshopConfig::default());
        state.session_id = Some(session_id);

        for status in [DeviceStatus::Busy, DeviceStatus::Locked, DeviceStatus::NotConnected] {
            state.session_state = Some(session_state(session_id, status));
            assert!(!state.is_ready(), "{status}");
            assert!(!state.can_start(ActionKind::SignTransaction));
        }

        state.session_state = Some(session_state(DeviceSessionId::new(), DeviceStatus::Connected));
        assert!(!state.is_ready());
    }
}

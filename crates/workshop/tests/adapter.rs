use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use yubikey_device_kit::{
    ActionError, ActionState, ActionStep, ActionStream, DeviceActionState, DeviceDirectory,
    DeviceId, DeviceSessionId, DeviceSessionState, DeviceStatus, DiscoveredDevice, Error,
    ErrorCode, GetAddressOutput, GetAddressRequest, KeyedActionRunner, Result,
    SessionStateProvider, SignTransactionOutput, SignTransactionRequest,
};
use yubikey_evm_workshop::adapter::{
    ActionEvent, ActionKind, ActionRequest, ActionUpdate, Adapter, Collaborators,
    ConnectionStage, Invocation, Rejected, WorkshopEvent, WorkshopState,
};
use yubikey_evm_workshop::config::WorkshopConfig;

const EIP155_PAYLOAD: &str =
    "0xec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080";

/// Collaborators that replay scripted outcomes.
#[derive(Default)]
struct Script {
    discoveries: Mutex<VecDeque<Vec<Result<DiscoveredDevice>>>>,
    connects: Mutex<VecDeque<Result<DeviceSessionId>>>,
    /// Status every session reports; `Connected` when unset.
    status: Mutex<Option<DeviceStatus>>,
    disconnects: Mutex<Vec<DeviceSessionId>>,
    addresses: Mutex<VecDeque<ActionStream<GetAddressOutput>>>,
    signatures: Mutex<VecDeque<ActionStream<SignTransactionOutput>>>,
    address_calls: Mutex<Vec<(DeviceSessionId, GetAddressRequest)>>,
    sign_calls: Mutex<Vec<(DeviceSessionId, SignTransactionRequest)>>,
}

impl Script {
    fn discovery(&self, items: Vec<Result<DiscoveredDevice>>) -> &Self {
        self.discoveries.lock().unwrap().push_back(items);
        self
    }

    fn connect(&self, outcome: Result<DeviceSessionId>) -> &Self {
        self.connects.lock().unwrap().push_back(outcome);
        self
    }

    fn report(&self, status: DeviceStatus) -> &Self {
        *self.status.lock().unwrap() = Some(status);
        self
    }

    fn disconnects(&self) -> Vec<DeviceSessionId> {
        self.disconnects.lock().unwrap().clone()
    }

    fn address_stream(&self, states: Vec<ActionState<GetAddressOutput>>) -> &Self {
        self.addresses.lock().unwrap().push_back(stream::iter(states).boxed());
        self
    }

    fn sign_stream(&self, states: Vec<ActionState<SignTransactionOutput>>) -> &Self {
        self.signatures.lock().unwrap().push_back(stream::iter(states).boxed());
        self
    }

    fn address_calls(&self) -> Vec<(DeviceSessionId, GetAddressRequest)> {
        self.address_calls.lock().unwrap().clone()
    }

    fn sign_calls(&self) -> usize {
        self.sign_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeviceDirectory for Script {
    fn start_discovering(&self) -> BoxStream<'static, Result<DiscoveredDevice>> {
        let items = self.discoveries.lock().unwrap().pop_front().unwrap_or_default();
        // a live feed never ends on its own
        stream::iter(items).chain(stream::pending()).boxed()
    }

    async fn connect(&self, _device_id: &DeviceId) -> Result<DeviceSessionId> {
        self.connects
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(DeviceSessionId::new()))
    }

    async fn disconnect(&self, session_id: DeviceSessionId) -> Result<()> {
        self.disconnects.lock().unwrap().push(session_id);
        Ok(())
    }
}

impl SessionStateProvider for Script {
    fn session_state(&self, session_id: DeviceSessionId) -> BoxStream<'static, DeviceSessionState> {
        let status = self.status.lock().unwrap().unwrap_or(DeviceStatus::Connected);
        stream::once(async move { state_of(session_id, status) })
            .chain(stream::pending())
            .boxed()
    }
}

impl KeyedActionRunner for Script {
    fn get_address(
        &self,
        session_id: DeviceSessionId,
        request: GetAddressRequest,
    ) -> ActionStream<GetAddressOutput> {
        self.address_calls.lock().unwrap().push((session_id, request));
        self.addresses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| stream::pending().boxed())
    }

    fn sign_transaction(
        &self,
        session_id: DeviceSessionId,
        request: SignTransactionRequest,
    ) -> ActionStream<SignTransactionOutput> {
        self.sign_calls.lock().unwrap().push((session_id, request));
        self.signatures
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| stream::pending().boxed())
    }
}

fn state_of(session_id: DeviceSessionId, device_status: DeviceStatus) -> DeviceSessionState {
    DeviceSessionState {
        session_id,
        device_status,
        device_name: Some("Yubico YubiKey OTP+FIDO+CCID 00 00".to_string()),
    }
}

fn device() -> DiscoveredDevice {
    DiscoveredDevice {
        id: DeviceId::new("Yubico YubiKey OTP+FIDO+CCID 00 00"),
        name: "Yubico YubiKey OTP+FIDO+CCID 00 00".to_string(),
    }
}

fn address(value: &str) -> GetAddressOutput {
    GetAddressOutput {
        address: value.to_string(),
        public_key: "0x04".to_string(),
    }
}

fn adapter(script: &Arc<Script>) -> (Adapter, UnboundedReceiver<WorkshopEvent>) {
    let collaborators = Collaborators {
        directory: script.clone(),
        sessions: script.clone(),
        actions: script.clone(),
    };
    Adapter::new(collaborators, &WorkshopConfig::default())
}

/// Applies events until `done` holds.
async fn settle(
    adapter: &mut Adapter,
    events: &mut UnboundedReceiver<WorkshopEvent>,
    done: impl Fn(&WorkshopState) -> bool,
) {
    timeout(Duration::from_secs(5), async {
        while !done(adapter.state()) {
            let event = events.recv().await.expect("event channel closed");
            adapter.apply(event);
        }
    })
    .await
    .expect("adapter did not settle");
}

/// Applies events until none arrive for a while.
async fn drain(adapter: &mut Adapter, events: &mut UnboundedReceiver<WorkshopEvent>) {
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        adapter.apply(event);
    }
}

/// Connects and waits for the first session state.
async fn connected(
    script: &Arc<Script>,
) -> (Adapter, UnboundedReceiver<WorkshopEvent>, DeviceSessionId) {
    script.discovery(vec![Ok(device())]);
    let (mut adapter, mut events) = adapter(script);
    adapter.discover_and_connect();
    settle(&mut adapter, &mut events, |s| s.session_state.is_some()).await;
    let session_id = adapter.state().session_id.expect("connected");
    (adapter, events, session_id)
}

#[tokio::test]
async fn discover_and_connect_opens_session() {
    let script = Arc::new(Script::default());
    let session_id = DeviceSessionId::new();
    script.discovery(vec![Ok(device())]).connect(Ok(session_id));

    let (mut adapter, mut events) = adapter(&script);
    assert!(!adapter.state().can_start(ActionKind::GetAddress));

    adapter.discover_and_connect();
    assert!(adapter.state().connecting);
    settle(&mut adapter, &mut events, |s| s.session_state.is_some()).await;

    let state = adapter.state();
    assert!(!state.connecting);
    assert_eq!(state.session_id, Some(session_id));
    assert_eq!(state.connection_error, None);
    assert_eq!(
        state.session_state,
        Some(state_of(session_id, DeviceStatus::Connected))
    );
    assert!(state.can_start(ActionKind::GetAddress));
    assert!(state.can_start(ActionKind::SignTransaction));
}

#[tokio::test]
async fn discovery_error_sets_connection_error_then_retry_clears_it() {
    let script = Arc::new(Script::default());
    script
        .discovery(vec![Err(Error::DiscoveryTimeout(Duration::from_secs(30)))])
        .discovery(vec![Ok(device())]);

    let (mut adapter, mut events) = adapter(&script);
    adapter.discover_and_connect();
    settle(&mut adapter, &mut events, |s| !s.connecting).await;

    let err = adapter.state().connection_error.clone().expect("connection error");
    assert_eq!(err.stage, ConnectionStage::Discovery);
    assert!(err.message.contains("no YubiKey device discovered"));
    assert_eq!(adapter.state().session_id, None);
    assert!(!adapter.state().can_start(ActionKind::GetAddress));

    adapter.discover_and_connect();
    settle(&mut adapter, &mut events, |s| !s.connecting).await;
    assert!(adapter.state().session_id.is_some());
    assert_eq!(adapter.state().connection_error, None);
}

#[tokio::test]
async fn rejected_connect_reports_connect_stage() {
    let script = Arc::new(Script::default());
    script
        .discovery(vec![Ok(device())])
        .connect(Err(Error::ConnectionFailed("sharing violation".to_string())));

    let (mut adapter, mut events) = adapter(&script);
    adapter.discover_and_connect();
    settle(&mut adapter, &mut events, |s| !s.connecting).await;

    let err = adapter.state().connection_error.clone().expect("connection error");
    assert_eq!(err.stage, ConnectionStage::Connect);
    assert_eq!(err.code, ErrorCode::Communication);
    assert_eq!(adapter.state().session_id, None);
}

#[tokio::test]
async fn reconnect_clears_previous_session() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, first) = connected(&script).await;

    script.discovery(vec![Err(Error::DeviceNotFound)]);
    adapter.discover_and_connect();
    assert_eq!(adapter.state().session_id, None);
    assert_eq!(adapter.state().session_state, None);

    settle(&mut adapter, &mut events, |s| !s.connecting).await;
    assert_eq!(adapter.state().session_id, None);
    assert!(adapter.state().connection_error.is_some());

    // late state of the old session
    adapter.apply(WorkshopEvent::SessionState(state_of(first, DeviceStatus::Busy)));
    assert_eq!(adapter.state().session_state, None);
}

#[tokio::test]
async fn get_address_pending_then_completed() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, session_id) = connected(&script).await;
    script.address_stream(vec![
        DeviceActionState::Pending(ActionStep::Processing),
        DeviceActionState::Completed(address("0xABC...")),
    ]);

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request).unwrap();
    assert!(adapter.state().get_address.is_loading());
    settle(&mut adapter, &mut events, |s| !s.get_address.is_loading()).await;

    let state = adapter.state();
    assert!(!state.get_address.is_loading());
    assert_eq!(state.get_address.output().map(|o| o.address.as_str()), Some("0xABC..."));
    assert_eq!(state.get_address.error(), None);

    let calls = script.address_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, session_id);
    assert_eq!(calls[0].1.derivation_path, "44'/60'/0'/0");
}

#[tokio::test]
async fn sign_transaction_denied_goes_to_its_own_slot() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, _) = connected(&script).await;
    script.sign_stream(vec![DeviceActionState::Error(ActionError::new(
        ErrorCode::Denied,
        "operation denied by the device",
    ))]);

    adapter
        .start(ActionRequest::SignTransaction {
            derivation_path: "44'/60'/0'/0".to_string(),
            transaction: EIP155_PAYLOAD.to_string(),
        })
        .unwrap();
    settle(&mut adapter, &mut events, |s| !s.sign_transaction.is_loading()).await;

    let state = adapter.state();
    assert_eq!(state.sign_transaction.output(), None);
    assert_eq!(
        state.sign_transaction.error().map(|e| e.code),
        Some(ErrorCode::Denied)
    );
    assert_eq!(state.get_address, Invocation::Idle);
    assert_eq!(script.sign_calls(), 1);
}

#[tokio::test]
async fn start_is_rejected_while_same_kind_is_loading() {
    let script = Arc::new(Script::default());
    let (mut adapter, _events, _) = connected(&script).await;

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request.clone()).unwrap();
    assert!(!adapter.state().can_start(ActionKind::GetAddress));
    assert_eq!(
        adapter.start(request),
        Err(Rejected::AlreadyLoading(ActionKind::GetAddress))
    );
    assert_eq!(script.address_calls().len(), 1);
    assert!(adapter.state().can_start(ActionKind::SignTransaction));
}

#[tokio::test]
async fn start_without_session_is_rejected() {
    let script = Arc::new(Script::default());
    let (mut adapter, _events) = adapter(&script);

    let request = adapter.request(ActionKind::GetAddress);
    assert_eq!(adapter.start(request), Err(Rejected::NoSession));
    assert_eq!(adapter.state().get_address, Invocation::Idle);
    assert!(script.address_calls().is_empty());
}

#[tokio::test]
async fn first_terminal_emission_wins() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, _) = connected(&script).await;
    script.address_stream(vec![
        DeviceActionState::Completed(address("0xA")),
        DeviceActionState::Error(ActionError::new(ErrorCode::Denied, "late")),
        DeviceActionState::Completed(address("0xB")),
    ]);

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request).unwrap();
    drain(&mut adapter, &mut events).await;

    let state = adapter.state();
    assert_eq!(state.get_address.output(), Some(&address("0xA")));
    assert_eq!(state.get_address.error(), None);
}

#[tokio::test]
async fn stream_ending_without_terminal_stops_loading() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, _) = connected(&script).await;
    script.address_stream(vec![DeviceActionState::Pending(ActionStep::Processing)]);

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request).unwrap();
    settle(&mut adapter, &mut events, |s| !s.get_address.is_loading()).await;

    assert_eq!(adapter.state().get_address, Invocation::Idle);
    assert!(adapter.state().can_start(ActionKind::GetAddress));
}

#[tokio::test]
async fn undecodable_transaction_fails_without_submitting() {
    let script = Arc::new(Script::default());
    let (mut adapter, _events, _) = connected(&script).await;

    adapter.set_transaction("0xnot-rlp");
    let request = adapter.request(ActionKind::SignTransaction);
    adapter.start(request).unwrap();

    let state = adapter.state();
    assert!(!state.sign_transaction.is_loading());
    assert_eq!(
        state.sign_transaction.error().map(|e| e.code),
        Some(ErrorCode::InvalidTransaction)
    );
    assert_eq!(script.sign_calls(), 0);
}

#[tokio::test]
async fn new_start_resets_previous_result() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, _) = connected(&script).await;
    script
        .address_stream(vec![DeviceActionState::Error(ActionError::new(
            ErrorCode::SlotEmpty,
            "PIV slot 0x9a is empty",
        ))])
        .address_stream(vec![DeviceActionState::Completed(address("0xABC"))]);

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request.clone()).unwrap();
    settle(&mut adapter, &mut events, |s| !s.get_address.is_loading()).await;
    assert!(adapter.state().get_address.error().is_some());

    adapter.start(request).unwrap();
    assert_eq!(adapter.state().get_address, Invocation::Loading(None));
    settle(&mut adapter, &mut events, |s| !s.get_address.is_loading()).await;
    assert_eq!(adapter.state().get_address.output(), Some(&address("0xABC")));
    assert_eq!(adapter.state().get_address.error(), None);
}

#[tokio::test]
async fn stale_events_are_dropped() {
    let script = Arc::new(Script::default());
    let (mut adapter, _events, session_id) = connected(&script).await;

    let other = DeviceSessionId::new();
    adapter.apply(WorkshopEvent::SessionState(state_of(other, DeviceStatus::NotConnected)));
    assert_eq!(
        adapter.state().session_state,
        Some(state_of(session_id, DeviceStatus::Connected))
    );

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request).unwrap();

    // another session
    adapter.apply(WorkshopEvent::GetAddress(ActionEvent {
        session_id: other,
        invocation: 1,
        update: ActionUpdate::State(DeviceActionState::Completed(address("0xSTALE"))),
    }));
    // an older invocation on this session
    adapter.apply(WorkshopEvent::GetAddress(ActionEvent {
        session_id,
        invocation: 0,
        update: ActionUpdate::StreamEnded,
    }));
    assert_eq!(adapter.state().get_address, Invocation::Loading(None));
}

#[tokio::test]
async fn changing_session_releases_loading_actions() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, first) = connected(&script).await;

    let request = adapter.request(ActionKind::GetAddress);
    adapter.start(request).unwrap();
    assert!(adapter.state().get_address.is_loading());

    script.discovery(vec![Ok(device())]);
    adapter.discover_and_connect();
    assert_eq!(adapter.state().get_address, Invocation::Idle);

    settle(&mut adapter, &mut events, |s| s.session_state.is_some()).await;
    let second = adapter.state().session_id.expect("connected");
    assert_ne!(first, second);
    assert!(adapter.state().can_start(ActionKind::GetAddress));
}

#[tokio::test]
async fn actions_wait_for_connected_status() {
    let script = Arc::new(Script::default());
    script.report(DeviceStatus::NotConnected);
    let (mut adapter, _events, session_id) = connected(&script).await;

    assert!(!adapter.state().is_ready());
    assert!(!adapter.state().can_start(ActionKind::GetAddress));
    let request = adapter.request(ActionKind::GetAddress);
    assert_eq!(adapter.start(request.clone()), Err(Rejected::DeviceNotReady));
    assert_eq!(adapter.state().get_address, Invocation::Idle);
    assert!(script.address_calls().is_empty());

    adapter.apply(WorkshopEvent::SessionState(state_of(session_id, DeviceStatus::Connected)));
    adapter.start(request).unwrap();
    assert_eq!(script.address_calls().len(), 1);

    // the card is held by the running action
    adapter.apply(WorkshopEvent::SessionState(state_of(session_id, DeviceStatus::Busy)));
    assert!(!adapter.state().can_start(ActionKind::SignTransaction));
    let request = adapter.request(ActionKind::SignTransaction);
    assert_eq!(adapter.start(request), Err(Rejected::DeviceNotReady));
    assert_eq!(script.sign_calls(), 0);
}

#[tokio::test]
async fn reconnecting_disconnects_the_previous_session() {
    let script = Arc::new(Script::default());
    let (mut adapter, mut events, first) = connected(&script).await;

    script.discovery(vec![Ok(device())]);
    adapter.discover_and_connect();
    settle(&mut adapter, &mut events, |s| s.session_state.is_some()).await;
    let second = adapter.state().session_id.expect("connected");

    script.discovery(vec![Ok(device())]);
    adapter.discover_and_connect();
    settle(&mut adapter, &mut events, |s| s.session_state.is_some()).await;
    let third = adapter.state().session_id.expect("connected");

    timeout(Duration::from_secs(5), async {
        while script.disconnects().len() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("previous sessions were not disconnected");

    assert_eq!(script.disconnects(), vec![first, second]);
    assert!(!script.disconnects().contains(&third));
}

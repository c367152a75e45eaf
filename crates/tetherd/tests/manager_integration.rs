//! Integration tests for the connection manager.
//!
//! Drives a real `ManagerActor` through its `ManagerHandle`, with scripted
//! stream and RPC connectors standing in for the network. Each connect
//! attempt hands the test the far end of the transport so it can play the
//! peer.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

use tether_core::{
    ActivateOutcome, CallDescriptor, ConfigureOutcome, ConnectionEvent, ControlOutcome, EventKind,
    ManagerSettings, MessageRecord, NetworkSettings, Payload, ProtocolKind, ProxyProfile,
    ProxySettings, RecordKind, SendOutcome, SessionConfig, SessionId, SessionSpec, SessionState,
    Settings, SubscriptionQuery,
    CLOSE_GOING_AWAY, CLOSE_INACTIVITY, CLOSE_NORMAL,
};
use tetherd::manager::{spawn_manager, ManagerError, ManagerHandle};
use tetherd::transport::{
    CallRequest, ChannelRequest, Connectors, Inbound, Outbound, RpcCall, RpcChannel,
    RpcConnector, RpcEvent, StreamConnector, StreamLink, StreamRequest, TransportError,
};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on waiting for anything asynchronous to happen
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between status polls
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait before concluding that something did NOT happen
const QUIET_PERIOD: Duration = Duration::from_millis(150);

// ============================================================================
// Scripted stream connector
// ============================================================================

/// The far end of one stream connect attempt.
struct MockPeer {
    request: StreamRequest,
    /// Frames the manager writes
    outbound: mpsc::Receiver<Outbound>,
    /// Frames the peer delivers to the manager
    inbound: mpsc::Sender<Inbound>,
}

impl MockPeer {
    async fn next_frame(&mut self) -> Outbound {
        timeout(WAIT_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("outbound channel closed")
    }

    async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            Outbound::Text(text) => serde_json::from_str(&text).expect("frame is not JSON"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    async fn deliver(&self, inbound: Inbound) {
        self.inbound.send(inbound).await.expect("manager side dropped");
    }

    async fn deliver_json(&self, value: Value) {
        self.deliver(Inbound::Text(value.to_string())).await;
    }
}

struct MockStreamConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
}

#[async_trait]
impl StreamConnector for MockStreamConnector {
    async fn connect(&self, request: StreamRequest) -> Result<StreamLink, TransportError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let protocol = request.subprotocols.first().cloned();
        let peer = MockPeer {
            request,
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        self.peers.send(peer).map_err(|_| TransportError::Closed)?;
        Ok(StreamLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            protocol,
        })
    }
}

// ============================================================================
// Scripted RPC connector
// ============================================================================

/// The far end of one started call.
struct MockCall {
    request: CallRequest,
    requests: mpsc::Receiver<Value>,
    responses: mpsc::Sender<RpcEvent>,
}

impl MockCall {
    async fn next_request(&mut self) -> Option<Value> {
        timeout(WAIT_TIMEOUT, self.requests.recv())
            .await
            .expect("timed out waiting for a request")
    }

    async fn respond(&self, event: RpcEvent) {
        self.responses.send(event).await.expect("call task dropped");
    }
}

struct MockRpcConnector {
    /// When false, channels never become ready
    reachable: bool,
    calls: mpsc::UnboundedSender<MockCall>,
}

struct MockChannel {
    reachable: bool,
    calls: mpsc::UnboundedSender<MockCall>,
}

#[async_trait]
impl RpcConnector for MockRpcConnector {
    async fn channel(&self, _request: ChannelRequest) -> Result<Box<dyn RpcChannel>, TransportError> {
        Ok(Box::new(MockChannel {
            reachable: self.reachable,
            calls: self.calls.clone(),
        }))
    }
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn ready(&mut self) -> Result<(), TransportError> {
        if !self.reachable {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start_call(self: Box<Self>, request: CallRequest) -> Result<RpcCall, TransportError> {
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (responses_tx, responses_rx) = mpsc::channel(64);
        let call = MockCall {
            request,
            requests: requests_rx,
            responses: responses_tx,
        };
        self.calls.send(call).map_err(|_| TransportError::Closed)?;
        Ok(RpcCall {
            requests: requests_tx,
            responses: responses_rx,
        })
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    manager: ManagerHandle,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    calls: mpsc::UnboundedReceiver<MockCall>,
}

impl Harness {
    async fn next_peer(&mut self) -> MockPeer {
        timeout(WAIT_TIMEOUT, self.peers.recv())
            .await
            .expect("timed out waiting for a connect attempt")
            .expect("connector dropped")
    }

    async fn next_call(&mut self) -> MockCall {
        timeout(WAIT_TIMEOUT, self.calls.recv())
            .await
            .expect("timed out waiting for a call")
            .expect("connector dropped")
    }

    /// Asserts that no new stream connect attempt happens.
    async fn assert_no_connect(&mut self) {
        let attempt = timeout(QUIET_PERIOD, self.peers.recv()).await;
        assert!(attempt.is_err(), "unexpected connect attempt");
    }
}

fn test_settings() -> Settings {
    Settings {
        manager: ManagerSettings {
            resubscribe_grace_ms: 20,
            ..ManagerSettings::default()
        },
        network: NetworkSettings {
            connect_timeout_ms: 500,
            ..NetworkSettings::default()
        },
    }
}

fn harness_with(settings: Settings, reachable: bool) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let connectors = Connectors::new(
        Arc::new(MockStreamConnector { peers: peers_tx }),
        Arc::new(MockRpcConnector {
            reachable,
            calls: calls_tx,
        }),
    );
    Harness {
        manager: spawn_manager(settings, connectors),
        peers,
        calls,
    }
}

fn harness() -> Harness {
    harness_with(test_settings(), true)
}

fn stream_spec() -> SessionSpec {
    SessionSpec::new(
        ProtocolKind::Stream,
        "wss://echo.example.com/socket",
        SessionConfig::default(),
    )
}

fn rpc_spec(kind: ProtocolKind) -> SessionSpec {
    SessionSpec::new(
        kind,
        "api.example.com:50051",
        SessionConfig {
            call: Some(CallDescriptor::new("helloworld.Greeter", "SayHello")),
            ..SessionConfig::default()
        },
    )
}

fn subscription_spec() -> SessionSpec {
    SessionSpec::new(
        ProtocolKind::Subscription,
        "wss://graphql.example.com/graphql",
        SessionConfig {
            subscription: Some(SubscriptionQuery::new("subscription { ticks }")),
            ..SessionConfig::default()
        },
    )
}

async fn configure(manager: &ManagerHandle, spec: SessionSpec) -> SessionId {
    match manager.configure(spec).await.expect("configure failed") {
        ConfigureOutcome::Created { session_id } => session_id,
        other => panic!("expected a created session, got {other:?}"),
    }
}

/// Polls status until the session reaches `state`.
async fn wait_for_state(manager: &ManagerHandle, id: &SessionId, state: SessionState) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let current = manager.status(id.clone()).await.map(|view| view.state);
        if matches!(current, Ok(seen) if seen == state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session {id} never reached {state:?}, last seen {current:?}");
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Polls status until the session is gone.
async fn wait_for_purge(manager: &ManagerHandle, id: &SessionId) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Err(ManagerError::NotFound(_)) = manager.status(id.clone()).await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session {id} was never purged");
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Polls the Message Log until a record of `kind` appears.
async fn wait_for_record(manager: &ManagerHandle, id: &SessionId, kind: RecordKind) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if records(manager, id).await.iter().any(|r| r.kind == kind) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session {id} never recorded {kind:?}");
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn records(manager: &ManagerHandle, id: &SessionId) -> Vec<MessageRecord> {
    manager.records(id.clone(), None).await.expect("records failed")
}

fn kinds(records: &[MessageRecord]) -> Vec<RecordKind> {
    records.iter().map(|r| r.kind).collect()
}

/// Collects every event currently queued for `id`.
fn drain_events(rx: &mut broadcast::Receiver<ConnectionEvent>, id: &SessionId) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if &event.session_id == id {
            events.push(event);
        }
    }
    events
}

/// Opens a stream session and returns its id and peer.
async fn open_stream(h: &mut Harness) -> (SessionId, MockPeer) {
    let id = configure(&h.manager, stream_spec()).await;
    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert_eq!(outcome, ActivateOutcome::Connecting);
    let peer = h.next_peer().await;
    wait_for_state(&h.manager, &id, SessionState::Open).await;
    (id, peer)
}

/// Opens a subscription session through the connection_ack handshake.
async fn open_subscription(h: &mut Harness, id: &SessionId) -> MockPeer {
    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert_eq!(outcome, ActivateOutcome::Connecting);
    let mut peer = h.next_peer().await;

    let init = peer.next_json().await;
    assert_eq!(init["type"], "connection_init");
    peer.deliver_json(json!({"type": "connection_ack"})).await;

    let subscribe = peer.next_json().await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["id"], id.as_str());
    wait_for_state(&h.manager, id, SessionState::Open).await;
    peer
}

// ============================================================================
// Stream sessions
// ============================================================================

#[tokio::test]
async fn test_stream_open_close_then_activate_replays() {
    let mut h = harness();
    let (id, mut peer) = open_stream(&mut h).await;

    assert_eq!(peer.request.url, "wss://echo.example.com/socket");
    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
    assert_eq!(view.buffered_records, 1);

    let closed = h.manager.close(id.clone(), Some("user".to_string())).await.unwrap();
    assert_eq!(closed, ControlOutcome::Applied);
    assert_eq!(
        peer.next_frame().await,
        Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "user".to_string()
        }
    );

    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Closed);
    assert!(view.explicitly_closed);

    let mut events = h.manager.subscribe();
    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert_eq!(outcome, ActivateOutcome::ClosedWithHistory { replayed: 2 });
    h.assert_no_connect().await;

    let replayed = drain_events(&mut events, &id);
    let replayed_kinds: Vec<EventKind> = replayed.iter().map(|e| e.kind).collect();
    assert_eq!(replayed_kinds, vec![EventKind::Opened, EventKind::Closed]);
    assert!(replayed.iter().all(|e| e.is_replayed));
}

#[tokio::test]
async fn test_stream_send_and_receive_are_recorded() {
    let mut h = harness();
    let (id, mut peer) = open_stream(&mut h).await;

    let sent = h.manager.send(id.clone(), Payload::from("hello")).await.unwrap();
    assert_eq!(sent, SendOutcome::Sent);
    assert_eq!(peer.next_frame().await, Outbound::Text("hello".to_string()));

    peer.deliver(Inbound::Text("world".to_string())).await;
    sleep(QUIET_PERIOD).await;

    let log = records(&h.manager, &id).await;
    assert_eq!(
        kinds(&log),
        vec![RecordKind::Open, RecordKind::DataOut, RecordKind::DataIn]
    );
    assert_eq!(log[2].payload, Payload::Text("world".to_string()));
}

#[tokio::test]
async fn test_stream_send_on_full_buffer_is_not_recorded() {
    let settings = Settings {
        manager: ManagerSettings {
            log_capacity: 200,
            ..test_settings().manager
        },
        ..test_settings()
    };
    let mut h = harness_with(settings, true);
    let (id, mut peer) = open_stream(&mut h).await;

    // The scripted transport buffers 64 frames and the peer reads none
    for n in 0..64 {
        let sent = h.manager.send(id.clone(), Payload::from(format!("m{n}"))).await;
        assert_eq!(sent.unwrap(), SendOutcome::Sent);
    }
    let overflow = h.manager.send(id.clone(), Payload::from("dropped")).await;
    assert!(matches!(overflow, Err(ManagerError::Transport(_))), "got {overflow:?}");

    let log = records(&h.manager, &id).await;
    let sent = log.iter().filter(|r| r.kind == RecordKind::DataOut).count();
    assert_eq!(sent, 64);
    assert!(!log.iter().any(|r| r.payload == Payload::from("dropped")));

    // Every recorded frame actually reached the peer
    for n in 0..64 {
        assert_eq!(peer.next_frame().await, Outbound::Text(format!("m{n}")));
    }
    let view = h.manager.status(id).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
}

#[tokio::test]
async fn test_stream_send_before_open_is_invalid_state() {
    let h = harness();
    let id = configure(&h.manager, stream_spec()).await;

    let result = h.manager.send(id, Payload::from("early")).await;
    assert!(matches!(
        result,
        Err(ManagerError::InvalidState {
            state: SessionState::Configured,
            ..
        })
    ));
}

#[tokio::test]
async fn test_pause_drops_inbound_and_resume_reopens() {
    let mut h = harness();
    let (id, mut peer) = open_stream(&mut h).await;

    let paused = h.manager.pause(id.clone(), "user").await.unwrap();
    assert_eq!(paused, ControlOutcome::Applied);

    // Pausing twice is a no-op
    let again = h.manager.pause(id.clone(), "user").await.unwrap();
    assert_eq!(
        again,
        ControlOutcome::NoOp {
            state: SessionState::Paused
        }
    );

    // Sending while paused is rejected
    let result = h.manager.send(id.clone(), Payload::from("x")).await;
    assert!(matches!(result, Err(ManagerError::InvalidState { .. })));

    // Inbound data while paused is dropped
    peer.deliver(Inbound::Text("dropped".to_string())).await;
    sleep(QUIET_PERIOD).await;
    assert_eq!(
        kinds(&records(&h.manager, &id).await),
        vec![RecordKind::Open, RecordKind::Pause]
    );

    let resumed = h.manager.resume(id.clone()).await.unwrap();
    assert_eq!(resumed, ControlOutcome::Applied);
    assert_eq!(
        kinds(&records(&h.manager, &id).await),
        vec![RecordKind::Open, RecordKind::Pause, RecordKind::Open]
    );

    h.manager.send(id.clone(), Payload::from("after")).await.unwrap();
    assert_eq!(peer.next_frame().await, Outbound::Text("after".to_string()));
}

#[tokio::test]
async fn test_resume_after_peer_close_is_noop() {
    let mut h = harness();
    let (id, peer) = open_stream(&mut h).await;

    h.manager.pause(id.clone(), "user").await.unwrap();
    peer.deliver(Inbound::Closed {
        code: Some(1001),
        reason: "server restart".to_string(),
    })
    .await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    let resumed = h.manager.resume(id.clone()).await.unwrap();
    assert_eq!(
        resumed,
        ControlOutcome::NoOp {
            state: SessionState::Closed
        }
    );
}

#[tokio::test]
async fn test_peer_close_allows_reconnect() {
    let mut h = harness();
    let (id, peer) = open_stream(&mut h).await;

    peer.deliver(Inbound::Closed {
        code: Some(1000),
        reason: "bye".to_string(),
    })
    .await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    let view = h.manager.status(id.clone()).await.unwrap();
    assert!(!view.explicitly_closed);

    // Not an explicit close: activate opens a fresh transport
    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert_eq!(outcome, ActivateOutcome::Connecting);
    let _second = h.next_peer().await;
    wait_for_state(&h.manager, &id, SessionState::Open).await;

    assert_eq!(
        kinds(&records(&h.manager, &id).await),
        vec![RecordKind::Open, RecordKind::Close, RecordKind::Open]
    );
}

#[tokio::test]
async fn test_activate_open_session_attaches_without_reconnect() {
    let mut h = harness();
    let (id, _peer) = open_stream(&mut h).await;

    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert_eq!(
        outcome,
        ActivateOutcome::Attached {
            state: SessionState::Open,
            replayed: 1
        }
    );
    h.assert_no_connect().await;
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let mut h = harness();
    let (id, _peer) = open_stream(&mut h).await;
    h.manager.send(id.clone(), Payload::from("one")).await.unwrap();
    h.manager.close(id.clone(), None).await.unwrap();

    let mut events = h.manager.subscribe();
    h.manager.activate(id.clone()).await.unwrap();
    let first = drain_events(&mut events, &id);
    h.manager.activate(id.clone()).await.unwrap();
    let second = drain_events(&mut events, &id);

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(records(&h.manager, &id).await.len(), 3);
}

#[tokio::test]
async fn test_clear_closed_state_allows_reconnect() {
    let mut h = harness();
    let (id, _peer) = open_stream(&mut h).await;
    h.manager.close(id.clone(), None).await.unwrap();

    let cleared = h.manager.clear_closed_state(id.clone()).await.unwrap();
    assert_eq!(cleared, ControlOutcome::Applied);

    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert_eq!(outcome, ActivateOutcome::Connecting);
    let _peer = h.next_peer().await;
    wait_for_state(&h.manager, &id, SessionState::Open).await;
}

#[tokio::test]
async fn test_connect_failure_records_error() {
    struct RefusingConnector;

    #[async_trait]
    impl StreamConnector for RefusingConnector {
        async fn connect(&self, _request: StreamRequest) -> Result<StreamLink, TransportError> {
            Err(TransportError::Connect("connection refused".to_string()))
        }
    }

    let (calls_tx, _calls) = mpsc::unbounded_channel();
    let connectors = Connectors::new(
        Arc::new(RefusingConnector),
        Arc::new(MockRpcConnector {
            reachable: true,
            calls: calls_tx,
        }),
    );
    let manager = spawn_manager(test_settings(), connectors);

    let id = configure(&manager, stream_spec()).await;
    manager.activate(id.clone()).await.unwrap();
    wait_for_state(&manager, &id, SessionState::Closed).await;

    let log = records(&manager, &id).await;
    assert_eq!(kinds(&log), vec![RecordKind::Error, RecordKind::Close]);
    assert!(!manager.status(id).await.unwrap().explicitly_closed);
}

#[tokio::test]
async fn test_dedup_suppresses_repeat_configure() {
    let h = harness();
    let spec = SessionSpec::new(
        ProtocolKind::Stream,
        "wss://echo.example.com/socket",
        SessionConfig {
            dedup_key: Some("open-echo".to_string()),
            ..SessionConfig::default()
        },
    );

    let first = h.manager.configure(spec.clone()).await.unwrap();
    assert!(first.session_id().is_some());

    let second = h.manager.configure(spec).await.unwrap();
    assert_eq!(
        second,
        ConfigureOutcome::Duplicate {
            key: "open-echo".to_string()
        }
    );
    assert_eq!(h.manager.list().await.len(), 1);
}

#[tokio::test]
async fn test_network_settings_apply_to_next_connect() {
    let mut h = harness();
    let (id, first) = open_stream(&mut h).await;
    assert!(first.request.resolution.proxy.is_none());
    assert!(!first.request.resolution.tls_bypass);

    first
        .deliver(Inbound::Closed {
            code: None,
            reason: "gone".to_string(),
        })
        .await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    let settings = NetworkSettings {
        connect_timeout_ms: 500,
        validate_certificates: false,
        proxy: ProxySettings {
            enabled: true,
            active_profile: Some("corp".to_string()),
            profiles: vec![ProxyProfile {
                id: "corp".to_string(),
                name: "Corporate".to_string(),
                scheme: "http".to_string(),
                host: "proxy.corp".to_string(),
                port: 3128,
                auth: None,
                excluded_domains: vec!["*.internal".to_string()],
            }],
        },
    };
    h.manager.update_network_settings(settings).await.unwrap();

    h.manager.activate(id.clone()).await.unwrap();
    let second = h.next_peer().await;
    let proxy = second
        .request
        .resolution
        .proxy
        .as_ref()
        .expect("second connect should use the proxy");
    assert_eq!(proxy.authority(), "proxy.corp:3128");
    assert!(second.request.resolution.tls_bypass);
}

// ============================================================================
// Sweep and purge
// ============================================================================

#[tokio::test]
async fn test_idle_session_is_reaped_then_purged() {
    let settings = Settings {
        manager: ManagerSettings {
            sweep_interval_ms: 50,
            inactivity_threshold_ms: 100,
            purge_grace_ms: 300,
            ..ManagerSettings::default()
        },
        ..test_settings()
    };
    let mut h = harness_with(settings, true);
    let (id, mut peer) = open_stream(&mut h).await;

    assert_eq!(
        peer.next_frame().await,
        Outbound::Close {
            code: 4000,
            reason: "inactivity timeout".to_string()
        }
    );
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    let log = records(&h.manager, &id).await;
    assert_eq!(log.last().map(|r| r.kind), Some(RecordKind::Close));

    wait_for_purge(&h.manager, &id).await;
    assert!(matches!(
        h.manager.records(id, None).await,
        Err(ManagerError::NotFound(_))
    ));
}

/// Sweeps every 50ms, reaps after 150ms idle, purges 400ms later.
fn reaping_settings() -> Settings {
    Settings {
        manager: ManagerSettings {
            sweep_interval_ms: 50,
            inactivity_threshold_ms: 150,
            purge_grace_ms: 400,
            ..ManagerSettings::default()
        },
        ..test_settings()
    }
}

fn is_inactivity_close(record: &MessageRecord) -> bool {
    record.kind == RecordKind::Close
        && matches!(
            &record.payload,
            Payload::Reason { code: Some(code), .. } if *code == CLOSE_INACTIVITY
        )
}

#[tokio::test]
async fn test_idle_bidi_call_is_aborted_then_purged() {
    let mut h = harness_with(reaping_settings(), true);
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcBidiStream)).await;

    h.manager.send(id.clone(), Payload::from("ping")).await.unwrap();
    let mut call = h.next_call().await;
    assert_eq!(call.next_request().await, Some(json!("ping")));

    // The reaper aborts the call task, which ends the request stream
    assert_eq!(call.next_request().await, None);
    assert!(call.responses.is_closed());

    wait_for_state(&h.manager, &id, SessionState::Closed).await;
    let log = records(&h.manager, &id).await;
    assert!(log.last().is_some_and(is_inactivity_close), "log: {log:?}");

    // History stays readable during the grace period
    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Closed);

    wait_for_purge(&h.manager, &id).await;
    assert!(matches!(
        h.manager.records(id, None).await,
        Err(ManagerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_idle_unary_call_cancels_waiting_caller() {
    let mut h = harness_with(reaping_settings(), true);
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcUnary)).await;

    let manager = h.manager.clone();
    let send_id = id.clone();
    let pending = tokio::spawn(async move { manager.send(send_id, Payload::from("slow")).await });

    let mut call = h.next_call().await;
    assert_eq!(call.next_request().await, Some(json!("slow")));

    let result = timeout(WAIT_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(ManagerError::Cancelled)), "got {result:?}");

    let log = records(&h.manager, &id).await;
    assert!(log.last().is_some_and(is_inactivity_close), "log: {log:?}");
    assert!(call.responses.is_closed());
}

#[tokio::test]
async fn test_idle_subscription_is_closed_with_inactivity_code() {
    let mut h = harness_with(reaping_settings(), true);
    let id = configure(&h.manager, subscription_spec()).await;
    let mut peer = open_subscription(&mut h, &id).await;

    assert_eq!(
        peer.next_frame().await,
        Outbound::Close {
            code: CLOSE_INACTIVITY,
            reason: "inactivity timeout".to_string()
        }
    );
    wait_for_state(&h.manager, &id, SessionState::Closed).await;
    let log = records(&h.manager, &id).await;
    assert!(log.last().is_some_and(is_inactivity_close), "log: {log:?}");
}

#[tokio::test]
async fn test_reconnect_cancels_pending_purge() {
    let settings = Settings {
        manager: ManagerSettings {
            purge_grace_ms: 200,
            ..ManagerSettings::default()
        },
        ..test_settings()
    };
    let mut h = harness_with(settings, true);
    let (id, peer) = open_stream(&mut h).await;

    peer.deliver(Inbound::Closed {
        code: None,
        reason: "gone".to_string(),
    })
    .await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    h.manager.activate(id.clone()).await.unwrap();
    let _second = h.next_peer().await;
    wait_for_state(&h.manager, &id, SessionState::Open).await;

    sleep(Duration::from_millis(400)).await;
    let view = h.manager.status(id).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
}

#[tokio::test]
async fn test_shutdown_closes_live_transports() {
    let mut h = harness();
    let (_id, mut peer) = open_stream(&mut h).await;

    h.manager.shutdown().await.unwrap();
    assert_eq!(
        peer.next_frame().await,
        Outbound::Close {
            code: CLOSE_GOING_AWAY,
            reason: "shutdown".to_string()
        }
    );

    sleep(QUIET_PERIOD).await;
    assert!(!h.manager.is_connected());
    assert!(h.manager.list().await.is_empty());
}

// ============================================================================
// RPC sessions
// ============================================================================

#[tokio::test]
async fn test_unary_call_returns_response() {
    let mut h = harness();
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcUnary)).await;

    let manager = h.manager.clone();
    let send_id = id.clone();
    let pending = tokio::spawn(async move {
        manager
            .send(send_id, Payload::Json(json!({"name": "tether"})))
            .await
    });

    let mut call = h.next_call().await;
    assert_eq!(call.request.descriptor.path(), "helloworld.Greeter/SayHello");
    assert_eq!(call.next_request().await, Some(json!({"name": "tether"})));
    // Unary requests are half-closed after the single message
    assert_eq!(call.next_request().await, None);

    call.respond(RpcEvent::Message(json!({"message": "Hello tether"}))).await;
    call.respond(RpcEvent::End).await;

    let outcome = timeout(WAIT_TIMEOUT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Response {
            payload: Payload::Json(json!({"message": "Hello tether"}))
        }
    );

    wait_for_state(&h.manager, &id, SessionState::Completed).await;
    assert_eq!(
        kinds(&records(&h.manager, &id).await),
        vec![
            RecordKind::DataOut,
            RecordKind::DataIn,
            RecordKind::Complete,
            RecordKind::Close
        ]
    );
}

#[tokio::test]
async fn test_unary_connect_timeout_records_one_error() {
    let settings = Settings {
        network: NetworkSettings {
            connect_timeout_ms: 100,
            ..NetworkSettings::default()
        },
        ..test_settings()
    };
    let h = harness_with(settings, false);
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcUnary)).await;

    let result = timeout(
        WAIT_TIMEOUT,
        h.manager.send(id.clone(), Payload::Json(json!({"name": "x"}))),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(ManagerError::ConnectTimeout(_))));

    let log = records(&h.manager, &id).await;
    let errors = log.iter().filter(|r| r.kind == RecordKind::Error).count();
    assert_eq!(errors, 1);
    assert_eq!(
        h.manager.status(id).await.unwrap().state,
        SessionState::Errored
    );
}

#[tokio::test]
async fn test_unary_error_status_fails_call() {
    let mut h = harness();
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcUnary)).await;

    let manager = h.manager.clone();
    let send_id = id.clone();
    let pending = tokio::spawn(async move { manager.send(send_id, Payload::Empty).await });

    let call = h.next_call().await;
    call.respond(RpcEvent::Status {
        code: 5,
        details: "not found".to_string(),
    })
    .await;

    let result = timeout(WAIT_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(ManagerError::Protocol { code: 5, .. })));
    wait_for_state(&h.manager, &id, SessionState::Errored).await;

    let log = records(&h.manager, &id).await;
    assert_eq!(
        log.iter().filter(|r| r.kind == RecordKind::Error).count(),
        1
    );
}

#[tokio::test]
async fn test_server_streaming_records_each_message() {
    let mut h = harness();
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcServerStream)).await;

    let sent = h.manager.send(id.clone(), Payload::from("{\"n\":2}")).await.unwrap();
    assert_eq!(sent, SendOutcome::Sent);

    let mut call = h.next_call().await;
    assert_eq!(call.next_request().await, Some(json!({"n": 2})));
    wait_for_state(&h.manager, &id, SessionState::Open).await;

    // A second request on a single-request call is rejected
    let again = h.manager.send(id.clone(), Payload::from("{}")).await;
    assert!(matches!(again, Err(ManagerError::InvalidState { .. })));

    call.respond(RpcEvent::Message(json!({"i": 1}))).await;
    call.respond(RpcEvent::Message(json!({"i": 2}))).await;
    call.respond(RpcEvent::End).await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    let log = records(&h.manager, &id).await;
    assert_eq!(
        log.iter().filter(|r| r.kind == RecordKind::DataIn).count(),
        2
    );
    assert_eq!(log.last().map(|r| r.kind), Some(RecordKind::Close));
}

#[tokio::test]
async fn test_client_streaming_end_half_closes() {
    let mut h = harness();
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcClientStream)).await;

    h.manager.send(id.clone(), Payload::Json(json!({"v": 1}))).await.unwrap();
    let mut call = h.next_call().await;
    assert_eq!(call.next_request().await, Some(json!({"v": 1})));
    wait_for_record(&h.manager, &id, RecordKind::Open).await;

    // Later writes reuse the open call
    h.manager.send(id.clone(), Payload::Json(json!({"v": 2}))).await.unwrap();
    assert_eq!(call.next_request().await, Some(json!({"v": 2})));

    let ended = h.manager.end(id.clone()).await.unwrap();
    assert_eq!(ended, ControlOutcome::Applied);
    assert_eq!(call.next_request().await, None);

    // Writing after the half-close is rejected
    let late = h.manager.send(id.clone(), Payload::Json(json!({"v": 3}))).await;
    assert!(matches!(late, Err(ManagerError::InvalidState { .. })));

    call.respond(RpcEvent::Message(json!({"sum": 3}))).await;
    call.respond(RpcEvent::End).await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    assert_eq!(
        kinds(&records(&h.manager, &id).await),
        vec![
            RecordKind::DataOut,
            RecordKind::Open,
            RecordKind::DataOut,
            RecordKind::DataIn,
            RecordKind::Complete,
            RecordKind::Close
        ]
    );
}

#[tokio::test]
async fn test_bidi_cancel_aborts_call() {
    let mut h = harness();
    let id = configure(&h.manager, rpc_spec(ProtocolKind::RpcBidiStream)).await;

    h.manager.send(id.clone(), Payload::from("ping")).await.unwrap();
    let mut call = h.next_call().await;
    assert_eq!(call.next_request().await, Some(json!("ping")));

    let cancelled = h.manager.cancel(id.clone()).await.unwrap();
    assert_eq!(cancelled, ControlOutcome::Applied);

    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Closed);
    assert!(!view.explicitly_closed);

    let log = records(&h.manager, &id).await;
    assert_eq!(log.last().map(|r| r.kind), Some(RecordKind::Cancel));

    // The call task is gone, so its request stream ends
    assert_eq!(call.next_request().await, None);
}

#[tokio::test]
async fn test_end_on_stream_is_noop() {
    let mut h = harness();
    let (id, _peer) = open_stream(&mut h).await;

    let outcome = h.manager.end(id).await.unwrap();
    assert_eq!(
        outcome,
        ControlOutcome::NoOp {
            state: SessionState::Open
        }
    );
}

// ============================================================================
// Subscription sessions
// ============================================================================

#[tokio::test]
async fn test_subscription_handshake_and_data() {
    let mut h = harness();
    let id = configure(&h.manager, subscription_spec()).await;
    let mut peer = open_subscription(&mut h, &id).await;

    assert!(peer
        .request
        .subprotocols
        .iter()
        .any(|p| p == "graphql-transport-ws"));

    peer.deliver_json(json!({
        "type": "next",
        "id": id.as_str(),
        "payload": {"data": {"ticks": 1}}
    }))
    .await;

    // Errors inside `next` are recorded but do not end the subscription
    peer.deliver_json(json!({
        "type": "next",
        "id": id.as_str(),
        "payload": {"errors": [{"message": "partial failure"}]}
    }))
    .await;

    peer.deliver_json(json!({"type": "ping"})).await;
    assert_eq!(peer.next_json().await["type"], "pong");

    sleep(QUIET_PERIOD).await;
    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Open);

    let log = records(&h.manager, &id).await;
    assert_eq!(
        kinds(&log),
        vec![
            RecordKind::Open,
            RecordKind::DataOut,
            RecordKind::DataIn,
            RecordKind::Error
        ]
    );
    assert_eq!(log[2].payload, Payload::Json(json!({"data": {"ticks": 1}})));
}

#[tokio::test]
async fn test_subscription_partial_result_keeps_data_and_errors() {
    let mut h = harness();
    let id = configure(&h.manager, subscription_spec()).await;
    let peer = open_subscription(&mut h, &id).await;

    let partial = json!({
        "data": {"ticks": 2},
        "errors": [{"message": "field resolver timed out"}]
    });
    peer.deliver_json(json!({"type": "next", "id": id.as_str(), "payload": partial.clone()}))
        .await;
    wait_for_record(&h.manager, &id, RecordKind::Error).await;

    let log = records(&h.manager, &id).await;
    assert_eq!(
        kinds(&log),
        vec![
            RecordKind::Open,
            RecordKind::DataOut,
            RecordKind::DataIn,
            RecordKind::Error
        ]
    );
    assert_eq!(log[2].payload, Payload::Json(partial));
    let info = log[3].error_info().expect("error record carries details");
    assert_eq!(
        info.details,
        Some(json!([{"message": "field resolver timed out"}]))
    );

    let view = h.manager.status(id).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
}

#[tokio::test]
async fn test_subscription_complete_finishes_session() {
    let mut h = harness();
    let id = configure(&h.manager, subscription_spec()).await;
    let peer = open_subscription(&mut h, &id).await;

    peer.deliver_json(json!({"type": "complete", "id": id.as_str()}))
        .await;
    wait_for_state(&h.manager, &id, SessionState::Completed).await;

    let log = records(&h.manager, &id).await;
    assert!(log.iter().any(|r| r.kind == RecordKind::Complete));

    // A completed subscription replays rather than reconnecting
    let outcome = h.manager.activate(id.clone()).await.unwrap();
    assert!(matches!(outcome, ActivateOutcome::Attached { .. }));
    h.assert_no_connect().await;
}

#[tokio::test]
async fn test_subscription_error_closes_session() {
    let mut h = harness();
    let id = configure(&h.manager, subscription_spec()).await;
    let peer = open_subscription(&mut h, &id).await;

    peer.deliver_json(json!({
        "type": "error",
        "id": id.as_str(),
        "payload": [{"message": "unauthorized"}]
    }))
    .await;
    wait_for_state(&h.manager, &id, SessionState::Closed).await;

    let log = records(&h.manager, &id).await;
    assert_eq!(
        log.iter().filter(|r| r.kind == RecordKind::Error).count(),
        1
    );
}

#[tokio::test]
async fn test_subscription_send_is_rejected() {
    let mut h = harness();
    let id = configure(&h.manager, subscription_spec()).await;
    let _peer = open_subscription(&mut h, &id).await;

    let result = h.manager.send(id, Payload::from("x")).await;
    assert!(matches!(result, Err(ManagerError::InvalidState { .. })));
}

#[tokio::test]
async fn test_resubscribe_closes_old_before_opening_new() {
    let mut h = harness();
    let mut events = h.manager.subscribe();

    let id = configure(&h.manager, subscription_spec()).await;
    let mut first = open_subscription(&mut h, &id).await;

    // Same target and query: the id is reused and the old one replaced
    let again = configure(&h.manager, subscription_spec()).await;
    assert_eq!(again, id);

    match first.next_frame().await {
        Outbound::Close { code, .. } => assert_eq!(code, 4001),
        other => panic!("expected a close frame, got {other:?}"),
    }

    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Configured);

    let _second = open_subscription(&mut h, &id).await;

    let seen: Vec<EventKind> = drain_events(&mut events, &id)
        .into_iter()
        .filter(|e| !e.is_replayed)
        .map(|e| e.kind)
        .collect();
    let closed_at = seen
        .iter()
        .position(|k| *k == EventKind::Closed)
        .expect("no close event");
    let reopened_at = seen
        .iter()
        .rposition(|k| *k == EventKind::Opened)
        .expect("no open event");
    assert!(closed_at < reopened_at, "events out of order: {seen:?}");
    assert_eq!(
        seen.iter().filter(|k| **k == EventKind::Opened).count(),
        2
    );
}

#[tokio::test]
async fn test_replaced_subscription_ignores_old_transport() {
    let mut h = harness();
    let id = configure(&h.manager, subscription_spec()).await;
    let mut first = open_subscription(&mut h, &id).await;

    assert_eq!(configure(&h.manager, subscription_spec()).await, id);
    assert!(matches!(first.next_frame().await, Outbound::Close { code: 4001, .. }));
    let _second = open_subscription(&mut h, &id).await;

    // Late traffic from the replaced socket must not touch the new session.
    // The old forwarder may already be gone, so delivery can fail.
    let _ = first
        .inbound
        .send(Inbound::Text(
            json!({"type": "next", "id": id.as_str(), "payload": {"data": {"stale": true}}})
                .to_string(),
        ))
        .await;
    let _ = first
        .inbound
        .send(Inbound::Closed {
            code: Some(1006),
            reason: "old socket dropped".to_string(),
        })
        .await;

    sleep(QUIET_PERIOD).await;
    let view = h.manager.status(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
    assert_eq!(
        kinds(&records(&h.manager, &id).await),
        vec![RecordKind::Open, RecordKind::DataOut]
    );
}

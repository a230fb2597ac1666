use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::StreamExt;
use serde_json::{json, Value};
use syncstage_sdk::clock::ManualClock;
use syncstage_sdk::retry::RetryPolicy;
use syncstage_sdk::stream::events::{ConnectivityDelegate, DesktopAgentDelegate, UserDelegate};
use syncstage_sdk::stream::proto::{Connection, Envelope, MessageType};
use syncstage_sdk::{
    CallError, CallOptions, ConnectionOptions, ConnectionState, SdkErrorCode, SyncStageBuilder,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const NOW_MS: u64 = 1_700_000_000_000;

#[derive(Clone, Debug)]
enum AgentAction {
    Push(Envelope),
    Close,
}

#[derive(Debug, Default)]
struct Script {
    silent: Mutex<HashSet<MessageType>>,
    provisioned: AtomicBool,
    /// Upgrade requests are answered with 503 while set.
    refusing: AtomicBool,
    connections: AtomicUsize,
    last_query: Mutex<Option<String>>,
}

impl Script {
    fn silence(&self, kind: MessageType) {
        self.silent.lock().expect("lock").insert(kind);
    }

    fn unsilence(&self, kind: MessageType) {
        self.silent.lock().expect("lock").remove(&kind);
    }

    fn refuse(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    fn is_silent(&self, kind: MessageType) -> bool {
        self.silent.lock().expect("lock").contains(&kind)
    }
}

#[derive(Clone)]
struct AgentState {
    script: Arc<Script>,
    received: mpsc::UnboundedSender<Envelope>,
    actions: broadcast::Sender<AgentAction>,
}

struct MockAgent {
    addr: SocketAddr,
    script: Arc<Script>,
    received: mpsc::UnboundedReceiver<Envelope>,
    actions: broadcast::Sender<AgentAction>,
    shutdown_tx: oneshot::Sender<()>,
    server_task: tokio::task::JoinHandle<()>,
}

impl MockAgent {
    async fn start() -> Self {
        let script = Arc::new(Script::default());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (actions, _) = broadcast::channel(16);
        let app = Router::new().route("/ws", get(ws_handler)).with_state(AgentState {
            script: Arc::clone(&script),
            received: received_tx,
            actions: actions.clone(),
        });
        let (addr, shutdown_tx, server_task) = spawn_server(app).await;
        Self {
            addr,
            script,
            received,
            actions,
            shutdown_tx,
            server_task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn push(&self, kind: MessageType, content: Value) {
        let _ = self
            .actions
            .send(AgentAction::Push(Envelope::new(kind, content)));
    }

    fn close_socket(&self) {
        let _ = self.actions.send(AgentAction::Close);
    }

    async fn next_of(&mut self, kind: MessageType) -> Envelope {
        timeout(WAIT, async {
            loop {
                let envelope = self.received.recv().await.expect("agent channel open");
                if envelope.kind == kind {
                    return envelope;
                }
            }
        })
        .await
        .expect("timed out waiting for client envelope")
    }

    /// Non-heartbeat envelopes received so far, in arrival order.
    fn drain_requests(&mut self) -> Vec<Envelope> {
        let mut requests = Vec::new();
        while let Ok(envelope) = self.received.try_recv() {
            if !envelope.kind.is_heartbeat() {
                requests.push(envelope);
            }
        }
        requests
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = timeout(WAIT, self.server_task).await;
    }
}

fn token_expiring_at(exp_secs: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"app","exp":{exp_secs}}}"#));
    format!("{header}.{claims}.c2ln")
}

fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        agent_ping_interval: Duration::from_millis(100),
        server_ping_interval: Duration::from_millis(100),
        liveness_check_interval: Duration::from_millis(50),
        suspend_tick: Duration::from_secs(3_600),
        reconnect_policy: RetryPolicy {
            max_attempts: usize::MAX,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            jitter: Duration::ZERO,
        },
        ..ConnectionOptions::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn session_json() -> Value {
    json!({
        "sessionId": "s-1",
        "sessionCode": "abc-def",
        "transmitter": {"identifier": "tx", "userId": "host"},
        "receivers": [{"identifier": "r1", "userId": "guest"}]
    })
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, call: String) {
        self.calls.lock().expect("lock").push(call);
    }

    fn contains(&self, call: &str) -> bool {
        self.count(call) > 0
    }

    fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }
}

impl ConnectivityDelegate for Recorder {
    fn receiver_connectivity_changed(&self, identifier: &str, connected: bool) {
        self.push(format!("rx:{identifier}:{connected}"));
    }
}

impl UserDelegate for Recorder {
    fn user_joined(&self, connection: &Connection) {
        self.push(format!("joined:{}", connection.identifier));
    }

    fn user_left(&self, identifier: &str) {
        self.push(format!("left:{identifier}"));
    }
}

impl DesktopAgentDelegate for Recorder {
    fn desktop_agent_released(&self) {
        self.push("released".to_string());
    }

    fn desktop_agent_connected(&self) {
        self.push("agent_connected".to_string());
    }

    fn browser_connected(&self) {
        self.push("browser_connected".to_string());
    }

    fn browser_disconnected(&self) {
        self.push("browser_disconnected".to_string());
    }
}

fn counting_refresher(
    token: String,
    calls: &Arc<AtomicUsize>,
) -> impl Fn() -> std::future::Ready<Option<String>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Some(token.clone()))
    }
}

fn count_of(requests: &[Envelope], kind: MessageType) -> usize {
    requests
        .iter()
        .filter(|envelope| envelope.kind == kind)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connects_with_pairing_query_and_tracks_both_peers() {
    let agent = MockAgent::start().await;
    let recorder = Arc::new(Recorder::default());
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .with_desktop_agent_delegate(recorder.clone())
        .build();

    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_connected() && sdk.is_desktop_agent_connected()).await;

    let query = agent
        .script
        .last_query
        .lock()
        .expect("lock")
        .clone()
        .expect("query recorded");
    assert!(query.contains("syncStageObjectId="));
    assert!(query.contains("websocketId="));
    assert!(recorder.contains("released"));
    assert!(recorder.contains("agent_connected"));
    assert!(recorder.contains("browser_connected"));

    sdk.shutdown().await;
    assert_eq!(sdk.connection_state(), ConnectionState::Disconnected);
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_caches_session_and_events_reconcile_roster() {
    let mut agent = MockAgent::start().await;
    let recorder = Arc::new(Recorder::default());
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .with_user_delegate(recorder.clone())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    let session = sdk
        .join("abc-def", "guest", "zone-eu", "studio-1", Some("Guest"))
        .await
        .expect("join succeeds");
    assert_eq!(session.session_id, "s-1");
    let join = agent.next_of(MessageType::JoinRequest).await;
    assert_eq!(join.content["sessionCode"], "abc-def");
    assert_eq!(join.content["displayName"], "Guest");

    let receivers = |sdk: &syncstage_sdk::SyncStage| -> Vec<String> {
        sdk.cached_session()
            .map(|session| {
                session
                    .receivers
                    .into_iter()
                    .map(|receiver| receiver.identifier)
                    .collect()
            })
            .unwrap_or_default()
    };
    let before = receivers(&sdk);
    assert_eq!(before, vec!["r1"]);

    agent.push(
        MessageType::UserJoined,
        json!({"identifier": "r2", "userId": "late"}),
    );
    eventually(|| receivers(&sdk).len() == 2).await;
    agent.push(MessageType::UserLeft, json!({"identifier": "r2"}));
    eventually(|| receivers(&sdk).len() == 1).await;

    assert_eq!(receivers(&sdk), before);
    assert!(recorder.contains("joined:r2"));
    assert!(recorder.contains("left:r2"));

    sdk.leave().await.expect("leave succeeds");
    assert!(sdk.cached_session().is_none());

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn typed_operations_project_their_payloads() {
    let mut agent = MockAgent::start().await;
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    assert_eq!(sdk.get_receiver_volume("r1").await.expect("volume"), 73);
    let request = agent.next_of(MessageType::GetReceiverVolumeRequest).await;
    assert_eq!(request.content, json!({"identifier": "r1"}));

    assert!(sdk.is_microphone_muted().await.expect("muted"));
    sdk.change_receiver_volume("r1", 40)
        .await
        .expect("volume change");
    let change = agent.next_of(MessageType::ChangeReceiverVolumeRequest).await;
    assert_eq!(change.content, json!({"identifier": "r1", "volume": 40}));

    let err = sdk.stop_recording().await.expect_err("agent reports error");
    assert_eq!(err.code(), SdkErrorCode::SessionNotJoined);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_call_is_sent_retries_plus_one_times() {
    let mut agent = MockAgent::start().await;
    agent.script.silence(MessageType::StartRecordingRequest);
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    let result = sdk
        .call(
            MessageType::StartRecordingRequest,
            json!({}),
            CallOptions::default()
                .with_retries(2)
                .with_timeout(Duration::from_millis(200)),
        )
        .await;
    assert!(matches!(result, Err(CallError::Communication)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let attempts: Vec<String> = agent
        .drain_requests()
        .into_iter()
        .filter(|envelope| envelope.kind == MessageType::StartRecordingRequest)
        .map(|envelope| envelope.msg_id)
        .collect();
    assert_eq!(attempts.len(), 3);
    let unique: HashSet<&String> = attempts.iter().collect();
    assert_eq!(unique.len(), 3);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_flushes_pending_calls_and_reconnects() {
    let mut agent = MockAgent::start().await;
    agent.script.silence(MessageType::SessionRequest);
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    let pending = tokio::spawn({
        let sdk = sdk.clone();
        async move { sdk.session().await }
    });
    agent.next_of(MessageType::SessionRequest).await;
    agent.close_socket();

    let result = timeout(WAIT, pending)
        .await
        .expect("flushed before the response timeout")
        .expect("task joins");
    assert!(matches!(result, Err(CallError::Communication)));

    eventually(|| agent.script.connections.load(Ordering::SeqCst) >= 2).await;
    assert!(sdk.wait_for_connection(WAIT).await);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_token_is_refreshed_with_one_update_before_the_call() {
    let mut agent = MockAgent::start().await;
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let fresh = token_expiring_at(NOW_MS / 1_000 + 86_400);
    let supplied = fresh.clone();
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .with_clock(clock.clone())
        .with_token_refresher(move || {
            let supplied = supplied.clone();
            async move { Some(supplied) }
        })
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    sdk.init(token_expiring_at(NOW_MS / 1_000 + 100))
        .await
        .expect("provision succeeds");
    clock.advance(Duration::from_secs(3_600));

    assert!(sdk.is_microphone_muted().await.expect("call after refresh"));
    assert!(sdk.is_microphone_muted().await.expect("second call"));

    let requests = agent.drain_requests();
    let kinds: Vec<MessageType> = requests.iter().map(|envelope| envelope.kind).collect();
    let updates: Vec<&Envelope> = requests
        .iter()
        .filter(|envelope| envelope.kind == MessageType::UpdateTokenRequest)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].content["token"], fresh.as_str());
    let update_at = kinds
        .iter()
        .position(|kind| *kind == MessageType::UpdateTokenRequest)
        .expect("update sent");
    let call_at = kinds
        .iter()
        .position(|kind| *kind == MessageType::IsMicrophoneMutedRequest)
        .expect("call sent");
    assert!(update_at < call_at);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_that_forgot_provisioning_is_reprovisioned() {
    let mut agent = MockAgent::start().await;
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_desktop_agent_connected()).await;

    let token = token_expiring_at(4_000_000_000);
    sdk.init(token.clone()).await.expect("provision succeeds");
    agent.next_of(MessageType::ProvisionRequest).await;
    // let a provisioned pong land before the agent "restarts"
    tokio::time::sleep(Duration::from_millis(300)).await;
    while agent.received.try_recv().is_ok() {}

    agent.script.provisioned.store(false, Ordering::SeqCst);
    let again = agent.next_of(MessageType::ProvisionRequest).await;
    assert_eq!(again.content["token"], token.as_str());

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_token_update_is_retried_before_the_next_call() {
    let mut agent = MockAgent::start().await;
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let fresh = token_expiring_at(NOW_MS / 1_000 + 86_400);
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(ConnectionOptions {
            response_timeout: Duration::from_millis(300),
            ..fast_options()
        })
        .with_clock(clock.clone())
        .with_token_refresher(counting_refresher(fresh.clone(), &refreshes))
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_desktop_agent_connected()).await;

    sdk.init(token_expiring_at(NOW_MS / 1_000 + 100))
        .await
        .expect("provision succeeds");
    clock.advance(Duration::from_secs(3_600));

    agent.script.silence(MessageType::UpdateTokenRequest);
    let err = sdk
        .is_microphone_muted()
        .await
        .expect_err("update went unanswered");
    assert!(matches!(err, CallError::Communication));

    agent.script.unsilence(MessageType::UpdateTokenRequest);
    assert!(sdk.is_microphone_muted().await.expect("call after update"));
    assert!(sdk.is_microphone_muted().await.expect("settled call"));

    let requests = agent.drain_requests();
    let updates: Vec<&Envelope> = requests
        .iter()
        .filter(|envelope| envelope.kind == MessageType::UpdateTokenRequest)
        .collect();
    assert_eq!(updates.len(), 2);
    assert!(updates
        .iter()
        .all(|update| update.content["token"] == fresh.as_str()));
    assert_eq!(count_of(&requests, MessageType::IsMicrophoneMutedRequest), 2);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_share_one_refresh() {
    let mut agent = MockAgent::start().await;
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .with_clock(clock.clone())
        .with_token_refresher(counting_refresher(
            token_expiring_at(NOW_MS / 1_000 + 86_400),
            &refreshes,
        ))
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_desktop_agent_connected()).await;

    sdk.init(token_expiring_at(NOW_MS / 1_000 + 100))
        .await
        .expect("provision succeeds");
    clock.advance(Duration::from_secs(3_600));

    let (muted, volume) = tokio::join!(sdk.is_microphone_muted(), sdk.get_receiver_volume("r1"));
    assert!(muted.expect("muted"));
    assert_eq!(volume.expect("volume"), 73);

    let requests = agent.drain_requests();
    assert_eq!(count_of(&requests, MessageType::UpdateTokenRequest), 1);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_token_is_never_provisioned() {
    let mut agent = MockAgent::start().await;
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(fast_options())
        .with_clock(clock)
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    let err = sdk
        .init(token_expiring_at(NOW_MS / 1_000 - 60))
        .await
        .expect_err("expired");
    assert!(matches!(err, CallError::TokenExpired));
    let err = sdk
        .update_token(token_expiring_at(NOW_MS / 1_000 - 60))
        .await
        .expect_err("expired");
    assert!(matches!(err, CallError::TokenExpired));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let requests = agent.drain_requests();
    assert_eq!(count_of(&requests, MessageType::ProvisionRequest), 0);
    assert_eq!(count_of(&requests, MessageType::UpdateTokenRequest), 0);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wall_clock_jump_forces_reconnect_and_flushes_pending_calls() {
    let mut agent = MockAgent::start().await;
    agent.script.silence(MessageType::SessionRequest);
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(ConnectionOptions {
            suspend_tick: Duration::from_millis(100),
            ..fast_options()
        })
        .with_clock(clock.clone())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);

    let pending = tokio::spawn({
        let sdk = sdk.clone();
        async move { sdk.session().await }
    });
    agent.next_of(MessageType::SessionRequest).await;

    agent.script.refuse(true);
    clock.advance(Duration::from_secs(3_600));

    let result = timeout(WAIT, pending)
        .await
        .expect("flushed before the response timeout")
        .expect("task joins");
    assert!(matches!(result, Err(CallError::Communication)));
    eventually(|| sdk.connection_state() == ConnectionState::Reconnecting).await;

    agent.script.refuse(false);
    assert!(sdk.wait_for_connection(WAIT).await);
    assert!(agent.script.connections.load(Ordering::SeqCst) >= 2);

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_silence_recycles_the_socket() {
    let mut agent = MockAgent::start().await;
    agent.script.silence(MessageType::SessionRequest);
    let recorder = Arc::new(Recorder::default());
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(ConnectionOptions {
            server_allowed_silence: Duration::from_millis(300),
            response_timeout: Duration::from_secs(30),
            ..fast_options()
        })
        .with_desktop_agent_delegate(recorder.clone())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_connected()).await;

    let pending = tokio::spawn({
        let sdk = sdk.clone();
        async move { sdk.session().await }
    });
    agent.next_of(MessageType::SessionRequest).await;

    agent.script.refuse(true);
    agent.script.silence(MessageType::ServerPing);

    let result = timeout(WAIT, pending)
        .await
        .expect("flushed before the response timeout")
        .expect("task joins");
    assert!(matches!(result, Err(CallError::Communication)));
    eventually(|| sdk.connection_state() == ConnectionState::Reconnecting).await;
    assert!(!sdk.is_connected());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(recorder.count("browser_disconnected"), 1);

    agent.script.unsilence(MessageType::ServerPing);
    agent.script.refuse(false);
    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_connected()).await;

    sdk.shutdown().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restored_relay_replays_last_known_connectivity() {
    let agent = MockAgent::start().await;
    // keep the agent quiet so only the relay can trigger a replay
    agent.script.silence(MessageType::Ping);
    agent.script.silence(MessageType::IsDesktopAgentConnected);
    let recorder = Arc::new(Recorder::default());
    let sdk = SyncStageBuilder::new(agent.url())
        .with_options(ConnectionOptions {
            server_allowed_silence: Duration::from_millis(300),
            ..fast_options()
        })
        .with_connectivity_delegate(recorder.clone())
        .build();
    assert!(sdk.wait_for_connection(WAIT).await);
    eventually(|| sdk.is_connected()).await;

    sdk.join("abc-def", "guest", "zone-eu", "studio-1", None)
        .await
        .expect("join succeeds");
    agent.push(
        MessageType::ReceiverConnectivityChanged,
        json!({"identifier": "r1", "connected": true}),
    );
    eventually(|| recorder.count("rx:r1:true") == 1).await;

    agent.script.refuse(true);
    agent.script.silence(MessageType::ServerPing);
    eventually(|| !sdk.is_connected()).await;
    assert_eq!(recorder.count("rx:r1:true"), 1);

    agent.script.unsilence(MessageType::ServerPing);
    agent.script.refuse(false);
    eventually(|| recorder.count("rx:r1:true") >= 2).await;
    assert!(!sdk.is_desktop_agent_connected());

    sdk.shutdown().await;
    agent.stop().await;
}

async fn ws_handler(
    State(state): State<AgentState>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    *state.script.last_query.lock().expect("lock") = query;
    if state.script.refusing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| run_agent(socket, state))
        .into_response()
}

async fn run_agent(mut socket: WebSocket, state: AgentState) {
    let mut actions = state.actions.subscribe();
    state.script.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            frame = socket.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(envelope) = Envelope::from_text(&text) else {
                    continue;
                };
                let _ = state.received.send(envelope.clone());
                if let Some(reply) = reply_to(&state.script, &envelope) {
                    if send_envelope(&mut socket, &reply).await.is_err() {
                        return;
                    }
                }
            }
            action = actions.recv() => {
                match action {
                    Ok(AgentAction::Push(envelope)) => {
                        if send_envelope(&mut socket, &envelope).await.is_err() {
                            return;
                        }
                    }
                    Ok(AgentAction::Close) => {
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

fn reply_to(script: &Script, request: &Envelope) -> Option<Envelope> {
    if script.is_silent(request.kind) {
        return None;
    }
    let content = match request.kind {
        MessageType::Ping => {
            let provisioned = script.provisioned.load(Ordering::SeqCst);
            return Some(Envelope::reply_to(
                request,
                MessageType::Pong,
                json!({"isProvisioned": provisioned}),
            ));
        }
        MessageType::ServerPing => {
            return Some(Envelope::reply_to(request, MessageType::ServerPong, json!({})));
        }
        MessageType::IsDesktopAgentConnected => {
            return Some(Envelope::new(MessageType::DesktopAgentConnected, json!({})));
        }
        MessageType::ProvisionRequest => {
            script.provisioned.store(true, Ordering::SeqCst);
            json!({})
        }
        MessageType::JoinRequest | MessageType::SessionRequest => session_json(),
        MessageType::GetReceiverVolumeRequest => json!({"volume": 73}),
        MessageType::IsMicrophoneMutedRequest => json!({"isMuted": true}),
        MessageType::StopRecordingRequest => {
            let kind = request.kind.expected_response()?;
            return Some(
                Envelope::reply_to(request, kind, json!({}))
                    .with_error_code(SdkErrorCode::SessionNotJoined),
            );
        }
        _ => json!({}),
    };
    let kind = request.kind.expected_response()?;
    Some(Envelope::reply_to(request, kind, content))
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), String> {
    let payload = envelope
        .to_text()
        .map_err(|err| format!("failed to encode envelope: {err}"))?;
    socket
        .send(Message::Text(payload))
        .await
        .map_err(|err| format!("failed to send envelope: {err}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock agent listener");
    let addr = listener
        .local_addr()
        .expect("read mock agent listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock agent should run");
    });
    (addr, shutdown_tx, task)
}

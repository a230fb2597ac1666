//! Public operation facade.
//!
//! Every operation runs the same path: credential gate (a refreshed token is
//! handed to the agent before anything else goes out), correlated call,
//! payload projection, and decode into the typed result.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::credential::{CredentialGuard, TokenRefresher};
use crate::error::{CallError, SdkErrorCode};
use crate::pairing::{pairing_id, MemoryPairingStore, PairingStore};
use crate::stream::client::{
    spawn_connection, ConnectionConfig, ConnectionHandle, ConnectionOptions, ConnectionState,
    LinkEvent, LOCAL_AGENT_ENDPOINT,
};
use crate::stream::correlator::{CallOptions, RequestCorrelator};
use crate::stream::dispatch::{project, Dispatcher};
use crate::stream::events::{
    ConnectivityDelegate, DesktopAgentDelegate, DiscoveryDelegate, Subscribers, UserDelegate,
};
use crate::stream::presence::{AlwaysOnline, PresenceProbe};
use crate::stream::proto::{
    ChangeVolumeMsg, CreateSessionMsg, IdentifierMsg, JoinMsg, LatencyLevelMsg,
    LatencyOptimizationLevel, Measurements, MessageType, ServerInstance, Session,
    SessionIdentifier, ToggleMicrophoneMsg, TokenMsg,
};

const MAX_VOLUME: i32 = 100;

/// Builder for [`SyncStage`].
pub struct SyncStageBuilder {
    base_url: String,
    options: ConnectionOptions,
    pairing_store: Arc<dyn PairingStore>,
    presence_probe: Arc<dyn PresenceProbe>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    clock: Arc<dyn Clock>,
    subscribers: Subscribers,
}

impl SyncStageBuilder {
    /// Starts a builder for the agent reachable at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end().to_string(),
            options: ConnectionOptions::default(),
            pairing_store: Arc::new(MemoryPairingStore::default()),
            presence_probe: Arc::new(AlwaysOnline),
            refresher: None,
            clock: Arc::new(SystemClock),
            subscribers: Subscribers::default(),
        }
    }

    /// Builder for the local development agent endpoint.
    pub fn local() -> Self {
        Self::new(LOCAL_AGENT_ENDPOINT)
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Store that keeps the pairing identifier across restarts.
    pub fn with_pairing_store(mut self, store: Arc<dyn PairingStore>) -> Self {
        self.pairing_store = store;
        self
    }

    pub fn with_presence_probe(mut self, probe: Arc<dyn PresenceProbe>) -> Self {
        self.presence_probe = probe;
        self
    }

    /// Hook invoked when the installed token has expired.
    pub fn with_token_refresher<R>(mut self, refresher: R) -> Self
    where
        R: TokenRefresher + 'static,
    {
        self.refresher = Some(Arc::new(refresher));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_connectivity_delegate(mut self, delegate: Arc<dyn ConnectivityDelegate>) -> Self {
        self.subscribers.connectivity = Some(delegate);
        self
    }

    pub fn with_user_delegate(mut self, delegate: Arc<dyn UserDelegate>) -> Self {
        self.subscribers.user = Some(delegate);
        self
    }

    pub fn with_discovery_delegate(mut self, delegate: Arc<dyn DiscoveryDelegate>) -> Self {
        self.subscribers.discovery = Some(delegate);
        self
    }

    pub fn with_desktop_agent_delegate(mut self, delegate: Arc<dyn DesktopAgentDelegate>) -> Self {
        self.subscribers.desktop_agent = Some(delegate);
        self
    }

    /// Spawns the connection worker and returns the facade.
    ///
    /// Must be called from within a tokio runtime. The connection is opened
    /// in the background; use [`SyncStage::wait_for_connection`] to await it.
    pub fn build(self) -> SyncStage {
        let correlator = Arc::new(RequestCorrelator::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&correlator),
            self.subscribers,
        ));
        let guard = Arc::new(CredentialGuard::new(
            self.refresher,
            Arc::clone(&self.clock),
            self.options.token_skew,
        ));
        let pairing_id = pairing_id(self.pairing_store.as_ref());
        let default_call = CallOptions::default().with_timeout(self.options.response_timeout);

        let spawned = spawn_connection(
            ConnectionConfig {
                base_url: self.base_url,
                pairing_id,
                options: self.options,
            },
            Arc::clone(&dispatcher),
            self.presence_probe,
            self.clock,
        );

        let supervisor = tokio::spawn(supervise(
            spawned.links,
            Arc::clone(&dispatcher),
            Arc::clone(&correlator),
            Arc::clone(&guard),
            spawned.handle.clone(),
            default_call,
        ));

        SyncStage {
            inner: Arc::new(Inner {
                connection: spawned.handle,
                dispatcher,
                correlator,
                guard,
                default_call,
                presence: spawned.presence,
                supervisor,
            }),
        }
    }
}

struct Inner {
    connection: ConnectionHandle,
    dispatcher: Arc<Dispatcher>,
    correlator: Arc<RequestCorrelator>,
    guard: Arc<CredentialGuard>,
    default_call: CallOptions,
    presence: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.presence.abort();
        self.supervisor.abort();
    }
}

/// Control-plane client for the desktop agent.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SyncStage {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStage")
            .field("state", &self.connection_state())
            .field("guard", &self.inner.guard)
            .finish()
    }
}

impl SyncStage {
    pub fn builder(base_url: impl Into<String>) -> SyncStageBuilder {
        SyncStageBuilder::new(base_url)
    }

    /// Installs `token` and provisions the agent with it.
    ///
    /// An expired token goes through the refresh hook first; without a usable
    /// replacement nothing is sent and the result is `TokenExpired`.
    pub async fn init(&self, token: impl Into<String>) -> Result<(), CallError> {
        self.provision(MessageType::ProvisionRequest, token.into())
            .await
    }

    /// Replaces the token and re-provisions the agent.
    pub async fn update_token(&self, token: impl Into<String>) -> Result<(), CallError> {
        self.provision(MessageType::UpdateTokenRequest, token.into())
            .await
    }

    pub async fn get_best_available_server(&self) -> Result<ServerInstance, CallError> {
        self.request(MessageType::BestAvailableServerRequest, Value::Null)
            .await
    }

    pub async fn get_server_instances(&self) -> Result<Vec<ServerInstance>, CallError> {
        self.request(MessageType::ServerInstancesRequest, Value::Null)
            .await
    }

    pub async fn create_session(
        &self,
        zone_id: &str,
        studio_server_id: &str,
        user_id: &str,
    ) -> Result<SessionIdentifier, CallError> {
        let content = to_content(&CreateSessionMsg {
            zone_id: zone_id.to_string(),
            studio_server_id: studio_server_id.to_string(),
            user_id: user_id.to_string(),
        })?;
        self.request(MessageType::CreateSessionRequest, content)
            .await
    }

    /// Joins a session and seeds the local session cache.
    pub async fn join(
        &self,
        session_code: &str,
        user_id: &str,
        zone_id: &str,
        studio_server_id: &str,
        display_name: Option<&str>,
    ) -> Result<Session, CallError> {
        let content = to_content(&JoinMsg {
            session_code: session_code.to_string(),
            user_id: user_id.to_string(),
            zone_id: zone_id.to_string(),
            studio_server_id: studio_server_id.to_string(),
            display_name: display_name.map(str::to_string),
        })?;
        let session: Session = self.request(MessageType::JoinRequest, content).await?;
        self.inner.dispatcher.apply_session(&session);
        info!(event = "session_joined", session_id = %session.session_id);
        Ok(session)
    }

    pub async fn leave(&self) -> Result<(), CallError> {
        self.request_unit(MessageType::LeaveRequest, Value::Null)
            .await?;
        self.inner.dispatcher.clear_session();
        info!(event = "session_left");
        Ok(())
    }

    /// Fetches the current session and refreshes the cache with it.
    pub async fn session(&self) -> Result<Session, CallError> {
        let session: Session = self
            .request(MessageType::SessionRequest, Value::Null)
            .await?;
        self.inner.dispatcher.apply_session(&session);
        Ok(session)
    }

    /// Sets a receiver's volume. Values outside `0..=100` are rejected
    /// locally with `BadVolumeValue`.
    pub async fn change_receiver_volume(
        &self,
        identifier: &str,
        volume: i32,
    ) -> Result<(), CallError> {
        let volume = u8::try_from(volume)
            .ok()
            .filter(|volume| i32::from(*volume) <= MAX_VOLUME)
            .ok_or(CallError::InvalidArgument(SdkErrorCode::BadVolumeValue))?;
        let content = to_content(&ChangeVolumeMsg {
            identifier: identifier.to_string(),
            volume,
        })?;
        self.request_unit(MessageType::ChangeReceiverVolumeRequest, content)
            .await
    }

    pub async fn get_receiver_volume(&self, identifier: &str) -> Result<u8, CallError> {
        let content = to_content(&IdentifierMsg {
            identifier: identifier.to_string(),
        })?;
        self.request(MessageType::GetReceiverVolumeRequest, content)
            .await
    }

    pub async fn toggle_microphone(&self, mute: bool) -> Result<(), CallError> {
        let content = to_content(&ToggleMicrophoneMsg { mute })?;
        self.request_unit(MessageType::ToggleMicrophoneRequest, content)
            .await
    }

    pub async fn is_microphone_muted(&self) -> Result<bool, CallError> {
        self.request(MessageType::IsMicrophoneMutedRequest, Value::Null)
            .await
    }

    pub async fn get_receiver_measurements(
        &self,
        identifier: &str,
    ) -> Result<Measurements, CallError> {
        let content = to_content(&IdentifierMsg {
            identifier: identifier.to_string(),
        })?;
        self.request(MessageType::GetReceiverMeasurementsRequest, content)
            .await
    }

    pub async fn get_transmitter_measurements(&self) -> Result<Measurements, CallError> {
        self.request(MessageType::GetTransmitterMeasurementsRequest, Value::Null)
            .await
    }

    pub async fn get_latency_optimization_level(
        &self,
    ) -> Result<LatencyOptimizationLevel, CallError> {
        self.request(MessageType::LatencyOptimizationLevelRequest, Value::Null)
            .await
    }

    pub async fn change_latency_optimization_level(
        &self,
        level: LatencyOptimizationLevel,
    ) -> Result<(), CallError> {
        let content = to_content(&LatencyLevelMsg {
            latency_optimization_level: level,
        })?;
        self.request_unit(MessageType::ChangeLatencyOptimizationLevelRequest, content)
            .await
    }

    pub async fn start_recording(&self) -> Result<(), CallError> {
        self.request_unit(MessageType::StartRecordingRequest, Value::Null)
            .await
    }

    pub async fn stop_recording(&self) -> Result<(), CallError> {
        self.request_unit(MessageType::StopRecordingRequest, Value::Null)
            .await
    }

    /// Sends an arbitrary message type.
    ///
    /// Returns the projected payload in wait mode and `None` for
    /// fire-and-forget calls.
    pub async fn call(
        &self,
        kind: MessageType,
        content: Value,
        options: CallOptions,
    ) -> Result<Option<Value>, CallError> {
        self.authorize().await?;
        let response = self
            .inner
            .correlator
            .call(&self.inner.connection, kind, content, options)
            .await?;
        response.as_ref().map(project).transpose()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Whether the relay is answering heartbeats.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_server_alive()
    }

    pub fn is_desktop_agent_connected(&self) -> bool {
        self.inner.connection.is_agent_connected()
    }

    pub fn cached_session(&self) -> Option<Session> {
        self.inner.dispatcher.cached_session()
    }

    pub fn sdk_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Waits until the socket is open. Returns `false` on timeout.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.inner.connection.wait_for_open(timeout).await
    }

    /// Closes the connection for good and fails any pending call.
    pub async fn shutdown(&self) {
        self.inner.supervisor.abort();
        self.inner.connection.shutdown().await;
        self.inner.presence.abort();
    }

    async fn request<T: DeserializeOwned>(
        &self,
        kind: MessageType,
        content: Value,
    ) -> Result<T, CallError> {
        let value = self.exchange(kind, content).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn request_unit(&self, kind: MessageType, content: Value) -> Result<(), CallError> {
        self.exchange(kind, content).await.map(|_| ())
    }

    async fn exchange(&self, kind: MessageType, content: Value) -> Result<Value, CallError> {
        self.authorize().await?;
        let response = self
            .inner
            .correlator
            .call(
                &self.inner.connection,
                kind,
                content,
                self.inner.default_call,
            )
            .await?
            .ok_or(CallError::Communication)?;
        project(&response)
    }

    /// Runs the credential gate. A refreshed token reaches the agent with one
    /// `UpdateToken` before the caller's request goes out.
    async fn authorize(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        inner
            .guard
            .authorize(|token| {
                send_token(
                    &inner.correlator,
                    &inner.connection,
                    MessageType::UpdateTokenRequest,
                    token,
                    inner.default_call,
                )
            })
            .await
    }

    async fn provision(&self, kind: MessageType, token: String) -> Result<(), CallError> {
        let inner = &self.inner;
        inner
            .guard
            .provision(token, |token| {
                send_token(
                    &inner.correlator,
                    &inner.connection,
                    kind,
                    token,
                    inner.default_call,
                )
            })
            .await
    }
}

/// Hands `token` to the agent with one `kind` request and waits for the answer.
async fn send_token(
    correlator: &RequestCorrelator,
    connection: &ConnectionHandle,
    kind: MessageType,
    token: SecretString,
    options: CallOptions,
) -> Result<(), CallError> {
    let content = to_content(&TokenMsg {
        token: token.expose_secret().to_string(),
    })?;
    let response = correlator
        .call(connection, kind, content, options)
        .await?
        .ok_or(CallError::Communication)?;
    project(&response)?;
    info!(event = "token_sent", kind = kind.as_str());
    Ok(())
}

fn to_content<T: Serialize>(message: &T) -> Result<Value, CallError> {
    Ok(serde_json::to_value(message)?)
}

/// Reacts to link events on behalf of the facade.
async fn supervise(
    mut links: mpsc::UnboundedReceiver<LinkEvent>,
    dispatcher: Arc<Dispatcher>,
    correlator: Arc<RequestCorrelator>,
    guard: Arc<CredentialGuard>,
    connection: ConnectionHandle,
    options: CallOptions,
) {
    while let Some(event) = links.recv().await {
        match event {
            LinkEvent::AgentReconnected | LinkEvent::RelayRestored => {
                dispatcher.replay_connectivity()
            }
            LinkEvent::ProvisionState(false) => {
                let guard = Arc::clone(&guard);
                let correlator = Arc::clone(&correlator);
                let connection = connection.clone();
                tokio::spawn(async move {
                    let sent = guard
                        .reprovision(|token| {
                            send_token(
                                &correlator,
                                &connection,
                                MessageType::ProvisionRequest,
                                token,
                                options,
                            )
                        })
                        .await;
                    match sent {
                        Ok(true) => info!(event = "agent_reprovisioned"),
                        Ok(false) => debug!(event = "agent_unprovisioned_without_credential"),
                        Err(err) => warn!(
                            event = "agent_reprovision_failed",
                            code = err.code().as_i32(),
                            error = %err
                        ),
                    }
                });
            }
            LinkEvent::ProvisionState(true) => debug!(event = "agent_provisioned"),
            LinkEvent::NetworkChanged(online) => debug!(event = "network_changed", online),
        }
    }
}

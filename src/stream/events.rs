//! Subscriber callbacks and the typed events routed to them.
//!
//! Delegates are invoked synchronously from the connection worker, so an
//! implementation must return quickly and must not block on the SDK. Every
//! method has an empty default body; implement only what you need.

use std::sync::Arc;

use serde_json::Value;

use crate::stream::proto::{
    ConnectivityMsg, Connection, DiscoveryLatencyMsg, DiscoveryMsg, Envelope, IdentifierMsg,
    MessageType, ZoneLatency,
};

/// Connectivity of the transmitter and receivers as seen by the agent.
pub trait ConnectivityDelegate: Send + Sync {
    fn transmitter_connectivity_changed(&self, _connected: bool) {}
    fn receiver_connectivity_changed(&self, _identifier: &str, _connected: bool) {}
}

/// Session membership and recording updates.
pub trait UserDelegate: Send + Sync {
    fn user_joined(&self, _connection: &Connection) {}
    fn user_left(&self, _identifier: &str) {}
    fn user_muted(&self, _identifier: &str) {}
    fn user_unmuted(&self, _identifier: &str) {}
    fn recording_started(&self) {}
    fn recording_stopped(&self) {}
    /// The session was terminated by the other side.
    fn session_out(&self) {}
}

/// Results of zone discovery that the agent runs in the background.
pub trait DiscoveryDelegate: Send + Sync {
    fn discovery_results(&self, _zones: &[String]) {}
    fn discovery_latency_test_results(&self, _results: &[ZoneLatency]) {}
}

/// Link-level notifications about both peers.
pub trait DesktopAgentDelegate: Send + Sync {
    /// Another client holds the desktop agent.
    fn desktop_agent_acquired(&self) {}
    fn desktop_agent_released(&self) {}
    fn desktop_agent_connected(&self) {}
    fn desktop_agent_disconnected(&self) {}
    fn browser_connected(&self) {}
    fn browser_disconnected(&self) {}
}

/// Notification produced by the connection manager for [`DesktopAgentDelegate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentNotice {
    Acquired,
    Released,
    Connected,
    Disconnected,
    BrowserConnected,
    BrowserDisconnected,
}

/// Unsolicited envelope decoded into its typed form.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    UserJoined(Connection),
    UserLeft { identifier: String },
    UserMuted { identifier: String },
    UserUnmuted { identifier: String },
    TransmitterConnectivityChanged { connected: bool },
    ReceiverConnectivityChanged { identifier: String, connected: bool },
    RecordingStarted,
    RecordingStopped,
    SessionOut,
    DiscoveryResult(Vec<String>),
    DiscoveryLatencyResult(Vec<ZoneLatency>),
}

impl SessionEvent {
    /// Decodes an event envelope.
    ///
    /// Returns `Ok(None)` when the envelope's type is not an event.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, serde_json::Error> {
        let content = || -> Value {
            if envelope.content.is_null() {
                Value::Object(Default::default())
            } else {
                envelope.content.clone()
            }
        };
        let event = match envelope.kind {
            MessageType::UserJoined => Self::UserJoined(serde_json::from_value(content())?),
            MessageType::UserLeft => {
                let msg: IdentifierMsg = serde_json::from_value(content())?;
                Self::UserLeft {
                    identifier: msg.identifier,
                }
            }
            MessageType::UserMuted => {
                let msg: IdentifierMsg = serde_json::from_value(content())?;
                Self::UserMuted {
                    identifier: msg.identifier,
                }
            }
            MessageType::UserUnmuted => {
                let msg: IdentifierMsg = serde_json::from_value(content())?;
                Self::UserUnmuted {
                    identifier: msg.identifier,
                }
            }
            MessageType::TransmitterConnectivityChanged => {
                let msg: ConnectivityMsg = serde_json::from_value(content())?;
                Self::TransmitterConnectivityChanged {
                    connected: msg.connected,
                }
            }
            MessageType::ReceiverConnectivityChanged => {
                let msg: ConnectivityMsg = serde_json::from_value(content())?;
                Self::ReceiverConnectivityChanged {
                    identifier: msg.identifier,
                    connected: msg.connected,
                }
            }
            MessageType::RecordingStarted => Self::RecordingStarted,
            MessageType::RecordingStopped => Self::RecordingStopped,
            MessageType::SessionOut => Self::SessionOut,
            MessageType::DiscoveryResult => {
                let msg: DiscoveryMsg = serde_json::from_value(content())?;
                Self::DiscoveryResult(msg.zones)
            }
            MessageType::DiscoveryLatencyResult => {
                let msg: DiscoveryLatencyMsg = serde_json::from_value(content())?;
                Self::DiscoveryLatencyResult(msg.results)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Optional subscriber slots. An empty slot drops its events silently.
#[derive(Clone, Default)]
pub struct Subscribers {
    pub connectivity: Option<Arc<dyn ConnectivityDelegate>>,
    pub user: Option<Arc<dyn UserDelegate>>,
    pub discovery: Option<Arc<dyn DiscoveryDelegate>>,
    pub desktop_agent: Option<Arc<dyn DesktopAgentDelegate>>,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("connectivity", &self.connectivity.is_some())
            .field("user", &self.user.is_some())
            .field("discovery", &self.discovery.is_some())
            .field("desktop_agent", &self.desktop_agent.is_some())
            .finish()
    }
}

impl Subscribers {
    pub fn deliver(&self, event: &SessionEvent) {
        match event {
            SessionEvent::UserJoined(connection) => {
                if let Some(user) = &self.user {
                    user.user_joined(connection);
                }
            }
            SessionEvent::UserLeft { identifier } => {
                if let Some(user) = &self.user {
                    user.user_left(identifier);
                }
            }
            SessionEvent::UserMuted { identifier } => {
                if let Some(user) = &self.user {
                    user.user_muted(identifier);
                }
            }
            SessionEvent::UserUnmuted { identifier } => {
                if let Some(user) = &self.user {
                    user.user_unmuted(identifier);
                }
            }
            SessionEvent::TransmitterConnectivityChanged { connected } => {
                self.transmitter_connectivity(*connected);
            }
            SessionEvent::ReceiverConnectivityChanged {
                identifier,
                connected,
            } => {
                self.receiver_connectivity(identifier, *connected);
            }
            SessionEvent::RecordingStarted => {
                if let Some(user) = &self.user {
                    user.recording_started();
                }
            }
            SessionEvent::RecordingStopped => {
                if let Some(user) = &self.user {
                    user.recording_stopped();
                }
            }
            SessionEvent::SessionOut => {
                if let Some(user) = &self.user {
                    user.session_out();
                }
            }
            SessionEvent::DiscoveryResult(zones) => {
                if let Some(discovery) = &self.discovery {
                    discovery.discovery_results(zones);
                }
            }
            SessionEvent::DiscoveryLatencyResult(results) => {
                if let Some(discovery) = &self.discovery {
                    discovery.discovery_latency_test_results(results);
                }
            }
        }
    }

    pub fn transmitter_connectivity(&self, connected: bool) {
        if let Some(connectivity) = &self.connectivity {
            connectivity.transmitter_connectivity_changed(connected);
        }
    }

    pub fn receiver_connectivity(&self, identifier: &str, connected: bool) {
        if let Some(connectivity) = &self.connectivity {
            connectivity.receiver_connectivity_changed(identifier, connected);
        }
    }

    pub fn notify_agent(&self, notice: AgentNotice) {
        let Some(agent) = &self.desktop_agent else {
            return;
        };
        match notice {
            AgentNotice::Acquired => agent.desktop_agent_acquired(),
            AgentNotice::Released => agent.desktop_agent_released(),
            AgentNotice::Connected => agent.desktop_agent_connected(),
            AgentNotice::Disconnected => agent.desktop_agent_disconnected(),
            AgentNotice::BrowserConnected => agent.browser_connected(),
            AgentNotice::BrowserDisconnected => agent.browser_disconnected(),
        }
    }
}

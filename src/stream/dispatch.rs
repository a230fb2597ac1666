//! Inbound envelope classification and response projection.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::CallError;
use crate::stream::correlator::RequestCorrelator;
use crate::stream::events::{SessionEvent, Subscribers};
use crate::stream::proto::{AgentPongMsg, Envelope, MessageType, Session};
use crate::stream::session::SessionCache;

/// Heartbeat traffic handed back to the connection worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LivenessSignal {
    AgentPong { is_provisioned: Option<bool> },
    ServerPong,
    AgentConnected,
    AgentDisconnected,
}

/// How a response payload becomes a typed result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Projection {
    /// Body carries no result; normalized to `{}`.
    Unit,
    Whole,
    /// Result sits under a single field.
    Field(&'static str),
}

fn projection(kind: MessageType) -> Option<Projection> {
    use MessageType::*;
    let projection = match kind {
        ProvisionResponse
        | UpdateTokenResponse
        | LeaveResponse
        | ChangeReceiverVolumeResponse
        | ToggleMicrophoneResponse
        | ChangeLatencyOptimizationLevelResponse
        | StartRecordingResponse
        | StopRecordingResponse => Projection::Unit,
        CreateSessionResponse
        | JoinResponse
        | SessionResponse
        | GetReceiverMeasurementsResponse
        | GetTransmitterMeasurementsResponse
        | BestAvailableServerResponse => Projection::Whole,
        GetReceiverVolumeResponse => Projection::Field("volume"),
        IsMicrophoneMutedResponse => Projection::Field("isMuted"),
        LatencyOptimizationLevelResponse => Projection::Field("latencyOptimizationLevel"),
        ServerInstancesResponse => Projection::Field("instances"),
        _ => return None,
    };
    Some(projection)
}

/// Projects a response envelope into the JSON value its operation returns.
///
/// A non-zero `errorCode` wins over the payload.
pub fn project(envelope: &Envelope) -> Result<Value, CallError> {
    let code = envelope.error_code();
    if !code.is_ok() {
        return Err(CallError::Remote(code));
    }
    match projection(envelope.kind) {
        Some(Projection::Unit) => Ok(Value::Object(Default::default())),
        Some(Projection::Whole) if envelope.content.is_null() => {
            Ok(Value::Object(Default::default()))
        }
        Some(Projection::Whole) => Ok(envelope.content.clone()),
        Some(Projection::Field(field)) => Ok(envelope
            .content
            .get(field)
            .cloned()
            .unwrap_or(Value::Null)),
        None => {
            warn!(event = "no_projection", kind = envelope.kind.as_str());
            Err(CallError::UnknownMessageType(envelope.kind.as_str()))
        }
    }
}

/// Routes inbound envelopes to liveness, pending calls, or subscribers.
#[derive(Debug)]
pub struct Dispatcher {
    correlator: Arc<RequestCorrelator>,
    cache: Mutex<SessionCache>,
    subscribers: Subscribers,
}

impl Dispatcher {
    pub fn new(correlator: Arc<RequestCorrelator>, subscribers: Subscribers) -> Self {
        Self {
            correlator,
            cache: Mutex::new(SessionCache::default()),
            subscribers,
        }
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Classifies one inbound envelope.
    ///
    /// Heartbeat tags are returned to the caller; everything else is
    /// consumed here.
    pub fn dispatch(&self, envelope: Envelope) -> Option<LivenessSignal> {
        match envelope.kind {
            MessageType::Pong => {
                let pong: AgentPongMsg =
                    serde_json::from_value(envelope.content).unwrap_or_default();
                trace!(event = "agent_pong", is_provisioned = pong.is_provisioned);
                return Some(LivenessSignal::AgentPong {
                    is_provisioned: pong.is_provisioned,
                });
            }
            MessageType::ServerPong => {
                trace!(event = "server_pong");
                return Some(LivenessSignal::ServerPong);
            }
            MessageType::DesktopAgentConnected => return Some(LivenessSignal::AgentConnected),
            MessageType::DesktopAgentDisconnected => {
                return Some(LivenessSignal::AgentDisconnected)
            }
            _ => {}
        }

        let envelope = match self.correlator.resolve(envelope) {
            Ok(()) => return None,
            Err(unmatched) => unmatched,
        };

        match SessionEvent::from_envelope(&envelope) {
            Ok(Some(event)) => {
                debug!(event = "session_event", kind = envelope.kind.as_str());
                self.with_cache(|cache| cache.apply_event(&event));
                self.subscribers.deliver(&event);
            }
            Ok(None) if envelope.kind == MessageType::Unknown => {
                warn!(event = "unknown_message_type", msg_id = %envelope.msg_id);
            }
            Ok(None) => {
                debug!(
                    event = "unsolicited_envelope_dropped",
                    kind = envelope.kind.as_str(),
                    msg_id = %envelope.msg_id
                );
            }
            Err(err) => {
                warn!(
                    event = "event_decode_failed",
                    kind = envelope.kind.as_str(),
                    error = %err
                );
            }
        }
        None
    }

    pub fn apply_session(&self, session: &Session) {
        self.with_cache(|cache| cache.apply_session(session.clone()));
    }

    pub fn clear_session(&self) {
        self.with_cache(SessionCache::clear);
    }

    pub fn cached_session(&self) -> Option<Session> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.snapshot())
    }

    /// Re-emits last-known connectivity so subscribers are not left with
    /// every peer shown offline after the agent comes back.
    pub fn replay_connectivity(&self) {
        let snapshot = match self.cache.lock() {
            Ok(cache) => cache.connectivity(),
            Err(_) => return,
        };
        debug!(
            event = "connectivity_replayed",
            receivers = snapshot.receivers.len()
        );
        if let Some(connected) = snapshot.transmitter {
            self.subscribers.transmitter_connectivity(connected);
        }
        for (identifier, connected) in &snapshot.receivers {
            self.subscribers.receiver_connectivity(identifier, *connected);
        }
    }

    fn with_cache(&self, apply: impl FnOnce(&mut SessionCache)) {
        if let Ok(mut cache) = self.cache.lock() {
            apply(&mut cache);
        }
    }
}

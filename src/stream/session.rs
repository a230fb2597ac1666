//! Locally cached view of the joined session.
//!
//! The cache is seeded by join/session responses and then reconciled from
//! push events, so readers get the current roster without a round trip.

use std::collections::HashMap;

use crate::stream::events::SessionEvent;
use crate::stream::proto::{Connection, Session};

const RECORDING_STARTED: &str = "started";
const RECORDING_STOPPED: &str = "stopped";

/// Last-known connectivity for replay after an agent reconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub transmitter: Option<bool>,
    /// Receivers in roster order.
    pub receivers: Vec<(String, bool)>,
}

#[derive(Debug, Default)]
pub struct SessionCache {
    session: Option<Session>,
    receiver_connectivity: HashMap<String, bool>,
    transmitter_connected: Option<bool>,
}

impl SessionCache {
    /// Replaces the cached session with a fresh snapshot from the agent.
    ///
    /// Connectivity is kept for receivers still in the roster.
    pub fn apply_session(&mut self, session: Session) {
        self.receiver_connectivity.retain(|identifier, _| {
            session
                .receivers
                .iter()
                .any(|receiver| &receiver.identifier == identifier)
        });
        if session.transmitter.is_none() {
            self.transmitter_connected = None;
        }
        self.session = Some(session);
    }

    pub fn apply_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::UserJoined(connection) => self.upsert_receiver(connection),
            SessionEvent::UserLeft { identifier } => {
                if let Some(session) = self.session.as_mut() {
                    session
                        .receivers
                        .retain(|receiver| &receiver.identifier != identifier);
                }
                self.receiver_connectivity.remove(identifier);
            }
            SessionEvent::UserMuted { identifier } => self.set_muted(identifier, true),
            SessionEvent::UserUnmuted { identifier } => self.set_muted(identifier, false),
            SessionEvent::TransmitterConnectivityChanged { connected } => {
                self.transmitter_connected = Some(*connected);
            }
            SessionEvent::ReceiverConnectivityChanged {
                identifier,
                connected,
            } => {
                self.receiver_connectivity
                    .insert(identifier.clone(), *connected);
            }
            SessionEvent::RecordingStarted => self.set_recording(RECORDING_STARTED),
            SessionEvent::RecordingStopped => self.set_recording(RECORDING_STOPPED),
            SessionEvent::SessionOut => self.clear(),
            SessionEvent::DiscoveryResult(_) | SessionEvent::DiscoveryLatencyResult(_) => {}
        }
    }

    pub fn clear(&mut self) {
        self.session = None;
        self.receiver_connectivity.clear();
        self.transmitter_connected = None;
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.session.clone()
    }

    pub fn connectivity(&self) -> ConnectivitySnapshot {
        let receivers = self
            .session
            .as_ref()
            .map(|session| {
                session
                    .receivers
                    .iter()
                    .filter_map(|receiver| {
                        self.receiver_connectivity
                            .get(&receiver.identifier)
                            .map(|connected| (receiver.identifier.clone(), *connected))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ConnectivitySnapshot {
            transmitter: self.transmitter_connected,
            receivers,
        }
    }

    fn upsert_receiver(&mut self, connection: &Connection) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let is_transmitter = session
            .transmitter
            .as_ref()
            .is_some_and(|transmitter| transmitter.identifier == connection.identifier);
        if is_transmitter {
            return;
        }
        match session
            .receivers
            .iter_mut()
            .find(|receiver| receiver.identifier == connection.identifier)
        {
            Some(existing) => *existing = connection.clone(),
            None => session.receivers.push(connection.clone()),
        }
    }

    fn set_muted(&mut self, identifier: &str, muted: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let target = session
            .transmitter
            .iter_mut()
            .chain(session.receivers.iter_mut())
            .find(|connection| connection.identifier == identifier);
        if let Some(connection) = target {
            connection.is_muted = muted;
        }
    }

    fn set_recording(&mut self, status: &str) {
        if let Some(session) = self.session.as_mut() {
            session.recording_status = Some(status.to_string());
        }
    }
}

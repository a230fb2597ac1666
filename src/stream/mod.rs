//! Realtime messaging modules.
//!
//! - `client`: websocket ownership, heartbeats, watchdogs and reconnects.
//! - `proto`: wire envelope and message payloads.
//! - `correlator`: pending request table keyed by `msgId`.
//! - `dispatch`: inbound classification and response projection.
//! - `events`: subscriber delegates and typed session events.
//! - `session`: cached session roster reconciled from events.

/// Websocket connection manager and handle.
pub mod client;
/// Request/response correlation.
pub mod correlator;
/// Inbound envelope routing.
pub mod dispatch;
/// Subscriber delegates and events.
pub mod events;
/// Peer liveness and watchdog state.
pub mod liveness;
/// Network presence polling.
pub mod presence;
/// Wire protocol messages.
pub mod proto;
/// Cached session state.
pub mod session;

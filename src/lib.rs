//! Rust SDK for the SyncStage control plane.
//!
//! The crate keeps one resilient websocket to the desktop agent (relayed
//! through the session service) and exposes a typed request/response
//! surface on top of it:
//! - `sdk`: the [`SyncStage`] facade and its builder.
//! - `stream`: connection manager, envelope codec, correlation and dispatch.
//! - `credential`: token expiry gating and refresh.
//! - `pairing`: persisted pairing identifier and connection addressing.
//! - `retry`: shared retry, backoff and timeout utilities.
//!
//! ```no_run
//! # async fn demo() -> Result<(), syncstage_sdk::CallError> {
//! use std::time::Duration;
//! use syncstage_sdk::SyncStageBuilder;
//!
//! let sdk = SyncStageBuilder::local().build();
//! sdk.wait_for_connection(Duration::from_secs(5)).await;
//! sdk.init("app-token").await?;
//! let server = sdk.get_best_available_server().await?;
//! let created = sdk
//!     .create_session(&server.zone_id, &server.studio_server_id, "user-1")
//!     .await?;
//! sdk.join(&created.session_code, "user-1", &server.zone_id, &server.studio_server_id, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Wall-clock sources.
pub mod clock;
/// Token expiry decoding and the refresh gate.
pub mod credential;
/// Error codes and error types.
pub mod error;
/// Pairing identifier storage and connection URLs.
pub mod pairing;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Public operation facade.
pub mod sdk;
/// Websocket connection, protocol types, and inbound routing.
pub mod stream;

pub use error::{CallError, ConnectionError, SdkErrorCode};
pub use sdk::{SyncStage, SyncStageBuilder};
pub use stream::client::{ConnectionOptions, ConnectionState};
pub use stream::correlator::CallOptions;
pub use stream::proto::{
    Connection, LatencyOptimizationLevel, Measurements, MessageType, ServerInstance, Session,
    SessionIdentifier, ZoneLatency,
};

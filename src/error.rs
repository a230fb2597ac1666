//! Error codes and error types shared by the facade and the messaging layer.
//!
//! Every public operation resolves to `Result<T, CallError>`. The numeric
//! [`SdkErrorCode`] is what crosses the wire in an envelope's `errorCode`
//! field and what callers get back from [`CallError::code`].

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Numeric result code reported by the desktop agent or synthesized locally.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SdkErrorCode {
    UnknownError,
    Ok,
    ConfigurationError,
    ApiError,
    ApiUnauthorized,
    AudioStreamingError,
    StreamDoesNotExist,
    BadVolumeValue,
    SessionNotJoined,
    AudioServerNotReachable,
    /// No response arrived, the socket was not open, or the call was flushed.
    CommunicationError,
    /// A single attempt ran past its deadline.
    Timeout,
    /// The response type did not match the request's expected response.
    ProtocolMismatch,
    /// The credential expired and could not be refreshed.
    TokenExpired,
    /// The envelope type is known to neither the response nor event tables.
    UnknownMessageType,
    /// The desktop agent does not support the requested operation.
    Incompatible,
}

impl SdkErrorCode {
    /// Wire representation.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::UnknownError => -1,
            Self::Ok => 0,
            Self::ConfigurationError => 1,
            Self::ApiError => 2,
            Self::ApiUnauthorized => 3,
            Self::AudioStreamingError => 4,
            Self::StreamDoesNotExist => 5,
            Self::BadVolumeValue => 6,
            Self::SessionNotJoined => 7,
            Self::AudioServerNotReachable => 8,
            Self::CommunicationError => 9,
            Self::Timeout => 10,
            Self::ProtocolMismatch => 11,
            Self::TokenExpired => 12,
            Self::UnknownMessageType => 13,
            Self::Incompatible => 14,
        }
    }

    /// Maps a wire code back to a variant. Unmapped codes become `UnknownError`.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::ConfigurationError,
            2 => Self::ApiError,
            3 => Self::ApiUnauthorized,
            4 => Self::AudioStreamingError,
            5 => Self::StreamDoesNotExist,
            6 => Self::BadVolumeValue,
            7 => Self::SessionNotJoined,
            8 => Self::AudioServerNotReachable,
            9 => Self::CommunicationError,
            10 => Self::Timeout,
            11 => Self::ProtocolMismatch,
            12 => Self::TokenExpired,
            13 => Self::UnknownMessageType,
            14 => Self::Incompatible,
            _ => Self::UnknownError,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Failure of a single request/response call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("no response from the desktop agent")]
    Communication,

    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("expected {expected} but received {received}")]
    ProtocolMismatch {
        expected: &'static str,
        received: &'static str,
    },

    #[error("credential expired and no replacement was supplied")]
    TokenExpired,

    #[error("no payload projection for {0}")]
    UnknownMessageType(&'static str),

    #[error("request is not supported by this desktop agent version")]
    Incompatible,

    #[error("desktop agent reported {0:?}")]
    Remote(SdkErrorCode),

    #[error("invalid argument: {0:?}")]
    InvalidArgument(SdkErrorCode),

    #[error("failed to decode response payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CallError {
    /// Error code half of the facade's `(result, code)` pair.
    pub fn code(&self) -> SdkErrorCode {
        match self {
            Self::Communication => SdkErrorCode::CommunicationError,
            Self::Timeout { .. } => SdkErrorCode::Timeout,
            Self::ProtocolMismatch { .. } => SdkErrorCode::ProtocolMismatch,
            Self::TokenExpired => SdkErrorCode::TokenExpired,
            Self::UnknownMessageType(_) => SdkErrorCode::UnknownMessageType,
            Self::Incompatible => SdkErrorCode::Incompatible,
            Self::Remote(code) | Self::InvalidArgument(code) => *code,
            Self::Payload(_) => SdkErrorCode::UnknownError,
        }
    }

    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors produced while opening or driving the websocket transport.
///
/// These never reach facade callers; the connection manager recovers from
/// them by reconnecting.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("socket did not open within {0}ms")]
    OpenTimeout(u64),

    #[error("socket is not open")]
    NotOpen,

    #[error("connection worker has stopped")]
    WorkerStopped,
}

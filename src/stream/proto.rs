//! Wire envelope and message taxonomy shared with the desktop agent.
//!
//! Every frame is a JSON text message of the shape
//! `{type, msgId, time, errorCode, content}`. The `content` shape depends on
//! `type`; typed payloads for the requests and events this crate understands
//! live at the bottom of this module.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SdkErrorCode;

macro_rules! message_types {
    ($($variant:ident),+ $(,)?) => {
        /// Closed set of envelope tags.
        ///
        /// Tags the agent sends that this crate does not know decode to
        /// [`MessageType::Unknown`].
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        pub enum MessageType {
            $($variant,)+
            #[serde(other)]
            Unknown,
        }

        impl MessageType {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                    Self::Unknown => "Unknown",
                }
            }
        }
    };
}

message_types! {
    ProvisionRequest,
    ProvisionResponse,
    UpdateTokenRequest,
    UpdateTokenResponse,
    CreateSessionRequest,
    CreateSessionResponse,
    JoinRequest,
    JoinResponse,
    LeaveRequest,
    LeaveResponse,
    SessionRequest,
    SessionResponse,
    ChangeReceiverVolumeRequest,
    ChangeReceiverVolumeResponse,
    GetReceiverVolumeRequest,
    GetReceiverVolumeResponse,
    ToggleMicrophoneRequest,
    ToggleMicrophoneResponse,
    IsMicrophoneMutedRequest,
    IsMicrophoneMutedResponse,
    GetReceiverMeasurementsRequest,
    GetReceiverMeasurementsResponse,
    GetTransmitterMeasurementsRequest,
    GetTransmitterMeasurementsResponse,
    BestAvailableServerRequest,
    BestAvailableServerResponse,
    ServerInstancesRequest,
    ServerInstancesResponse,
    LatencyOptimizationLevelRequest,
    LatencyOptimizationLevelResponse,
    ChangeLatencyOptimizationLevelRequest,
    ChangeLatencyOptimizationLevelResponse,
    StartRecordingRequest,
    StartRecordingResponse,
    StopRecordingRequest,
    StopRecordingResponse,
    UserJoined,
    UserLeft,
    UserMuted,
    UserUnmuted,
    TransmitterConnectivityChanged,
    ReceiverConnectivityChanged,
    RecordingStarted,
    RecordingStopped,
    SessionOut,
    DiscoveryResult,
    DiscoveryLatencyResult,
    DesktopAgentConnected,
    DesktopAgentDisconnected,
    IsDesktopAgentConnected,
    Incompatible,
    Ping,
    Pong,
    ServerPing,
    ServerPong,
}

impl MessageType {
    /// The single response type each request type expects.
    ///
    /// `None` for everything that is not a request.
    pub fn expected_response(self) -> Option<MessageType> {
        use MessageType::*;
        let response = match self {
            ProvisionRequest => ProvisionResponse,
            UpdateTokenRequest => UpdateTokenResponse,
            CreateSessionRequest => CreateSessionResponse,
            JoinRequest => JoinResponse,
            LeaveRequest => LeaveResponse,
            SessionRequest => SessionResponse,
            ChangeReceiverVolumeRequest => ChangeReceiverVolumeResponse,
            GetReceiverVolumeRequest => GetReceiverVolumeResponse,
            ToggleMicrophoneRequest => ToggleMicrophoneResponse,
            IsMicrophoneMutedRequest => IsMicrophoneMutedResponse,
            GetReceiverMeasurementsRequest => GetReceiverMeasurementsResponse,
            GetTransmitterMeasurementsRequest => GetTransmitterMeasurementsResponse,
            BestAvailableServerRequest => BestAvailableServerResponse,
            ServerInstancesRequest => ServerInstancesResponse,
            LatencyOptimizationLevelRequest => LatencyOptimizationLevelResponse,
            ChangeLatencyOptimizationLevelRequest => ChangeLatencyOptimizationLevelResponse,
            StartRecordingRequest => StartRecordingResponse,
            StopRecordingRequest => StopRecordingResponse,
            ProvisionResponse
            | UpdateTokenResponse
            | CreateSessionResponse
            | JoinResponse
            | LeaveResponse
            | SessionResponse
            | ChangeReceiverVolumeResponse
            | GetReceiverVolumeResponse
            | ToggleMicrophoneResponse
            | IsMicrophoneMutedResponse
            | GetReceiverMeasurementsResponse
            | GetTransmitterMeasurementsResponse
            | BestAvailableServerResponse
            | ServerInstancesResponse
            | LatencyOptimizationLevelResponse
            | ChangeLatencyOptimizationLevelResponse
            | StartRecordingResponse
            | StopRecordingResponse
            | UserJoined
            | UserLeft
            | UserMuted
            | UserUnmuted
            | TransmitterConnectivityChanged
            | ReceiverConnectivityChanged
            | RecordingStarted
            | RecordingStopped
            | SessionOut
            | DiscoveryResult
            | DiscoveryLatencyResult
            | DesktopAgentConnected
            | DesktopAgentDisconnected
            | IsDesktopAgentConnected
            | Incompatible
            | Ping
            | Pong
            | ServerPing
            | ServerPong
            | Unknown => return None,
        };
        Some(response)
    }

    /// Side-channel heartbeat traffic that is never logged at info level.
    pub fn is_heartbeat(self) -> bool {
        matches!(
            self,
            Self::Ping | Self::Pong | Self::ServerPing | Self::ServerPong
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    /// Builds an outbound envelope with a fresh correlation id.
    pub fn new(kind: MessageType, content: Value) -> Self {
        let content = if content.is_null() {
            Value::Object(Default::default())
        } else {
            content
        };
        Self {
            kind,
            msg_id: Uuid::new_v4().to_string(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            error_code: 0,
            content,
        }
    }

    /// Reply envelope that reuses `request`'s correlation id.
    pub fn reply_to(request: &Envelope, kind: MessageType, content: Value) -> Self {
        Self {
            msg_id: request.msg_id.clone(),
            ..Self::new(kind, content)
        }
    }

    pub fn with_error_code(mut self, code: SdkErrorCode) -> Self {
        self.error_code = code.as_i32();
        self
    }

    pub fn error_code(&self) -> SdkErrorCode {
        SdkErrorCode::from_i32(self.error_code)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Content of `ProvisionRequest` and `UpdateTokenRequest`.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenMsg {
    pub token: String,
}

impl std::fmt::Debug for TokenMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMsg").field("token", &"[REDACTED]").finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionMsg {
    pub zone_id: String,
    pub studio_server_id: String,
    pub user_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinMsg {
    pub session_code: String,
    pub user_id: String,
    pub zone_id: String,
    pub studio_server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Content of requests that address a single receiver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IdentifierMsg {
    pub identifier: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChangeVolumeMsg {
    pub identifier: String,
    pub volume: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToggleMicrophoneMsg {
    pub mute: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyLevelMsg {
    pub latency_optimization_level: LatencyOptimizationLevel,
}

/// Trade-off between audio quality and latency applied by the agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LatencyOptimizationLevel {
    HighQuality,
    Optimized,
    BestPerformance,
    UltraFast,
}

impl From<LatencyOptimizationLevel> for u8 {
    fn from(level: LatencyOptimizationLevel) -> Self {
        match level {
            LatencyOptimizationLevel::HighQuality => 0,
            LatencyOptimizationLevel::Optimized => 1,
            LatencyOptimizationLevel::BestPerformance => 2,
            LatencyOptimizationLevel::UltraFast => 3,
        }
    }
}

impl TryFrom<u8> for LatencyOptimizationLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::HighQuality),
            1 => Ok(Self::Optimized),
            2 => Ok(Self::BestPerformance),
            3 => Ok(Self::UltraFast),
            other => Err(format!("unknown latency optimization level {other}")),
        }
    }
}

/// Participant connection inside a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(alias = "connectionId")]
    pub identifier: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Session snapshot returned by join/session responses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub session_code: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub transmitter: Option<Connection>,
    #[serde(default)]
    pub receivers: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_status: Option<String>,
}

impl Session {
    pub fn is_recording(&self) -> bool {
        self.recording_status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("started"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentifier {
    pub session_id: String,
    pub session_code: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Measurements {
    pub network_delay_ms: f64,
    pub network_jitter_ms: f64,
    pub quality: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    pub zone_id: String,
    #[serde(default)]
    pub zone_name: String,
    pub studio_server_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZoneLatency {
    pub zone_id: String,
    pub latency: f64,
}

/// `content` of the transmitter and receiver connectivity events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectivityMsg {
    #[serde(default)]
    pub identifier: String,
    pub connected: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryMsg {
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryLatencyMsg {
    #[serde(default)]
    pub results: Vec<ZoneLatency>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentPongMsg {
    #[serde(default)]
    pub is_provisioned: Option<bool>,
}

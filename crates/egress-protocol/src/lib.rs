use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub trace_id: Option<String>,
    pub code: Option<String>,
}

impl ProblemDetails {
    pub fn new(status: u16, code: &str, title: impl Into<String>) -> Self {
        Self {
            r#type: "about:blank".into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            trace_id: None,
            code: Some(code.to_string()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

// -------- Lifecycle --------

/// Lifecycle state of an egress job.
///
/// Progression is forward-only: `Starting -> Active -> Ending -> Complete`, with
/// `Aborted` reachable from any non-terminal state.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EgressStatus {
    #[default]
    Starting,
    Active,
    Ending,
    Complete,
    Aborted,
}

impl EgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgressStatus::Starting => "STARTING",
            EgressStatus::Active => "ACTIVE",
            EgressStatus::Ending => "ENDING",
            EgressStatus::Complete => "COMPLETE",
            EgressStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EgressStatus::Complete | EgressStatus::Aborted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: EgressStatus) -> bool {
        use EgressStatus::*;
        match (self, next) {
            (Starting, Active) | (Active, Ending) | (Ending, Complete) => true,
            // explicit stop before the pipeline reported in
            (Starting, Ending) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for EgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cost category selected by the start request payload.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    RoomComposite,
    Web,
    TrackComposite,
    Track,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::RoomComposite,
        RequestKind::Web,
        RequestKind::TrackComposite,
        RequestKind::Track,
    ];

    /// Metric label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::RoomComposite => "room_composite",
            RequestKind::Web => "web",
            RequestKind::TrackComposite => "track_composite",
            RequestKind::Track => "track",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            RequestKind::RoomComposite => 0,
            RequestKind::Web => 1,
            RequestKind::TrackComposite => 2,
            RequestKind::Track => 3,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------- Requests --------
//
// Variant bodies carry only what routing needs; layout, encoding and output
// settings stay opaque (`output`) and are interpreted by the pipeline.

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RoomCompositeEgressRequest {
    pub room_name: String,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct WebEgressRequest {
    pub url: String,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct TrackCompositeEgressRequest {
    pub room_name: String,
    #[serde(default)]
    pub audio_track_id: Option<String>,
    #[serde(default)]
    pub video_track_id: Option<String>,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct TrackEgressRequest {
    pub room_name: String,
    pub track_id: String,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(tag = "type", content = "request", rename_all = "snake_case")]
pub enum StartEgressPayload {
    RoomComposite(RoomCompositeEgressRequest),
    Web(WebEgressRequest),
    TrackComposite(TrackCompositeEgressRequest),
    Track(TrackEgressRequest),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StartEgressRequest {
    pub room_id: String,
    pub ws_url: String,
    pub request: StartEgressPayload,
}

impl StartEgressRequest {
    pub fn kind(&self) -> RequestKind {
        match self.request {
            StartEgressPayload::RoomComposite(_) => RequestKind::RoomComposite,
            StartEgressPayload::Web(_) => RequestKind::Web,
            StartEgressPayload::TrackComposite(_) => RequestKind::TrackComposite,
            StartEgressPayload::Track(_) => RequestKind::Track,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StopEgressRequest {
    pub egress_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(tag = "type", content = "request", rename_all = "snake_case")]
pub enum EgressControl {
    Stop(StopEgressRequest),
}

/// Request addressed to an existing egress.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct EgressRequest {
    pub egress_id: String,
    pub request: EgressControl,
}

impl EgressRequest {
    pub fn stop(egress_id: impl Into<String>) -> Self {
        let egress_id = egress_id.into();
        Self {
            request: EgressControl::Stop(StopEgressRequest {
                egress_id: egress_id.clone(),
            }),
            egress_id,
        }
    }
}

// -------- Info / updates --------

/// Public view of an egress job. Timestamps are epoch millis, zero when unset.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct EgressInfo {
    pub egress_id: String,
    pub room_id: String,
    pub status: EgressStatus,
    #[serde(default)]
    pub started_at: u64,
    #[serde(default)]
    pub ended_at: u64,
    #[serde(default)]
    pub error: String,
}

// -------- Bus envelopes --------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum BusRequest {
    Start(StartEgressRequest),
    Egress(EgressRequest),
    List,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RpcRequest {
    pub correlation_id: String,
    pub request: BusRequest,
}

/// Exactly one response is sent per request carrying a reply subject.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RpcResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub info: Option<EgressInfo>,
    #[serde(default)]
    pub items: Option<Vec<EgressInfo>>,
    #[serde(default)]
    pub error: Option<ProblemDetails>,
}

impl RpcResponse {
    pub fn info(correlation_id: impl Into<String>, info: EgressInfo) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            info: Some(info),
            items: None,
            error: None,
        }
    }

    pub fn items(correlation_id: impl Into<String>, items: Vec<EgressInfo>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            info: None,
            items: Some(items),
            error: None,
        }
    }

    pub fn problem(correlation_id: impl Into<String>, problem: ProblemDetails) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            info: None,
            items: None,
            error: Some(problem),
        }
    }
}

/// JSON wire codec shared by every bus payload.
pub trait Wire: Sized {
    fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error>;
    fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error>;
}

impl<T: Serialize + DeserializeOwned> Wire for T {
    fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

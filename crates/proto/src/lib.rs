//! Switchyard wire types
//!
//! Request/response contracts shared between the coordinator, its inbound
//! transport and the model-serving backends it fronts. Plain serde types;
//! the backends speak OpenAI-compatible JSON over HTTP.

use serde::{Deserialize, Serialize};

// Inbound request types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Marks a message as stable context worth caching even mid-conversation
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache: bool,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            cache: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Opaque caller identity token
    pub caller: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Explicit backend id or alias
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub specialization: Option<String>,
    #[serde(default)]
    pub prefer_speed: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl InferenceRequest {
    pub fn new(caller: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            caller: caller.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_specialization(mut self, tag: impl Into<String>) -> Self {
        self.specialization = Some(tag.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_prefer_speed(mut self, prefer_speed: bool) -> Self {
        self.prefer_speed = prefer_speed;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Content of the final message, the turn the caller is asking about
    pub fn last_content(&self) -> &str {
        self.messages.last().map(|m| m.content.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: String,
    pub backend: String,
    pub text: String,
    pub usage: TokenUsage,
    pub prefix_cache_hit: bool,
}

// Backend control endpoint types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Body of a readiness probe; backends that only return a status code
/// are treated as `ready` with unknown load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    #[serde(default = "default_ready")]
    pub ready: bool,
    #[serde(default)]
    pub load: Option<u32>,
}

fn default_ready() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: TokenUsage,
    /// Handle to the computed prefix state, if the backend retained one
    #[serde(default)]
    pub prefix_handle: Option<String>,
}

// Rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    NoCapacity,
    RateLimited,
    InvalidRequest,
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectionKind::NoCapacity => "no_capacity",
            RejectionKind::RateLimited => "rate_limited",
            RejectionKind::InvalidRequest => "invalid_request",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// False when the request can never succeed on this fleet
    pub retryable: bool,
}

// Fleet health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Starting,
    Ready,
    Degraded,
    Down,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendStatus::Starting => "starting",
            BackendStatus::Ready => "ready",
            BackendStatus::Degraded => "degraded",
            BackendStatus::Down => "down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealthReport {
    pub id: String,
    pub status: BackendStatus,
    pub consecutive_failures: u32,
    pub in_flight: u32,
    pub last_probe_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetHealth {
    pub ready: usize,
    pub degraded: usize,
    pub starting: usize,
    pub down: usize,
    pub backends: Vec<BackendHealthReport>,
}

impl FleetHealth {
    pub fn from_reports(backends: Vec<BackendHealthReport>) -> Self {
        let count = |status| backends.iter().filter(|b| b.status == status).count();
        Self {
            ready: count(BackendStatus::Ready),
            degraded: count(BackendStatus::Degraded),
            starting: count(BackendStatus::Starting),
            down: count(BackendStatus::Down),
            backends,
        }
    }

    /// True when at least one backend can take traffic
    pub fn is_serving(&self) -> bool {
        self.ready > 0
    }
}

use serde::{Deserialize, Serialize};

/// Category attached to a failed tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    Network,
    InvalidArguments,
    NotFound,
    Disabled,
    Internal,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Network => "network",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::Disabled => "disabled",
            ToolErrorKind::Internal => "internal",
        }
    }
}

/// Failures surfaced by the model gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid structured output: {0}")]
    InvalidStructuredOutput(String),
    #[error("context overflow: {0}")]
    ContextOverflow(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Retried inside the gateway with backoff; everything else bubbles.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::TransientNetwork(_) | LlmError::RateLimited(_))
    }
}

/// Failures surfaced by the event scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("reminder quota exceeded for {user_ref} (limit {limit})")]
    QuotaExceeded { user_ref: String, limit: usize },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

/// Top-level error taxonomy of the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("input too large: {0}")]
    InputTooLarge(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

impl CoreError {
    /// Stable code for logs and user-facing apologies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigInvalid(_) => "config_invalid",
            CoreError::InputTooLarge(_) => "input_too_large",
            CoreError::Llm(LlmError::TransientNetwork(_)) => "transient_network",
            CoreError::Llm(LlmError::RateLimited(_)) => "rate_limited",
            CoreError::Llm(LlmError::InvalidStructuredOutput(_)) => "invalid_structured_output",
            CoreError::Llm(LlmError::ContextOverflow(_)) => "context_overflow",
            CoreError::Llm(LlmError::Provider(_)) => "provider_error",
            CoreError::Llm(LlmError::Cancelled) | CoreError::Cancelled => "cancelled",
            CoreError::Schedule(ScheduleError::QuotaExceeded { .. }) => "quota_exceeded",
            CoreError::Schedule(_) => "schedule_error",
            CoreError::Internal(_) => "internal",
        }
    }
}

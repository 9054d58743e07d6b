use crate::api::models::{Message, MessageId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    /// Plan-gated writes are refused with 402 or 403.
    pub fn is_entitlement_denied(&self) -> bool {
        matches!(self, ApiError::Status { status: 402 | 403, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyContent,
    #[error("no conversation is open")]
    NoPeerSelected,
    #[error("cannot open a conversation with yourself")]
    SelfConversation,
    #[error("an identical message is still being sent")]
    DuplicatePending,
    #[error("message {0} is not in the open conversation")]
    UnknownMessage(MessageId),
    #[error("message {0} has not been confirmed yet")]
    TemporaryMessage(MessageId),
    #[error("reaction is empty")]
    EmptyEmoji,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Push channel trouble. Absorbed by the session; the transport heals itself.
    #[error("push channel unavailable: {0}")]
    Transport(String),
    #[error("an active plan is required")]
    EntitlementDenied { remaining: Option<Duration> },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("network error: {0}")]
    Network(String),
}

impl ChatError {
    pub fn is_entitlement_denied(&self) -> bool {
        matches!(self, ChatError::EntitlementDenied { .. })
    }
}

impl From<ApiError> for ChatError {
    fn from(err: ApiError) -> Self {
        if err.is_entitlement_denied() {
            ChatError::EntitlementDenied { remaining: None }
        } else {
            ChatError::Network(err.to_string())
        }
    }
}

/// A send that did not reach the server. `message` is the rolled-back entry
/// in `DeliveryState::Failed`, kept so it can be shown and retried.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("message not sent: {error}")]
pub struct SendFailure {
    pub message: Message,
    pub error: ChatError,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config directory available")]
    NoConfigDir,
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config write: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("legacy config: {0}")]
    Legacy(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme: {0}")]
    Scheme(String),
}

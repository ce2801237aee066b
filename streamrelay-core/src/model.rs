use serde::{Deserialize, Serialize};

/// Fixed instruction prepended to every upstream request. Never stored in
/// history and never displayed.
pub const DIRECTIVE_PREAMBLE: &str = "You are an artificial intelligence assistant and you need to engage in a helpful, detailed, polite conversation with a user. Use markdown headers (## for main sections and ### for subsections) to structure your responses with clear titles. Make sure to use headers for important sections of your response.";

/// Assistant turn committed when an exchange fails.
pub const FALLBACK_REPLY: &str = "I apologize, but I encountered an error. Please try again.";

/// Opaque message returned by the relay for every failure.
pub const GENERIC_ERROR: &str = "Internal server error";

/// Roles on the upstream wire.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Roles a conversation turn may carry. `system` is reserved for the preamble.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl From<TurnRole> for Role {
    fn from(r: TurnRole) -> Self {
        match r {
            TurnRole::User => Role::User,
            TurnRole::Assistant => Role::Assistant,
        }
    }
}

/// One role-tagged message of a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    pub fn fallback() -> Self {
        Self::assistant(FALLBACK_REPLY)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

impl From<Turn> for ChatMessage {
    fn from(t: Turn) -> Self {
        Self {
            role: t.role.into(),
            content: t.content,
        }
    }
}

/// Body of `POST /api/chat`. Unknown fields are ignored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RelayRequest {
    pub messages: Vec<Turn>,
}

/// Body of every relay failure response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn generic() -> Self {
        Self {
            error: GENERIC_ERROR.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ContentFilter,
    Other,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Other => "other",
        }
    }
}

/// Upstream streaming completion request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: u32,
    pub request_id: Option<String>,
}

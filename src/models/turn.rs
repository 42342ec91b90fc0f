//! Conversation turns and the action calls they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text marker that opens every synthetic summary turn.
pub const SUMMARY_MARKER: &str = "[Previous conversation summary]";

/// Author of a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Message from the end user.
    User,
    /// Message produced by the agent.
    Assistant,
    /// Result of a side-effecting action requested by the agent.
    #[serde(alias = "action-result", alias = "tool")]
    ActionResult,
}

impl Role {
    /// Label used when rendering a transcript.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::ActionResult => "ActionResult",
        }
    }
}

/// One structured content block (`{"type":"text","text":"..."}` and friends).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentBlock {
    /// Block kind; only `text` blocks contribute to the rendered text.
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for `text` blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Any other block fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentBlock {
    /// Build a plain text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

/// Turn payload: plain text or a list of structured blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    /// Plain text.
    Text(String),
    /// Structured blocks.
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Concatenated text of the content, ignoring non-text blocks.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Number of characters in the rendered text.
    #[must_use]
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text(text) => text.chars().count(),
            Self::Blocks(_) => self.as_text().chars().count(),
        }
    }
}

/// A side effect requested by an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCall {
    /// Correlation identifier echoed by the matching action-result turn.
    pub id: String,
    /// Action name.
    pub name: String,
    /// Action arguments.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ActionCall {
    /// Construct an action call with a generated identifier.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Turn {
    /// Unique turn identifier.
    pub id: String,
    /// Author.
    pub role: Role,
    /// Payload.
    pub content: Content,
    /// Side effects requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_calls: Vec<ActionCall>,
    /// For action-result turns, the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_call_id: Option<String>,
    /// Set on the synthetic turn produced by history compression.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn build(role: Role, content: Content) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            action_calls: Vec::new(),
            action_call_id: None,
            summary: false,
            created_at: Utc::now(),
        }
    }

    /// A user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::build(Role::User, Content::Text(text.into()))
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::build(Role::Assistant, Content::Text(text.into()))
    }

    /// An assistant message that requests side effects.
    #[must_use]
    pub fn assistant_with_actions(text: impl Into<String>, calls: Vec<ActionCall>) -> Self {
        let mut turn = Self::assistant(text);
        turn.action_calls = calls;
        turn
    }

    /// The result of one action call.
    #[must_use]
    pub fn action_result(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut turn = Self::build(Role::ActionResult, Content::Text(text.into()));
        turn.action_call_id = Some(call_id.into());
        turn
    }

    /// The synthetic assistant turn that replaces a compressed prefix.
    #[must_use]
    pub fn summary(summary_text: &str) -> Self {
        let mut turn = Self::assistant(format!("{SUMMARY_MARKER}\n{summary_text}"));
        turn.summary = true;
        turn
    }

    /// Rendered text of the turn.
    #[must_use]
    pub fn text(&self) -> String {
        self.content.as_text()
    }

    /// Whether this turn is a compression summary.
    ///
    /// Recognizes both the explicit flag and the text marker, so summaries
    /// written before the flag existed are still detected.
    #[must_use]
    pub fn is_summary(&self) -> bool {
        if self.role != Role::Assistant {
            return false;
        }
        self.summary || self.text().starts_with(SUMMARY_MARKER)
    }
}

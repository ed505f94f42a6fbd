//! Chat history entries as they are persisted in a session and handed to a
//! model backend.
//!
//! Tool traffic rides on ordinary messages: an assistant entry records the
//! calls it asked for, and each call's outcome comes back as a `Role::Tool`
//! entry keyed by the call id.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    #[serde(default = "Utc::now", alias = "timestamp")]
    pub created_at: DateTime<Utc>,

    /// Absent for plain text turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Side data that never reaches the model as text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Completion tokens reported for an assistant turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// `server__tool` key of the call a tool entry answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Set on the copy the window hands to the model, never on stored history.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub elided: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Tool entry with only a call id attached.
    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        if let Some(id) = tool_call_id {
            msg.meta_mut().tool_call_id = Some(id);
        }
        msg
    }

    /// Renders an executed call the way the model sees it on the next round.
    pub fn tool_result(result: &ToolResult) -> Self {
        let verb = if result.success { "returned" } else { "failed" };
        let mut msg = Self::new(
            Role::Tool,
            format!("[Tool '{}' {verb}]\n{}", result.name, result.output),
        );
        let meta = msg.meta_mut();
        meta.tool_call_id = result.id.clone();
        meta.tool_name = Some(result.name.clone());
        msg
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.meta_mut().tool_calls = calls;
        self
    }

    /// Metadata, created empty on first access.
    pub fn meta_mut(&mut self) -> &mut MessageMetadata {
        self.metadata.get_or_insert_with(MessageMetadata::default)
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        self.metadata.as_ref().map_or(&[], |m| m.tool_calls.as_slice())
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_call_id.as_deref()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_name.as_deref()
    }

    pub fn is_elided(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.elided)
    }
}

/// Ordered, append-only history of a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Leading system entry; only the first position counts.
    pub fn system_prompt(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl FromIterator<Message> for Conversation {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_only_in_first_position() {
        let conv: Conversation = [Message::user("Hi"), Message::system("late")].into_iter().collect();
        assert!(conv.system_prompt().is_none());

        let mut conv = Conversation::new();
        conv.push(Message::system("You answer briefly."));
        conv.extend([Message::user("Hi"), Message::assistant("Hello!")]);
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.last().map(|m| m.role), Some(Role::Assistant));
        assert_eq!(conv.system_prompt().map(|m| m.content.as_str()), Some("You answer briefly."));
    }

    #[test]
    fn test_tool_result_message_carries_metadata() {
        let result = ToolResult::success("weather__forecast", "sunny").with_id("call-1");
        let msg = Message::tool_result(&result);

        assert_eq!(msg.role, Role::Tool);
        assert!(msg.content.starts_with("[Tool 'weather__forecast' returned]"));
        assert_eq!(msg.tool_call_id(), Some("call-1"));
        assert_eq!(msg.tool_name(), Some("weather__forecast"));
        assert!(!msg.is_elided());
    }

    #[test]
    fn test_plain_message_has_no_metadata() {
        let msg = Message::user("Hello");
        assert!(msg.metadata.is_none());
        assert!(msg.tool_calls().is_empty());
        assert_eq!(msg.tool_name(), None);
    }

    #[test]
    fn test_metadata_serde_skips_empty_fields() {
        let msg = Message::tool("ok", Some("c1".into()));
        let json = serde_json::to_value(&msg).unwrap();
        let meta = &json["metadata"];
        assert_eq!(meta["tool_call_id"], "c1");
        assert!(meta.get("tool_calls").is_none());
        assert!(meta.get("elided").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), "assistant");
        assert_eq!(Role::Tool.to_string(), "tool");
    }
}

//! Conversation Window
//!
//! Bounded, read-only view over a session's history. Stored history is
//! never touched; the window is recomputed from it on every call.

use crate::message::{Message, Role};
use crate::session::Session;

/// Bounded view over session history
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationWindow {
    /// Most recent user/assistant turns to keep
    pub max_pairs: usize,

    /// Newest turns whose tool results are always kept verbatim
    pub verbatim_turns: usize,

    /// Tool results longer than this (in chars) are elided in older turns
    pub marker_threshold: usize,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self {
            max_pairs: 10,
            verbatim_turns: 1,
            marker_threshold: 800,
        }
    }
}

impl ConversationWindow {
    pub fn new(max_pairs: usize) -> Self {
        Self {
            max_pairs,
            ..Default::default()
        }
    }

    pub fn with_marker_threshold(mut self, chars: usize) -> Self {
        self.marker_threshold = chars;
        self
    }

    pub fn with_verbatim_turns(mut self, turns: usize) -> Self {
        self.verbatim_turns = turns;
        self
    }

    /// System messages followed by the last `max_pairs` turns
    ///
    /// A turn starts at a user message and runs until the next one, so its
    /// tool traffic and final answer stay together.
    pub fn window(&self, session: &Session) -> Vec<Message> {
        let history = session.conversation.messages();

        let mut out: Vec<Message> = history
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();

        let turns = split_turns(history);
        let keep_from = turns.len().saturating_sub(self.max_pairs);
        let kept = &turns[keep_from..];
        let verbatim_from = kept.len().saturating_sub(self.verbatim_turns);

        for (idx, turn) in kept.iter().enumerate() {
            let compress = idx < verbatim_from;
            for message in turn {
                if compress && self.should_elide(message) {
                    out.push(elide(message));
                } else {
                    out.push((*message).clone());
                }
            }
        }

        out
    }

    fn should_elide(&self, message: &Message) -> bool {
        message.role == Role::Tool && message.content.chars().count() > self.marker_threshold
    }
}

/// Non-system messages grouped by turn
fn split_turns(history: &[Message]) -> Vec<Vec<&Message>> {
    let mut turns: Vec<Vec<&Message>> = Vec::new();
    for message in history.iter().filter(|m| m.role != Role::System) {
        match turns.last_mut() {
            Some(turn) if message.role != Role::User => turn.push(message),
            _ => turns.push(vec![message]),
        }
    }
    turns
}

fn elide(message: &Message) -> Message {
    let name = message.tool_name().unwrap_or("unknown");
    let chars = message.content.chars().count();
    let mut compact = message.clone();
    compact.content = format!("[tool '{}' was called; result elided ({} chars)]", name, chars);
    compact.meta_mut().elided = true;
    compact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolResult;

    fn session_with_turns(turns: usize, tool_output: &str) -> Session {
        let mut session = Session::new();
        session.conversation.push(Message::system("You are a weather assistant."));
        for i in 0..turns {
            let result = ToolResult::success("weather__forecast", tool_output).with_id(format!("c{i}"));
            session.record_turn(vec![
                Message::user(format!("question {i}")),
                Message::tool_result(&result),
                Message::assistant(format!("answer {i}")),
            ]);
        }
        session
    }

    #[test]
    fn test_keeps_system_and_last_pairs() {
        let session = session_with_turns(5, "sunny");
        let window = ConversationWindow::new(2).window(&session);

        assert_eq!(window[0].role, Role::System);
        let users: Vec<&str> = window
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, vec!["question 3", "question 4"]);
        assert_eq!(window.len(), 1 + 2 * 3);
    }

    #[test]
    fn test_short_history_is_unchanged() {
        let session = session_with_turns(2, "sunny");
        let window = ConversationWindow::default().window(&session);
        assert_eq!(window, session.conversation.messages());
    }

    #[test]
    fn test_large_old_tool_results_become_markers() {
        let big = "x".repeat(2000);
        let session = session_with_turns(3, &big);
        let window = ConversationWindow::default().window(&session);

        let tools: Vec<&Message> = window.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tools.len(), 3);
        for old in &tools[..2] {
            assert_eq!(
                old.content,
                "[tool 'weather__forecast' was called; result elided (2036 chars)]"
            );
            assert!(old.metadata.as_ref().unwrap().elided);
            assert!(old.tool_call_id().is_some());
        }
        // Newest turn is verbatim
        assert!(tools[2].content.ends_with(&big));
    }

    #[test]
    fn test_window_is_pure() {
        let session = session_with_turns(12, &"y".repeat(1000));
        let snapshot = session.clone();
        let window = ConversationWindow::new(4);

        let first = window.window(&session);
        let second = window.window(&session);
        assert_eq!(first, second);
        assert_eq!(session, snapshot);
    }

    #[test]
    fn test_zero_pairs_keeps_only_system() {
        let session = session_with_turns(3, "ok");
        let window = ConversationWindow::new(0).window(&session);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::System);
    }
}

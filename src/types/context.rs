//! Conversation history kept by a session.

use serde::{Deserialize, Serialize};

use super::message::{ChatMessage, Role};

/// Ordered chat history: an optional system prompt followed by the
/// user/assistant exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatContext {
    messages: Vec<ChatMessage>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a context with a system prompt. Blank prompts are skipped.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let mut context = Self::new();
        if !prompt.trim().is_empty() {
            context.push(ChatMessage::system(prompt));
        }
        context
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text of the most recent message with the given role.
    pub fn last_text(&self, role: Role) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == role)
            .map(ChatMessage::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_system_prompt_is_not_recorded() {
        let context = ChatContext::with_system_prompt("   ");
        assert!(context.is_empty());
    }

    #[test]
    fn last_text_finds_latest_role() {
        let mut context = ChatContext::with_system_prompt("be funny");
        context.push(ChatMessage::user("first"));
        context.push(ChatMessage::assistant("reply"));
        context.push(ChatMessage::user("second"));

        assert_eq!(context.len(), 4);
        assert_eq!(context.last_text(Role::User).as_deref(), Some("second"));
        assert_eq!(context.last_text(Role::Assistant).as_deref(), Some("reply"));
        assert_eq!(context.last_text(Role::System).as_deref(), Some("be funny"));
    }
}

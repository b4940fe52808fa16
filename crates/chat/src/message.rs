use std::fmt;

use confab_llm::ProviderMessage;

/// Title given to a conversation before its first message.
pub const NEW_CONVERSATION_TITLE: &str = "New Chat";
/// Longest title, in characters, derived from a first message.
pub const TITLE_MAX_CHARS: usize = 40;
/// Text that replaces a model reply when sending fails.
pub const SEND_FAILED_TEXT: &str = "Sorry, something went wrong. Please try again.";

/// Stable identifier for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a typed conversation identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Builds the time-based identifier for a creation instant.
    pub fn from_unix_millis(millis: u64) -> Self {
        Self(format!("conv-{millis}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

/// One chat turn as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Empty model message that streamed fragments are appended to.
    pub fn model_placeholder() -> Self {
        Self::new(Role::Model, String::new())
    }

    /// Provider-side shape of this message.
    pub fn to_provider_message(&self) -> ProviderMessage {
        match self.role {
            Role::User => ProviderMessage::user(self.text.clone()),
            Role::Model => ProviderMessage::assistant(self.text.clone()),
        }
    }
}

/// Conversation record held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation titled [`NEW_CONVERSATION_TITLE`].
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            title: NEW_CONVERSATION_TITLE.to_string(),
            messages: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Title for list display; blank titles fall back to [`NEW_CONVERSATION_TITLE`].
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            NEW_CONVERSATION_TITLE
        } else {
            &self.title
        }
    }

    /// History in provider shape, skipping empty texts.
    pub fn provider_history(&self) -> Vec<ProviderMessage> {
        self.messages
            .iter()
            .filter(|message| !message.text.trim().is_empty())
            .map(Message::to_provider_message)
            .collect()
    }
}

/// Title derived from a conversation's first message.
pub fn derive_title(text: &str) -> String {
    let mut characters = text.chars();
    let mut title = characters.by_ref().take(TITLE_MAX_CHARS).collect::<String>();
    if characters.next().is_some() {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_llm::Role as ProviderRole;

    #[test]
    fn short_title_is_kept_verbatim() {
        assert_eq!(derive_title("Hello"), "Hello");
    }

    #[test]
    fn title_of_exactly_forty_chars_has_no_ellipsis() {
        let text = "a".repeat(TITLE_MAX_CHARS);
        assert_eq!(derive_title(&text), text);
    }

    #[test]
    fn long_title_is_truncated_with_ellipsis() {
        let text = "Explain the borrow checker like I am five years old";
        let title = derive_title(text);
        assert_eq!(title, format!("{}...", &text[..40]));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn title_truncation_counts_characters_not_bytes() {
        let text = "é".repeat(41);
        assert_eq!(derive_title(&text), format!("{}...", "é".repeat(40)));
    }

    #[test]
    fn provider_history_maps_roles_and_skips_empty_text() {
        let mut conversation = Conversation::new(ConversationId::new("conv-1"));
        conversation.messages = vec![
            Message::user("hi"),
            Message::new(Role::Model, "hello"),
            Message::user("again"),
            Message::model_placeholder(),
        ];

        let history = conversation.provider_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, ProviderRole::User);
        assert_eq!(history[1].role, ProviderRole::Assistant);
        assert_eq!(history[1].content, "hello");
    }

    #[test]
    fn blank_title_displays_default() {
        let mut conversation = Conversation::new(ConversationId::from_unix_millis(7));
        assert_eq!(conversation.id.as_str(), "conv-7");
        conversation.title = "  ".to_string();
        assert_eq!(conversation.display_title(), NEW_CONVERSATION_TITLE);
    }
}

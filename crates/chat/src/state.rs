use snafu::Snafu;

use crate::message::{
    Conversation, ConversationId, Message, Role, SEND_FAILED_TEXT, derive_title,
};
use crate::store::ConversationStore;

/// Everything the presentation layer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub conversations: ConversationStore,
    pub active_conversation_id: Option<ConversationId>,
    pub is_loading: bool,
    pub user_input: String,
}

/// State change input. [`ChatState::apply`] is the only way state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    /// Appends an empty conversation, activates it and clears the input.
    ConversationCreated(ConversationId),
    ConversationSelected(ConversationId),
    InputChanged(String),
    /// Appends the user message and the model placeholder, sets loading and
    /// clears the input.
    MessageSubmitted {
        conversation_id: ConversationId,
        text: String,
    },
    FragmentReceived {
        conversation_id: ConversationId,
        fragment: String,
    },
    ReplyFailed {
        conversation_id: ConversationId,
    },
    LoadingFinished,
}

/// Rejection reason for actions that do not fit the current state.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ActionRejection {
    #[snafu(display("conversation '{conversation_id}' does not exist"))]
    UnknownConversation { conversation_id: ConversationId },
    #[snafu(display("conversation '{conversation_id}' has no pending model reply"))]
    NoPendingReply { conversation_id: ConversationId },
}

pub type ActionResult = Result<(), ActionRejection>;

/// One row of the conversation sidebar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebarEntry<'a> {
    pub id: &'a ConversationId,
    pub title: &'a str,
    pub is_active: bool,
}

impl ChatState {
    /// Applies one action. A rejected action leaves the state untouched.
    pub fn apply(&mut self, action: ChatAction) -> ActionResult {
        match action {
            ChatAction::ConversationCreated(id) => {
                self.conversations.push(Conversation::new(id.clone()));
                self.active_conversation_id = Some(id);
                self.user_input.clear();
                Ok(())
            }
            ChatAction::ConversationSelected(id) => {
                self.active_conversation_id = Some(id);
                Ok(())
            }
            ChatAction::InputChanged(input) => {
                self.user_input = input;
                Ok(())
            }
            ChatAction::MessageSubmitted {
                conversation_id,
                text,
            } => self.apply_submitted(conversation_id, text),
            ChatAction::FragmentReceived {
                conversation_id,
                fragment,
            } => self.with_pending_reply(conversation_id, |reply| {
                reply.text.push_str(&fragment);
            }),
            ChatAction::ReplyFailed { conversation_id } => {
                self.with_pending_reply(conversation_id, |reply| {
                    reply.text = SEND_FAILED_TEXT.to_string();
                })
            }
            ChatAction::LoadingFinished => {
                self.is_loading = false;
                Ok(())
            }
        }
    }

    fn apply_submitted(&mut self, conversation_id: ConversationId, text: String) -> ActionResult {
        let Some(conversation) = self.conversations.get_mut(&conversation_id) else {
            return Err(ActionRejection::UnknownConversation { conversation_id });
        };

        if conversation.messages.is_empty() {
            conversation.title = derive_title(&text);
        }
        conversation.messages.push(Message::user(text));
        conversation.messages.push(Message::model_placeholder());
        self.is_loading = true;
        self.user_input.clear();
        Ok(())
    }

    fn with_pending_reply(
        &mut self,
        conversation_id: ConversationId,
        update: impl FnOnce(&mut Message),
    ) -> ActionResult {
        let Some(conversation) = self.conversations.get_mut(&conversation_id) else {
            return Err(ActionRejection::UnknownConversation { conversation_id });
        };

        match conversation.messages.last_mut() {
            Some(message) if message.role == Role::Model => {
                update(message);
                Ok(())
            }
            _ => Err(ActionRejection::NoPendingReply { conversation_id }),
        }
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Conversation matching the active id, if any.
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active_conversation_id
            .as_ref()
            .and_then(|id| self.conversations.get(id))
    }

    /// Sidebar rows, newest conversation first.
    pub fn sidebar_entries(&self) -> Vec<SidebarEntry<'_>> {
        self.conversations
            .iter()
            .rev()
            .map(|conversation| SidebarEntry {
                id: &conversation.id,
                title: conversation.display_title(),
                is_active: self.active_conversation_id.as_ref() == Some(&conversation.id),
            })
            .collect()
    }

    /// True while a reply is loading into the active conversation.
    pub fn shows_loading_indicator(&self) -> bool {
        self.is_loading
            && self
                .active_conversation()
                .and_then(Conversation::last_message)
                .is_some_and(|message| message.role == Role::Model)
    }

    /// Whether the input buffer may be submitted right now.
    pub fn can_submit(&self) -> bool {
        !self.is_loading && !self.user_input.trim().is_empty() && self.active_conversation().is_some()
    }
}

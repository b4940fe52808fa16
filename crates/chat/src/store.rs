use std::sync::Arc;

use crate::message::{Conversation, ConversationId};

/// Ordered conversation records, oldest first.
///
/// Records are shared between clones; a write copies only the record it
/// touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationStore {
    conversations: Vec<Arc<Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a conversation at the end of the store.
    pub fn push(&mut self, conversation: Conversation) {
        self.conversations.push(Arc::new(conversation));
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.iter().find(|conversation| &conversation.id == id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| &conversation.id == id)
            .map(Arc::make_mut)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Conversation> {
        self.conversations.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use confab_llm::{ChatSession, ProviderMessage, ProviderResult, SessionFactory};

use crate::message::ConversationId;

/// Remote chat sessions keyed by conversation.
///
/// A session is created the first time a conversation sends a message and is
/// reused for every later send in that conversation.
pub struct SessionRegistry {
    factory: Arc<dyn SessionFactory>,
    sessions: HashMap<ConversationId, ChatSession>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
        }
    }

    /// Returns the session for `conversation_id`, creating it from `seed` when
    /// missing. `seed` is ignored for an existing session. A failed creation
    /// stores nothing.
    pub async fn get_or_create(
        &mut self,
        conversation_id: &ConversationId,
        seed: Vec<ProviderMessage>,
    ) -> ProviderResult<&mut ChatSession> {
        match self.sessions.entry(conversation_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let seed_len = seed.len();
                let session = self.factory.create_session(seed).await?;
                tracing::info!(
                    conversation_id = %conversation_id,
                    model_id = %session.model_id(),
                    seed_len,
                    "opened chat session"
                );
                Ok(entry.insert(session))
            }
        }
    }

    pub fn session(&self, conversation_id: &ConversationId) -> Option<&ChatSession> {
        self.sessions.get(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.sessions.contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

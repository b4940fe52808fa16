//! Multi-conversation chat core: conversation state, per-conversation model
//! sessions and streamed replies.

mod manager;
mod message;
mod registry;
mod state;
mod store;

pub use manager::{ConversationManager, SendOutcome};
pub use message::{
    Conversation, ConversationId, Message, NEW_CONVERSATION_TITLE, Role, SEND_FAILED_TEXT,
    TITLE_MAX_CHARS, derive_title,
};
pub use registry::SessionRegistry;
pub use state::{ActionRejection, ActionResult, ChatAction, ChatState, SidebarEntry};
pub use store::ConversationStore;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use confab_llm::{ProviderMessage, ProviderResult, SessionFactory};
use tokio::sync::watch;

use crate::message::ConversationId;
use crate::registry::SessionRegistry;
use crate::state::{ChatAction, ChatState};

/// How a [`ConversationManager::send_message`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was sent: no active conversation or nothing to submit.
    Ignored,
    Completed,
    /// The placeholder now holds the send-failed text.
    Failed,
}

/// Owns the chat state and the per-conversation sessions.
///
/// Every change goes through [`ChatState::apply`] and is published to
/// subscribers as a whole snapshot.
pub struct ConversationManager {
    state: ChatState,
    sessions: SessionRegistry,
    snapshots: watch::Sender<Arc<ChatState>>,
    last_issued_millis: u64,
}

impl ConversationManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        let state = ChatState::default();
        let (snapshots, _) = watch::channel(Arc::new(state.clone()));
        Self {
            state,
            sessions: SessionRegistry::new(factory),
            snapshots,
            last_issued_millis: 0,
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// Receiver that sees a snapshot after every applied action.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatState>> {
        self.snapshots.subscribe()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Appends an empty conversation, makes it active and returns its id.
    pub fn start_new_conversation(&mut self) -> ConversationId {
        let id = self.next_conversation_id();
        Self::publish(
            &mut self.state,
            &self.snapshots,
            ChatAction::ConversationCreated(id.clone()),
        );
        tracing::debug!(conversation_id = %id, "started conversation");
        id
    }

    /// Starts a conversation when none exist yet.
    pub fn ensure_conversation(&mut self) -> Option<ConversationId> {
        self.state
            .conversations
            .is_empty()
            .then(|| self.start_new_conversation())
    }

    /// Makes `id` active. An unknown id leaves no active conversation.
    pub fn select_conversation(&mut self, id: ConversationId) {
        if !self.state.conversations.contains(&id) {
            tracing::debug!(conversation_id = %id, "selected unknown conversation");
        }
        Self::publish(
            &mut self.state,
            &self.snapshots,
            ChatAction::ConversationSelected(id),
        );
    }

    pub fn set_user_input(&mut self, text: impl Into<String>) {
        Self::publish(
            &mut self.state,
            &self.snapshots,
            ChatAction::InputChanged(text.into()),
        );
    }

    /// Sends the input buffer when it is non-blank and no reply is loading.
    pub async fn submit_input(&mut self) -> SendOutcome {
        if self.state.is_loading || self.state.user_input.trim().is_empty() {
            return SendOutcome::Ignored;
        }
        let text = self.state.user_input.clone();
        self.send_message(text).await
    }

    /// Sends `text` in the active conversation and streams the reply into it.
    ///
    /// Errors never escape: a failed send leaves the fixed failure text in the
    /// model message and clears loading.
    pub async fn send_message(&mut self, text: impl Into<String>) -> SendOutcome {
        let text = text.into();
        let Some(conversation) = self.state.active_conversation() else {
            tracing::debug!(
                active_conversation_id = ?self.state.active_conversation_id,
                "no active conversation, send ignored"
            );
            return SendOutcome::Ignored;
        };
        let conversation_id = conversation.id.clone();
        let seed = conversation.provider_history();

        Self::publish(
            &mut self.state,
            &self.snapshots,
            ChatAction::MessageSubmitted {
                conversation_id: conversation_id.clone(),
                text: text.clone(),
            },
        );

        let result = Self::stream_reply(
            &mut self.sessions,
            &mut self.state,
            &self.snapshots,
            &conversation_id,
            seed,
            text,
        )
        .await;

        let outcome = match result {
            Ok(()) => SendOutcome::Completed,
            Err(error) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to send message"
                );
                Self::publish(
                    &mut self.state,
                    &self.snapshots,
                    ChatAction::ReplyFailed {
                        conversation_id: conversation_id.clone(),
                    },
                );
                SendOutcome::Failed
            }
        };

        Self::publish(&mut self.state, &self.snapshots, ChatAction::LoadingFinished);
        outcome
    }

    async fn stream_reply(
        sessions: &mut SessionRegistry,
        state: &mut ChatState,
        snapshots: &watch::Sender<Arc<ChatState>>,
        conversation_id: &ConversationId,
        seed: Vec<ProviderMessage>,
        text: String,
    ) -> ProviderResult<()> {
        let session = sessions.get_or_create(conversation_id, seed).await?;
        let mut reply = session.send_message_stream(text)?;

        let mut fragments = 0usize;
        while let Some(fragment) = reply.next_fragment().await {
            let fragment = fragment?;
            fragments += 1;
            Self::publish(
                state,
                snapshots,
                ChatAction::FragmentReceived {
                    conversation_id: conversation_id.clone(),
                    fragment,
                },
            );
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            fragments,
            reply_len = reply.reply().len(),
            "reply complete"
        );
        Ok(())
    }

    fn publish(
        state: &mut ChatState,
        snapshots: &watch::Sender<Arc<ChatState>>,
        action: ChatAction,
    ) {
        match state.apply(action) {
            Ok(()) => {
                snapshots.send_replace(Arc::new(state.clone()));
            }
            Err(rejection) => {
                tracing::warn!(%rejection, "chat action rejected");
            }
        }
    }

    /// Time-based id, bumped past the previous one and any existing id.
    fn next_conversation_id(&mut self) -> ConversationId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let mut millis = now.max(self.last_issued_millis.saturating_add(1));
        while self
            .state
            .conversations
            .contains(&ConversationId::from_unix_millis(millis))
        {
            millis = millis.saturating_add(1);
        }
        self.last_issued_millis = millis;
        ConversationId::from_unix_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use confab_llm::{
        BoxFuture, ChatSession, MockProvider, MockScript, ProviderError, ProviderSessionFactory,
        StreamEvent,
    };
    use tokio::sync::oneshot;

    use super::*;
    use crate::message::{Conversation, Message, NEW_CONVERSATION_TITLE, Role, SEND_FAILED_TEXT};
    use crate::registry::tests::{CountingFactory, UnavailableFactory};

    fn manager_with(provider: MockProvider) -> (ConversationManager, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::new(Arc::new(provider)));
        (ConversationManager::new(factory.clone()), factory)
    }

    fn last_text(manager: &ConversationManager) -> &str {
        manager
            .state()
            .active_conversation()
            .and_then(Conversation::last_message)
            .map(|message| message.text.as_str())
            .unwrap_or_default()
    }

    /// Holds session creation until the test releases it.
    struct GatedFactory {
        inner: ProviderSessionFactory,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl SessionFactory for GatedFactory {
        fn create_session<'a>(
            &'a self,
            history: Vec<ProviderMessage>,
        ) -> BoxFuture<'a, ProviderResult<ChatSession>> {
            let gate = self.gate.lock().unwrap().take();
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                self.inner.create_session(history).await
            })
        }
    }

    /// Fails the first `failures` creations, then delegates.
    struct FlakyFactory {
        inner: CountingFactory,
        failures: AtomicUsize,
    }

    impl SessionFactory for FlakyFactory {
        fn create_session<'a>(
            &'a self,
            history: Vec<ProviderMessage>,
        ) -> BoxFuture<'a, ProviderResult<ChatSession>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Box::pin(async {
                    Err::<ChatSession, _>(ProviderError::ProviderUnavailable {
                        stage: "test-create-session",
                        provider_id: "mock".to_string(),
                        message: "warming up".to_string(),
                    })
                });
            }
            self.inner.create_session(history)
        }
    }

    #[test]
    fn new_conversation_is_active_and_empty() {
        let (mut manager, _) = manager_with(MockProvider::echo());
        manager.set_user_input("draft");

        let id = manager.start_new_conversation();

        let state = manager.state();
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.active_conversation_id.as_ref(), Some(&id));
        let conversation = state.conversation(&id).unwrap();
        assert_eq!(conversation.title, NEW_CONVERSATION_TITLE);
        assert!(conversation.messages.is_empty());
        assert!(state.user_input.is_empty());
        assert!(id.as_str().starts_with("conv-"));
    }

    #[test]
    fn ids_stay_unique_within_one_millisecond() {
        let (mut manager, _) = manager_with(MockProvider::echo());
        let first = manager.start_new_conversation();
        let second = manager.start_new_conversation();
        let third = manager.start_new_conversation();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(manager.state().conversations.len(), 3);
        assert_eq!(manager.state().active_conversation_id, Some(third));
    }

    #[test]
    fn ensure_conversation_only_creates_when_empty() {
        let (mut manager, _) = manager_with(MockProvider::echo());
        let created = manager.ensure_conversation();
        assert!(created.is_some());
        assert!(manager.ensure_conversation().is_none());
        assert_eq!(manager.state().conversations.len(), 1);
    }

    #[tokio::test]
    async fn first_message_sets_title() {
        let (mut manager, _) = manager_with(MockProvider::fragments(["Hi"]));
        manager.start_new_conversation();

        manager.send_message("Hello").await;

        let conversation = manager.state().active_conversation().unwrap();
        assert_eq!(conversation.title, "Hello");
        assert_eq!(conversation.messages.len(), 2);
    }

    #[tokio::test]
    async fn long_first_message_title_is_truncated() {
        let (mut manager, _) = manager_with(MockProvider::fragments(["ok"]));
        manager.start_new_conversation();
        let text = "Explain the borrow checker like I am five years old";

        manager.send_message(text).await;

        let title = &manager.state().active_conversation().unwrap().title;
        assert_eq!(title, &format!("{}...", &text[..40]));
    }

    #[tokio::test]
    async fn pair_is_appended_before_any_fragment() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let factory = Arc::new(GatedFactory {
            inner: ProviderSessionFactory::with_default_model(Arc::new(
                MockProvider::fragments(["Hi"]),
            )),
            gate: Mutex::new(Some(gate_rx)),
        });
        let mut manager = ConversationManager::new(factory);
        manager.start_new_conversation();
        manager.set_user_input("Hello");
        let mut snapshots = manager.subscribe();

        let observe = async {
            snapshots.changed().await.unwrap();
            let snapshot = snapshots.borrow_and_update().clone();
            gate_tx.send(()).unwrap();
            snapshot
        };
        let (outcome, submitted) = tokio::join!(manager.send_message("Hello"), observe);

        assert_eq!(outcome, SendOutcome::Completed);
        let conversation = submitted.active_conversation().unwrap();
        assert_eq!(
            conversation.messages,
            vec![Message::user("Hello"), Message::model_placeholder()]
        );
        assert!(submitted.is_loading);
        assert!(submitted.user_input.is_empty());
        assert!(submitted.shows_loading_indicator());
    }

    #[tokio::test]
    async fn fragments_are_concatenated() {
        let (mut manager, _) = manager_with(MockProvider::fragments(["Hi", " there"]));
        manager.start_new_conversation();

        let outcome = manager.send_message("Hello").await;

        assert_eq!(outcome, SendOutcome::Completed);
        let last = manager
            .state()
            .active_conversation()
            .and_then(Conversation::last_message)
            .unwrap();
        assert_eq!(last.role, Role::Model);
        assert_eq!(last.text, "Hi there");
        assert!(!manager.state().is_loading);
    }

    #[tokio::test]
    async fn stream_open_failure_shows_fixed_text() {
        let (mut manager, _) = manager_with(MockProvider::new(MockScript::FailOnOpen(
            "quota exceeded".to_string(),
        )));
        manager.start_new_conversation();

        let outcome = manager.send_message("Hello").await;

        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(last_text(&manager), SEND_FAILED_TEXT);
        assert!(!manager.state().is_loading);
    }

    #[tokio::test]
    async fn mid_stream_failure_replaces_partial_reply() {
        let (mut manager, _) = manager_with(MockProvider::new(MockScript::FailMidStream {
            fragments: vec!["Half".to_string()],
            message: "connection reset".to_string(),
        }));
        manager.start_new_conversation();

        let outcome = manager.send_message("Hello").await;

        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(last_text(&manager), SEND_FAILED_TEXT);
        assert!(!manager.state().is_loading);
    }

    #[tokio::test]
    async fn stream_closed_early_shows_fixed_text() {
        let (mut manager, _) = manager_with(MockProvider::new(MockScript::Events(vec![
            StreamEvent::Delta("Hi".to_string()),
        ])));
        manager.start_new_conversation();

        let outcome = manager.send_message("Hello").await;

        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(last_text(&manager), SEND_FAILED_TEXT);
        assert!(!manager.state().is_loading);
    }

    #[tokio::test]
    async fn reasoning_is_left_out_of_the_reply() {
        let (mut manager, _) = manager_with(MockProvider::new(MockScript::Events(vec![
            StreamEvent::ReasoningDelta("planning".to_string()),
            StreamEvent::Delta(String::new()),
            StreamEvent::Delta("Hi".to_string()),
            StreamEvent::Done,
        ])));
        manager.start_new_conversation();

        assert_eq!(manager.send_message("Hello").await, SendOutcome::Completed);
        assert_eq!(last_text(&manager), "Hi");
    }

    #[tokio::test]
    async fn session_creation_failure_shows_fixed_text() {
        let mut manager = ConversationManager::new(Arc::new(UnavailableFactory));
        manager.start_new_conversation();

        let outcome = manager.send_message("Hello").await;

        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(last_text(&manager), SEND_FAILED_TEXT);
        assert!(!manager.state().is_loading);
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn send_without_active_conversation_is_ignored() {
        let (mut manager, factory) = manager_with(MockProvider::echo());

        assert_eq!(manager.send_message("Hello").await, SendOutcome::Ignored);

        manager.start_new_conversation();
        manager.select_conversation(ConversationId::new("conv-missing"));
        let before = manager.state().clone();
        assert_eq!(manager.send_message("Hello").await, SendOutcome::Ignored);

        assert_eq!(manager.state(), &before);
        assert!(manager.state().active_conversation().is_none());
        assert_eq!(factory.calls(), 0);
    }

    #[tokio::test]
    async fn session_is_reused_within_a_conversation() {
        let (mut manager, factory) = manager_with(MockProvider::fragments(["ok"]));
        let id = manager.start_new_conversation();

        manager.send_message("one").await;
        manager.send_message("two").await;

        assert_eq!(factory.calls(), 1);
        assert_eq!(manager.state().conversation(&id).unwrap().messages.len(), 4);
        assert_eq!(manager.sessions().session(&id).unwrap().history().len(), 4);
    }

    #[tokio::test]
    async fn seed_history_excludes_the_new_pair() {
        let factory = Arc::new(FlakyFactory {
            inner: CountingFactory::new(Arc::new(MockProvider::fragments(["ok"]))),
            failures: AtomicUsize::new(1),
        });
        let mut manager = ConversationManager::new(factory.clone());
        let first = manager.start_new_conversation();

        assert_eq!(manager.send_message("one").await, SendOutcome::Failed);
        assert!(manager.sessions().is_empty());
        assert_eq!(manager.send_message("two").await, SendOutcome::Completed);

        assert_eq!(
            factory.inner.seeds(),
            vec![vec![
                ProviderMessage::user("one"),
                ProviderMessage::assistant(SEND_FAILED_TEXT),
            ]]
        );

        let second = manager.start_new_conversation();
        manager.send_message("elsewhere").await;
        assert_eq!(factory.inner.calls(), 2);
        assert_eq!(factory.inner.seeds()[1], Vec::new());
        assert!(manager.sessions().contains(&first));
        assert!(manager.sessions().contains(&second));
        assert_eq!(manager.state().conversation(&first).unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn submit_input_guards_blank_input() {
        let (mut manager, factory) = manager_with(MockProvider::echo());
        manager.start_new_conversation();

        manager.set_user_input("   ");
        assert_eq!(manager.submit_input().await, SendOutcome::Ignored);
        assert_eq!(manager.state().user_input, "   ");

        manager.set_user_input("Where is my order?");
        assert_eq!(manager.submit_input().await, SendOutcome::Completed);
        assert!(manager.state().user_input.is_empty());
        assert_eq!(factory.calls(), 1);

        let reply = last_text(&manager);
        assert!(reply.contains("Order ID"), "unexpected reply: {reply}");
    }

    #[tokio::test]
    async fn subscribers_see_the_final_snapshot() {
        let (mut manager, _) = manager_with(MockProvider::fragments(["Hi", " there"]));
        let snapshots = manager.subscribe();
        manager.start_new_conversation();

        manager.send_message("Hello").await;

        let latest = snapshots.borrow().clone();
        assert_eq!(latest.as_ref(), manager.state());
        assert!(!latest.is_loading);
    }
}

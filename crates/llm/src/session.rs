use std::sync::Arc;

use snafu::ensure;
use tokio::task::JoinHandle;

use super::provider::{
    BoxFuture, InvalidHistorySnafu, InvalidModelSnafu, LlmProvider, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, Role, StreamEvent, StreamRequest,
};

/// One remote chat session: a model plus the turns it has seen so far.
///
/// History only grows when a reply stream completes, so a failed turn is never
/// replayed to the provider as context.
pub struct ChatSession {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    history: Vec<ProviderMessage>,
    preamble: Option<String>,
}

impl ChatSession {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model_id: impl Into<String>,
        history: Vec<ProviderMessage>,
    ) -> ProviderResult<Self> {
        let model_id = model_id.into().trim().to_string();
        ensure!(
            !model_id.is_empty(),
            InvalidModelSnafu {
                stage: "chat-session-new",
            }
        );

        if let Some((index, message)) = history
            .iter()
            .enumerate()
            .find(|(_, message)| matches!(message.role, Role::System))
        {
            return InvalidHistorySnafu {
                stage: "chat-session-new",
                index,
                role: message.role.as_str(),
            }
            .fail();
        }

        Ok(Self {
            provider,
            model_id,
            history,
            preamble: None,
        })
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn history(&self) -> &[ProviderMessage] {
        &self.history
    }

    /// Sends `message` with the session history and starts streaming the reply.
    pub fn send_message_stream(
        &mut self,
        message: impl Into<String>,
    ) -> ProviderResult<ChatReplyStream<'_>> {
        let prompt = message.into();
        let mut messages = self.history.clone();
        messages.push(ProviderMessage::user(prompt.clone()));

        let mut request = StreamRequest::new(self.model_id.clone(), messages);
        if let Some(preamble) = &self.preamble {
            request = request.with_preamble(preamble.clone());
        }

        let handle = self.provider.stream_chat(request)?;
        let worker = tokio::spawn(handle.worker);

        tracing::debug!(
            provider_id = %self.provider.id(),
            model_id = %self.model_id,
            history_len = self.history.len(),
            "opened reply stream"
        );

        Ok(ChatReplyStream {
            session: self,
            prompt,
            reply: String::new(),
            events: handle.stream,
            _worker: worker,
            finished: false,
        })
    }

    fn record_turn(&mut self, prompt: String, reply: String) {
        self.history.push(ProviderMessage::user(prompt));
        self.history.push(ProviderMessage::assistant(reply));
    }
}

/// Reply fragments for one `send_message_stream` call, in arrival order.
pub struct ChatReplyStream<'a> {
    session: &'a mut ChatSession,
    prompt: String,
    reply: String,
    events: ProviderEventStream,
    _worker: JoinHandle<()>,
    finished: bool,
}

impl ChatReplyStream<'_> {
    /// Waits for the next text fragment.
    ///
    /// Returns `None` once the provider reports completion. Errors are terminal:
    /// after an `Err` every later call returns `None`.
    pub async fn next_fragment(&mut self) -> Option<ProviderResult<String>> {
        if self.finished {
            return None;
        }

        loop {
            match self.events.recv().await {
                Some(StreamEvent::Delta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.reply.push_str(&text);
                    return Some(Ok(text));
                }
                Some(StreamEvent::ReasoningDelta(text)) => {
                    tracing::trace!(len = text.len(), "skipping reasoning fragment");
                }
                Some(StreamEvent::Done) => {
                    self.finished = true;
                    let prompt = std::mem::take(&mut self.prompt);
                    let reply = std::mem::take(&mut self.reply);
                    self.session.record_turn(prompt, reply);
                    return None;
                }
                Some(StreamEvent::Error(message)) => {
                    self.finished = true;
                    return Some(Err(ProviderError::StreamFailed {
                        stage: "reply-stream-event",
                        message,
                    }));
                }
                None => {
                    self.finished = true;
                    return Some(Err(ProviderError::StreamClosed {
                        stage: "reply-stream-closed",
                    }));
                }
            }
        }
    }

    /// Text received so far.
    pub fn reply(&self) -> &str {
        &self.reply
    }
}

/// Creates remote chat sessions seeded with prior turns.
pub trait SessionFactory: Send + Sync {
    fn create_session<'a>(
        &'a self,
        history: Vec<ProviderMessage>,
    ) -> BoxFuture<'a, ProviderResult<ChatSession>>;
}

/// Opens sessions against one provider and model.
pub struct ProviderSessionFactory {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    preamble: Option<String>,
}

impl ProviderSessionFactory {
    pub fn new(provider: Arc<dyn LlmProvider>, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            preamble: None,
        }
    }

    /// Uses the provider's own default model.
    pub fn with_default_model(provider: Arc<dyn LlmProvider>) -> Self {
        let model_id = provider.default_model().to_string();
        Self::new(provider, model_id)
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl SessionFactory for ProviderSessionFactory {
    fn create_session<'a>(
        &'a self,
        history: Vec<ProviderMessage>,
    ) -> BoxFuture<'a, ProviderResult<ChatSession>> {
        Box::pin(async move {
            let session = ChatSession::new(self.provider.clone(), self.model_id.clone(), history)?;
            tracing::debug!(
                provider_id = %self.provider.id(),
                model_id = %self.model_id,
                seed_len = session.history().len(),
                "created chat session"
            );
            Ok(match &self.preamble {
                Some(preamble) => session.with_preamble(preamble.clone()),
                None => session,
            })
        })
    }
}

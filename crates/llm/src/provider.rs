use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Speaker role as understood by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            preamble: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    /// Text of the trailing user turn, which providers treat as the prompt.
    pub fn prompt(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|message| matches!(message.role, Role::User))
            .map(|message| message.content.as_str())
    }
}

/// Provider stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    ReasoningDelta(String),
    Done,
    Error(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("model id must not be empty"))]
    InvalidModel { stage: &'static str },
    #[snafu(display("session history entry {index} has unsupported role '{role}'"))]
    InvalidHistory {
        stage: &'static str,
        index: usize,
        role: &'static str,
    },
    #[snafu(display("stream request has no messages"))]
    EmptyMessageSet { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider '{provider_id}' is unavailable: {message}"))]
    ProviderUnavailable {
        stage: &'static str,
        provider_id: String,
        message: String,
    },
    #[snafu(display("reply stream failed: {message}"))]
    StreamFailed {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider stream ended before a terminal event"))]
    StreamClosed { stage: &'static str },
}

pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

pub(crate) fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_is_the_trailing_user_turn() {
        let request = StreamRequest::new(
            DEFAULT_OPENAI_MODEL,
            vec![
                ProviderMessage::user("first"),
                ProviderMessage::assistant("reply"),
                ProviderMessage::user("second"),
            ],
        );
        assert_eq!(request.prompt(), Some("second"));

        let trailing_assistant = StreamRequest::new(
            DEFAULT_OPENAI_MODEL,
            vec![ProviderMessage::assistant("reply")],
        );
        assert_eq!(trailing_assistant.prompt(), None);
    }

    #[test]
    fn config_trims_whitespace() {
        let config = ProviderConfig::new(" openai ", " key\n", " https://example.test ");
        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.api_key, "key");
        assert_eq!(config.endpoint, "https://example.test");
    }

    #[tokio::test]
    async fn dropping_event_stream_signals_cancel() {
        let (_event_tx, stream, mut cancel_rx) = make_event_stream();
        drop(stream);
        assert!(cancel_rx.try_recv().is_ok());
    }
}

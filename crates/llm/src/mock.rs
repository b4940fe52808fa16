use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use super::provider::{
    LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEvent,
    StreamRequest, make_event_stream,
};

pub const MOCK_PROVIDER_ID: &str = "mock";
pub const MOCK_MODEL: &str = "mock-echo";

const ORDER_HELP_REPLY: &str = "I can help with that. Please provide your Order ID or the email address associated with the purchase.";

/// What a [`MockProvider`] does with each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockScript {
    /// Canned reply derived from the prompt, streamed word by word.
    Echo,
    /// Streams exactly these fragments, then completes.
    Fragments(Vec<String>),
    /// Sends exactly these events, then closes the channel.
    Events(Vec<StreamEvent>),
    /// Refuses to open the stream.
    FailOnOpen(String),
    /// Streams the fragments, then reports an error.
    FailMidStream {
        fragments: Vec<String>,
        message: String,
    },
}

/// Offline provider with a deterministic reply script.
pub struct MockProvider {
    script: MockScript,
    requests: Mutex<Vec<StreamRequest>>,
}

impl MockProvider {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(MockScript::Echo)
    }

    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MockScript::Fragments(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: &StreamRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
    }

    fn events_for(&self, request: &StreamRequest) -> Vec<StreamEvent> {
        match &self.script {
            MockScript::Echo => {
                let reply = echo_reply(request.prompt().unwrap_or_default());
                let mut events = split_words(&reply)
                    .into_iter()
                    .map(StreamEvent::Delta)
                    .collect::<Vec<_>>();
                events.push(StreamEvent::Done);
                events
            }
            MockScript::Fragments(fragments) => fragments
                .iter()
                .cloned()
                .map(StreamEvent::Delta)
                .chain(std::iter::once(StreamEvent::Done))
                .collect(),
            MockScript::FailMidStream { fragments, message } => fragments
                .iter()
                .cloned()
                .map(StreamEvent::Delta)
                .chain(std::iter::once(StreamEvent::Error(message.clone())))
                .collect(),
            MockScript::Events(events) => events.clone(),
            MockScript::FailOnOpen(_) => Vec::new(),
        }
    }

    async fn run_stream_worker(
        events: Vec<StreamEvent>,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for event in events {
            if cancel_rx.try_recv().is_ok() {
                tracing::debug!("mock stream cancelled");
                return;
            }
            if event_tx.send(event).is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl LlmProvider for MockProvider {
    fn id(&self) -> &str {
        MOCK_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Mock"
    }

    fn default_model(&self) -> &str {
        MOCK_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        self.record(&request);

        if let MockScript::FailOnOpen(message) = &self.script {
            return Err(ProviderError::ProviderUnavailable {
                stage: "mock-stream-chat",
                provider_id: MOCK_PROVIDER_ID.to_string(),
                message: message.clone(),
            });
        }

        let events = self.events_for(&request);
        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(events, event_tx, cancel_rx));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

fn echo_reply(prompt: &str) -> String {
    if prompt.to_lowercase().contains("order") {
        return ORDER_HELP_REPLY.to_string();
    }
    format!("This is a mock AI response to: {prompt}")
}

/// Splits text into word fragments that concatenate back to the original.
fn split_words(text: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();

    for character in text.chars() {
        if character.is_whitespace() && !current.trim().is_empty() {
            fragments.push(std::mem::take(&mut current));
        }
        current.push(character);
    }

    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

use std::sync::Arc;

mod mock;
mod provider;
mod rig_adapter;
mod session;

pub use mock::{MOCK_MODEL, MOCK_PROVIDER_ID, MockProvider, MockScript};
pub use provider::{
    BoxFuture, DEFAULT_OPENAI_MODEL, LlmProvider, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEvent, StreamRequest,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use session::{ChatReplyStream, ChatSession, ProviderSessionFactory, SessionFactory};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        MOCK_PROVIDER_ID => Ok(Arc::new(MockProvider::echo())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_providers_by_id() {
        let openai = create_provider(ProviderConfig::new("rig-openai", "sk-test", "")).unwrap();
        assert_eq!(openai.id(), RIG_OPENAI_PROVIDER_ID);

        let defaulted = create_provider(ProviderConfig::new("", "sk-test", "")).unwrap();
        assert_eq!(defaulted.id(), RIG_OPENAI_PROVIDER_ID);

        let mock = create_provider(ProviderConfig::new("mock", "", "")).unwrap();
        assert_eq!(mock.default_model(), MOCK_MODEL);
    }

    #[test]
    fn rejects_unknown_provider() {
        let result = create_provider(ProviderConfig::new("carrier-pigeon", "key", ""));
        assert!(matches!(
            result,
            Err(ProviderError::UnsupportedProvider { provider_id, .. }) if provider_id == "carrier-pigeon"
        ));
    }
}

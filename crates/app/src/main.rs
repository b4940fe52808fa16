use std::sync::Arc;

use confab_chat::ConversationManager;
use confab_llm::{ProviderError, ProviderSessionFactory};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use crate::repl::{Repl, ReplError};
use crate::settings::SettingsStore;

mod repl;
mod settings;

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to set up the model provider on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("chat loop stopped on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: ReplError,
    },
}

/// Terminal chat client.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`), so they never
/// interleave with streamed replies on stdout.
#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    let provider = settings.build_provider().context(ProviderSnafu {
        stage: "build-provider",
    })?;
    let model_id = settings.model_for(provider.as_ref());
    tracing::info!(
        provider_id = %provider.id(),
        provider_name = %provider.name(),
        model_id = %model_id,
        "starting chat client"
    );

    let mut factory = ProviderSessionFactory::new(provider, model_id);
    if let Some(preamble) = &settings.preamble {
        factory = factory.with_preamble(preamble.clone());
    }
    let manager = ConversationManager::new(Arc::new(factory));

    Repl::new(manager, settings_store)
        .run()
        .await
        .context(TerminalSnafu {
            stage: "run-chat-loop",
        })
}

mod repl;
mod settings;

use std::sync::Arc;

use quill_conversation::{ConversationRepository, StreamCoordinator};
use quill_llm::{LlmProvider, create_provider};
use quill_storage::{SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use repl::{Console, Repl, ReplError};
use settings::SettingsStore;

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open conversation store at {path} on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        path: String,
        source: StorageError,
    },
    #[snafu(display("terminal session ended with an error on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: ReplError,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(error) = run().await {
        eprintln!("quill: {error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QUILL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), AppError> {
    let settings = Arc::new(SettingsStore::load());
    let current = settings.settings();

    let database_path = current.storage.database_path.clone();
    let store = SqliteStorage::open(&database_path)
        .await
        .context(OpenStoreSnafu {
            stage: "open-store",
            path: database_path.clone(),
        })?;

    let provider = provider_from_settings(&settings);
    let repository = ConversationRepository::new(Arc::new(store.clone()));
    let coordinator =
        StreamCoordinator::new(repository, provider, current.coordinator_config());

    let mut repl = Repl::new(coordinator, settings, Console::stdout());
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let outcome = repl.run(input).await.context(TerminalSnafu {
        stage: "run-terminal",
    });

    store.close().await;
    outcome
}

fn provider_from_settings(settings: &SettingsStore) -> Option<Arc<dyn LlmProvider>> {
    let current = settings.settings();
    let Some(config) = current.provider.to_provider_config() else {
        tracing::warn!(
            path = ?settings.config_path(),
            "no api key configured; replies are disabled until provider.api_key is set"
        );
        return None;
    };

    match create_provider(config) {
        Ok(provider) => {
            tracing::info!(provider = provider.id(), model = provider.default_model(), "provider ready");
            Some(provider)
        }
        Err(error) => {
            tracing::warn!(error = %error, "failed to create provider; replies are disabled");
            None
        }
    }
}

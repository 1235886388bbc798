use std::sync::Arc;

mod provider;
mod rig_adapter;

pub use provider::{
    BoxFuture, FailureKind, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamFailure, StreamRequest, StreamSessionId, StreamTarget,
    make_event_stream,
};
pub use rig_adapter::{
    DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter,
};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" | "deepseek" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

/// A fully drained, non-streaming reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub reply: String,
    pub thought: String,
}

/// Runs one request to completion and concatenates its deltas.
///
/// The worker runs on its own task; a failure event ends the call with that
/// failure instead of a partial reply.
pub async fn complete(
    provider: &dyn LlmProvider,
    request: StreamRequest,
) -> Result<Completion, StreamFailure> {
    let ProviderStreamHandle { mut stream, worker } = provider
        .stream_chat(request)
        .map_err(|error| StreamFailure::from(&error))?;
    let worker = tokio::spawn(worker);

    let mut completion = Completion::default();
    let outcome = loop {
        match stream.recv().await {
            Some(event) => match event.payload {
                StreamEventPayload::Delta(text) => completion.reply.push_str(&text),
                StreamEventPayload::ReasoningDelta(text) => completion.thought.push_str(&text),
                StreamEventPayload::Done => break Ok(completion),
                StreamEventPayload::Error(failure) => break Err(failure),
            },
            None => {
                break Err(StreamFailure::transport(
                    "provider stream closed without completing",
                ));
            }
        }
    };

    drop(stream);
    let _ = worker.await;
    outcome
}

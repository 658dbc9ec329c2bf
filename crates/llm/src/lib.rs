use std::sync::Arc;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamEventPayload,
    StreamRequest, StreamTarget,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn request(target: StreamTarget) -> StreamRequest {
        StreamRequest::new(
            target,
            "scripted-v1",
            vec![ProviderMessage::new(Role::User, "hello")],
        )
    }

    async fn drain(mut stream: ProviderEventStream) -> Vec<StreamEventPayload> {
        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test]
    async fn scripted_provider_streams_chunks_then_done() {
        let provider = ScriptedProvider::completing(["Hi", " there"]);
        let target = StreamTarget::new(0, 1);
        let handle = provider.stream_chat(request(target)).unwrap();
        tokio::spawn(handle.worker);

        let payloads = drain(handle.stream).await;
        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("Hi".to_string()),
                StreamEventPayload::Delta(" there".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test]
    async fn scripted_provider_surfaces_failure_after_partial_output() {
        let provider = ScriptedProvider::failing_after(["partial"], "boom");
        let handle = provider.stream_chat(request(StreamTarget::new(0, 1))).unwrap();
        tokio::spawn(handle.worker);

        let payloads = drain(handle.stream).await;
        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("partial".to_string()),
                StreamEventPayload::Error("boom".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn disconnect_closes_stream_without_terminal_event() {
        let provider = ScriptedProvider::disconnecting_after(["half"]);
        let handle = provider.stream_chat(request(StreamTarget::new(0, 1))).unwrap();
        tokio::spawn(handle.worker);

        let payloads = drain(handle.stream).await;
        assert_eq!(payloads, vec![StreamEventPayload::Delta("half".to_string())]);
    }

    #[tokio::test]
    async fn cancel_stops_hanging_script_without_done() {
        let provider = ScriptedProvider::hanging();
        let handle = provider.stream_chat(request(StreamTarget::new(2, 5))).unwrap();
        let worker = tokio::spawn(handle.worker);

        let mut stream = handle.stream;
        assert!(stream.cancel());
        assert!(!stream.cancel());

        worker.await.unwrap();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_worker() {
        let provider = ScriptedProvider::new(vec![
            ScriptStep::Wait(Duration::from_secs(3600)),
            ScriptStep::Chunk("never".to_string()),
        ]);
        let handle = provider.stream_chat(request(StreamTarget::new(0, 1))).unwrap();
        let worker = tokio::spawn(handle.worker);

        drop(handle.stream);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn stream_events_carry_the_requested_target() {
        let provider = ScriptedProvider::completing(["x"]);
        let target = StreamTarget::new(3, 7);
        let mut handle = provider.stream_chat(request(target)).unwrap();
        tokio::spawn(handle.worker);

        assert_eq!(handle.stream.target(), target);
        let event = handle.stream.recv().await.unwrap();
        assert_eq!(event.target, target);
    }

    #[test]
    fn stream_request_builders_set_optional_fields() {
        let request = request(StreamTarget::new(0, 0))
            .with_preamble("be brief")
            .with_temperature(0.2)
            .with_max_tokens(256);

        assert_eq!(request.preamble.as_deref(), Some("be brief"));
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(256));
    }

    #[test]
    fn create_provider_rejects_unknown_provider_id() {
        let config = ProviderConfig::new("acme", "key", "", None);
        assert!(matches!(
            create_provider(config),
            Err(ProviderError::UnsupportedProvider { provider_id, .. }) if provider_id == "acme"
        ));
    }

    #[test]
    fn create_provider_requires_api_key_for_openai() {
        let config = ProviderConfig::new("openai", "   ", "", None);
        assert!(matches!(
            create_provider(config),
            Err(ProviderError::MissingApiKey { .. })
        ));
    }
}

//! Service adapter abstraction.
//!
//! A [`ServiceAdapter`] produces a turn's output directly (a completion
//! backend) by attaching itself as the producer of the turn's
//! [`RuntimeEventSource`]. [`EmptyAdapter`] stands in when only remote
//! agents are meant to answer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use switchyard_core::config::{AdapterConfig, AdapterKind};
use switchyard_core::error::Result;
use switchyard_core::event_source::RuntimeEventSource;
use switchyard_core::types::{
    ActionDescriptor, AgentSession, AgentStateInput, ForwardedParameters, Message, new_id,
};

pub mod openai;
pub mod sse;

/// Everything an adapter needs to answer one turn.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub messages: Vec<Message>,
    /// De-duplicated actions the completion may call.
    pub actions: Vec<ActionDescriptor>,
    pub thread_id: Option<String>,
    pub run_id: Option<String>,
    pub event_source: RuntimeEventSource,
    pub forwarded_parameters: Option<ForwardedParameters>,
    pub extensions: Option<serde_json::Value>,
    pub agent_session: Option<AgentSession>,
    pub agent_states: Vec<AgentStateInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

/// A completion backend.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Adapter identifier (e.g., "openai", "empty").
    fn id(&self) -> &str;

    /// Whether this adapter can answer a turn itself.
    ///
    /// Adapters returning false can only serve agent-locked sessions.
    fn accepts_direct_requests(&self) -> bool {
        true
    }

    /// Start answering the turn.
    ///
    /// Must attach exactly one producer to `request.event_source` on success.
    /// Returning an error before attaching leaves the source free for an
    /// error message.
    async fn process(&self, request: AdapterRequest) -> Result<AdapterResponse>;
}

/// Adapter with no completion backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyAdapter;

#[async_trait]
impl ServiceAdapter for EmptyAdapter {
    fn id(&self) -> &str {
        "empty"
    }

    fn accepts_direct_requests(&self) -> bool {
        false
    }

    async fn process(&self, request: AdapterRequest) -> Result<AdapterResponse> {
        // Nothing to say; end the turn without events.
        request.event_source.sink()?.complete();
        Ok(AdapterResponse {
            thread_id: request.thread_id.unwrap_or_else(new_id),
            run_id: request.run_id,
            extensions: None,
        })
    }
}

/// Build the adapter described by `config`.
pub fn adapter_from_config(config: &AdapterConfig) -> Arc<dyn ServiceAdapter> {
    let base_url = config.base_url.as_deref();
    let adapter = match config.kind {
        AdapterKind::Empty => return Arc::new(EmptyAdapter),
        AdapterKind::Openai => openai::OpenAiAdapter::openai(base_url),
        AdapterKind::Openrouter => openai::OpenAiAdapter::openrouter(base_url),
        AdapterKind::Ollama => openai::OpenAiAdapter::ollama(base_url),
    };
    let adapter = adapter.with_api_key(config.resolve_api_key());
    match &config.model {
        Some(model) => Arc::new(adapter.with_model(model)),
        None => Arc::new(adapter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &RuntimeEventSource) -> AdapterRequest {
        AdapterRequest {
            messages: vec![Message::user("hi")],
            actions: Vec::new(),
            thread_id: Some("t-1".into()),
            run_id: None,
            event_source: source.clone(),
            forwarded_parameters: None,
            extensions: None,
            agent_session: None,
            agent_states: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_adapter_completes_without_events() {
        let source = RuntimeEventSource::new();
        let response = EmptyAdapter.process(request(&source)).await.unwrap();
        assert_eq!(response.thread_id, "t-1");
        assert!(source.events().is_empty());
        assert!(source.output_messages().await.unwrap().is_empty());
        assert!(!EmptyAdapter.accepts_direct_requests());
    }

    #[test]
    fn test_adapter_from_config() {
        let empty = adapter_from_config(&AdapterConfig {
            kind: AdapterKind::Empty,
            ..AdapterConfig::default()
        });
        assert_eq!(empty.id(), "empty");

        let ollama = adapter_from_config(&AdapterConfig {
            kind: AdapterKind::Ollama,
            model: Some("llama3".into()),
            ..AdapterConfig::default()
        });
        assert_eq!(ollama.id(), "ollama");
        assert!(ollama.accepts_direct_requests());
    }
}

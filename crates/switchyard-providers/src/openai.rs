//! OpenAI Chat Completions adapter.
//!
//! Streams completions via `/v1/chat/completions` and translates the chunks
//! into runtime events. Also serves OpenRouter, Ollama, and other
//! OpenAI-compatible backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::event_source::EventSink;
use switchyard_core::events::RuntimeEvent;
use switchyard_core::types::{ActionDescriptor, Message, new_id};

use crate::sse::parse_sse_stream;
use crate::{AdapterRequest, AdapterResponse, ServiceAdapter};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_MODEL: &str = "gpt-4o";

/// Which OpenAI-compatible flavor the adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiAdapter {
    pub base_url: String,
    pub api_style: ApiStyle,
    pub model: String,
    api_key: Option<String>,
    adapter_id: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    fn with_style(base_url: &str, api_style: ApiStyle, adapter_id: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_style,
            model: DEFAULT_MODEL.into(),
            api_key: None,
            adapter_id: adapter_id.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>) -> Self {
        Self::with_style(base_url.unwrap_or(OPENAI_BASE_URL), ApiStyle::OpenAi, "openai")
    }

    pub fn openrouter(base_url: Option<&str>) -> Self {
        Self::with_style(
            base_url.unwrap_or(OPENROUTER_BASE_URL),
            ApiStyle::OpenRouter,
            "openrouter",
        )
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::with_style(base_url.unwrap_or(OLLAMA_BASE_URL), ApiStyle::Ollama, "ollama")
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn build_request(&self, request: &AdapterRequest) -> OpenAiRequest {
        let params = request.forwarded_parameters.clone().unwrap_or_default();
        let tools = format_tools(&request.actions);
        let tool_choice = if tools.is_empty() {
            None
        } else {
            params.tool_choice.as_deref().map(format_tool_choice)
        };

        OpenAiRequest {
            model: params.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: format_messages(&request.messages),
            stream: true,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stop: (!params.stop.is_empty()).then(|| params.stop.clone()),
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice,
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn format_tools(actions: &[ActionDescriptor]) -> Vec<serde_json::Value> {
    actions
        .iter()
        .map(|a| {
            json!({
                "type": "function",
                "function": {
                    "name": a.name,
                    "description": a.description,
                    "parameters": a.parameters,
                }
            })
        })
        .collect()
}

/// `auto`, `none` and `required` pass through; anything else names a function.
fn format_tool_choice(choice: &str) -> serde_json::Value {
    match choice {
        "auto" | "none" | "required" => json!(choice),
        name => json!({ "type": "function", "function": { "name": name } }),
    }
}

fn format_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|message| match message {
            Message::System { content, .. } => json!({ "role": "system", "content": content }),
            Message::User { content, .. } => json!({ "role": "user", "content": content }),
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut msg = json!({ "role": "assistant", "content": content });
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": { "name": tc.name, "arguments": tc.arguments },
                            })
                        })
                        .collect();
                }
                msg
            }
            Message::Tool {
                tool_call_id,
                content,
                ..
            } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
        })
        .collect()
}

/// What the translator is currently inside of.
#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Idle,
    Text,
    Action(String),
}

/// Turns completion chunks into runtime events.
///
/// Text deltas share one message id per completion; each tool call opens an
/// action execution parented to that message, closing whatever was open.
struct ChunkTranslator {
    message_id: String,
    mode: Mode,
    text_started: bool,
}

impl ChunkTranslator {
    fn new() -> Self {
        Self {
            message_id: new_id(),
            mode: Mode::Idle,
            text_started: false,
        }
    }

    fn translate(&mut self, chunk: &ChatCompletionChunk) -> Vec<RuntimeEvent> {
        let mut events = Vec::new();
        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                let name = tc.function.as_ref().and_then(|f| f.name.clone());
                if let (Some(id), Some(name)) = (&tc.id, name) {
                    self.close(&mut events);
                    events.push(RuntimeEvent::ActionExecutionStart {
                        action_execution_id: id.clone(),
                        action_name: name,
                        parent_message_id: Some(self.message_id.clone()),
                    });
                    self.mode = Mode::Action(id.clone());
                }
                let args = tc.function.as_ref().and_then(|f| f.arguments.as_deref());
                if let (Mode::Action(id), Some(args)) = (&self.mode, args) {
                    if !args.is_empty() {
                        events.push(RuntimeEvent::ActionExecutionArgs {
                            action_execution_id: id.clone(),
                            args: args.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) {
            if self.mode != Mode::Text {
                self.close(&mut events);
                if !self.text_started {
                    events.push(RuntimeEvent::TextMessageStart {
                        message_id: self.message_id.clone(),
                        parent_message_id: None,
                    });
                    self.text_started = true;
                }
                self.mode = Mode::Text;
            }
            events.push(RuntimeEvent::TextMessageContent {
                message_id: self.message_id.clone(),
                content: content.to_string(),
            });
        }

        events
    }

    /// Events closing whatever is still open.
    fn finish(&mut self) -> Vec<RuntimeEvent> {
        let mut events = Vec::new();
        self.close(&mut events);
        if self.text_started {
            events.push(RuntimeEvent::TextMessageEnd {
                message_id: self.message_id.clone(),
            });
            self.text_started = false;
        }
        events
    }

    fn close(&mut self, events: &mut Vec<RuntimeEvent>) {
        if let Mode::Action(id) = std::mem::replace(&mut self.mode, Mode::Idle) {
            events.push(RuntimeEvent::ActionExecutionEnd {
                action_execution_id: id,
            });
        }
    }
}

async fn pump(response: reqwest::Response, sink: EventSink) {
    let mut sse = Box::pin(parse_sse_stream(response));
    let mut translator = ChunkTranslator::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = sink.cancelled() => {
                debug!("Completion stream cancelled by consumer");
                return;
            }
            next = sse.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let data = event.data.trim();
                // OpenAI terminates with "data: [DONE]"
                if data == "[DONE]" {
                    break;
                }
                let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        trace!(%e, data, "Failed to parse OpenAI chunk");
                        continue;
                    }
                };
                for event in translator.translate(&chunk) {
                    sink.emit(event);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Completion stream failed");
                for event in translator.finish() {
                    sink.emit(event);
                }
                sink.fail(&e.to_string());
                return;
            }
            None => break,
        }
    }

    for event in translator.finish() {
        sink.emit(event);
    }
    sink.complete();
}

#[async_trait]
impl ServiceAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.adapter_id
    }

    async fn process(&self, request: AdapterRequest) -> Result<AdapterResponse> {
        let body = self.build_request(&request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(&url)
            .header("content-type", "application/json");

        // Auth differs by style
        if self.api_style != ApiStyle::Ollama {
            if let Some(api_key) = &self.api_key {
                req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
            }
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("HTTP-Referer", "https://github.com/Clemens865/switchyard");
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(|e| service_error(&url, None, Some(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "OpenAI API error");
            return Err(service_error(&url, Some(status.as_u16()), None));
        }

        let sink = request.event_source.sink()?;
        tokio::spawn(pump(response, sink));

        Ok(AdapterResponse {
            thread_id: request.thread_id.unwrap_or_else(new_id),
            run_id: request.run_id,
            extensions: request.extensions,
        })
    }
}

fn service_error(url: &str, status: Option<u16>, source: Option<reqwest::Error>) -> RuntimeError {
    RuntimeError::LowLevel {
        url: url.to_string(),
        is_remote_endpoint: false,
        status,
        source: source.map(Into::into),
    }
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("base_url", &self.base_url)
            .field("api_style", &self.api_style)
            .field("model", &self.model)
            .finish()
    }
}

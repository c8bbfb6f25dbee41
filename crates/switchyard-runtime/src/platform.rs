//! Platform endpoints: managed agent hosting reached through its REST API.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use switchyard_core::config::PlatformEndpoint;
use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::events::{EventStream, RuntimeEvent};
use switchyard_core::types::{CallerContext, new_id};
use switchyard_providers::sse::{SseEvent, parse_sse_stream};

use crate::actions::{AgentHandler, AgentInvocation, ServerAction};
use crate::langchain::to_langchain;
use crate::remote::agent_descriptor;

/// Meta event carrying the answer to an interrupted run.
pub const INTERRUPT_EVENT: &str = "LangGraphInterruptEvent";

#[derive(Debug, Clone, Deserialize)]
pub struct Assistant {
    pub assistant_id: String,
    pub graph_id: String,
}

/// Client scoped to one deployment and one caller.
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    authorization: Option<String>,
}

impl PlatformClient {
    pub fn new(http: &reqwest::Client, endpoint: &PlatformEndpoint, context: &CallerContext) -> Self {
        Self {
            http: http.clone(),
            base_url: endpoint.deployment_url.clone(),
            api_key: endpoint.api_key.clone(),
            authorization: context.authorization().map(str::to_string),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        if let Some(token) = &self.authorization {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RuntimeError::transport(url, e))?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, %status, "Platform endpoint returned an error status");
            return Err(RuntimeError::from_status(url, status.as_u16()));
        }
        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response, url: &str) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| RuntimeError::transport(url, e))
    }

    /// `POST /assistants/search`
    pub async fn search_assistants(&self) -> Result<Vec<Assistant>> {
        let url = self.url("assistants/search");
        let request = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "limit": 100, "offset": 0 }));
        let response = self.send(request, &url).await?;
        self.json(response, &url).await
    }

    /// `GET /threads/{id}/state`, returning the `values` object.
    pub async fn thread_state(&self, thread_id: &str) -> Result<Value> {
        let url = self.url(&format!("threads/{thread_id}/state"));
        let response = self.send(self.request(reqwest::Method::GET, &url), &url).await?;
        let mut body: Value = self.json(response, &url).await?;
        Ok(body.get_mut("values").map(Value::take).unwrap_or(Value::Null))
    }

    /// `POST /threads`; an existing thread is left alone.
    pub async fn ensure_thread(&self, thread_id: &str) -> Result<()> {
        let url = self.url("threads");
        let request = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "thread_id": thread_id, "if_exists": "do_nothing" }));
        self.send(request, &url).await?;
        Ok(())
    }

    /// `POST /threads/{id}/runs/stream`
    pub async fn stream_run(&self, thread_id: &str, body: &Value) -> Result<reqwest::Response> {
        let url = self.url(&format!("threads/{thread_id}/runs/stream"));
        let request = self.request(reqwest::Method::POST, &url).json(body);
        self.send(request, &url).await
    }
}

/// Agent hosted by a platform deployment.
pub struct PlatformAgentHandler {
    http: reqwest::Client,
    endpoint: Arc<PlatformEndpoint>,
}

impl PlatformAgentHandler {
    fn run_body(invocation: &AgentInvocation) -> Value {
        let mut body = json!({
            "assistant_id": invocation.name,
            "stream_mode": ["events", "values"],
        });

        let resume = invocation
            .meta_events
            .iter()
            .find(|event| event.name == INTERRUPT_EVENT)
            .and_then(|event| event.response.clone());
        if let Some(response) = resume {
            body["command"] = json!({ "resume": response });
            return body;
        }

        let mut input = invocation
            .state
            .as_ref()
            .and_then(|s| serde_json::from_str::<Value>(&s.state).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        input["messages"] = Value::Array(to_langchain(&invocation.messages));
        input["copilotkit"] = json!({ "actions": invocation.actions });
        body["input"] = input;

        if let Some(config) = invocation
            .state
            .as_ref()
            .and_then(|s| s.config.as_deref())
            .and_then(|c| serde_json::from_str::<Value>(c).ok())
        {
            body["config"] = config;
        }
        if let Some(node) = &invocation.node_name {
            body["metadata"] = json!({ "node_name": node });
        }
        body
    }
}

#[async_trait]
impl AgentHandler for PlatformAgentHandler {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<EventStream> {
        let client = PlatformClient::new(&self.http, &self.endpoint, &invocation.context);
        client.ensure_thread(&invocation.thread_id).await?;

        let body = Self::run_body(&invocation);
        debug!(agent = %invocation.name, thread_id = %invocation.thread_id, "Starting platform run");
        let response = client.stream_run(&invocation.thread_id, &body).await?;

        let mapper = RunStreamMapper::new(&invocation.thread_id, &invocation.name, invocation.node_name.clone());
        Ok(Box::pin(map_run_stream(response, mapper)))
    }
}

/// One agent action per declared agent; no network call is made.
pub fn platform_actions(http: &reqwest::Client, endpoint: &Arc<PlatformEndpoint>) -> Vec<ServerAction> {
    let handler: Arc<dyn AgentHandler> = Arc::new(PlatformAgentHandler {
        http: http.clone(),
        endpoint: endpoint.clone(),
    });
    endpoint
        .agents
        .iter()
        .map(|agent| ServerAction::agent(agent_descriptor(&agent.name, &agent.description), handler.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Open {
    Nothing,
    Text(String),
    Action(String),
}

/// Maps run-stream SSE frames to runtime events.
struct RunStreamMapper {
    thread_id: String,
    agent_name: String,
    run_id: String,
    node_name: String,
    open: Open,
    /// Id for chunks that carry none; kept until the model call ends.
    fallback_message_id: Option<String>,
    last_state: Option<Value>,
}

impl RunStreamMapper {
    fn new(thread_id: &str, agent_name: &str, node_name: Option<String>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            agent_name: agent_name.to_string(),
            run_id: String::new(),
            node_name: node_name.unwrap_or_default(),
            open: Open::Nothing,
            fallback_message_id: None,
            last_state: None,
        }
    }

    fn map(&mut self, frame: &SseEvent) -> anyhow::Result<Vec<RuntimeEvent>> {
        let mut events = Vec::new();
        let data: Value = match serde_json::from_str(&frame.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Skipping malformed run stream frame");
                return Ok(events);
            }
        };

        match frame.event.as_deref() {
            Some("metadata") => {
                if let Some(run_id) = data.get("run_id").and_then(Value::as_str) {
                    self.run_id = run_id.to_string();
                }
            }
            Some("events") => self.map_chat_event(&data, &mut events),
            Some("values") => {
                self.close(&mut events);
                events.push(self.state_message(&data, true));
                self.last_state = Some(data);
            }
            Some("error") => {
                let message = data
                    .get("message")
                    .or_else(|| data.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("Agent run failed");
                anyhow::bail!("{message}");
            }
            _ => {}
        }
        Ok(events)
    }

    fn map_chat_event(&mut self, data: &Value, events: &mut Vec<RuntimeEvent>) {
        if let Some(node) = data.pointer("/metadata/langgraph_node").and_then(Value::as_str) {
            self.node_name = node.to_string();
        }

        match data.get("event").and_then(Value::as_str) {
            Some("on_chat_model_stream") => {
                let Some(chunk) = data.pointer("/data/chunk") else {
                    return;
                };
                let message_id = match chunk.get("id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => self.fallback_message_id.get_or_insert_with(new_id).clone(),
                };

                for call in chunk
                    .get("tool_call_chunks")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let id = call.get("id").and_then(Value::as_str);
                    let name = call.get("name").and_then(Value::as_str);
                    if let (Some(id), Some(name)) = (id, name) {
                        self.close(events);
                        events.push(RuntimeEvent::ActionExecutionStart {
                            action_execution_id: id.to_string(),
                            action_name: name.to_string(),
                            parent_message_id: Some(message_id.clone()),
                        });
                        self.open = Open::Action(id.to_string());
                    }
                    let args = call.get("args").and_then(Value::as_str).filter(|a| !a.is_empty());
                    if let (Open::Action(id), Some(args)) = (&self.open, args) {
                        events.push(RuntimeEvent::ActionExecutionArgs {
                            action_execution_id: id.clone(),
                            args: args.to_string(),
                        });
                    }
                }

                let content = chunk.get("content").and_then(Value::as_str).unwrap_or_default();
                if !content.is_empty() {
                    if self.open != Open::Text(message_id.clone()) {
                        self.close(events);
                        events.push(RuntimeEvent::TextMessageStart {
                            message_id: message_id.clone(),
                            parent_message_id: None,
                        });
                        self.open = Open::Text(message_id.clone());
                    }
                    events.push(RuntimeEvent::TextMessageContent {
                        message_id,
                        content: content.to_string(),
                    });
                }
            }
            Some("on_chat_model_end") => {
                self.close(events);
                self.fallback_message_id = None;
            }
            _ => {}
        }
    }

    fn close(&mut self, events: &mut Vec<RuntimeEvent>) {
        match std::mem::replace(&mut self.open, Open::Nothing) {
            Open::Nothing => {}
            Open::Text(message_id) => events.push(RuntimeEvent::TextMessageEnd { message_id }),
            Open::Action(action_execution_id) => {
                events.push(RuntimeEvent::ActionExecutionEnd { action_execution_id })
            }
        }
    }

    fn state_message(&self, values: &Value, running: bool) -> RuntimeEvent {
        let mut state = values.clone();
        if let Some(map) = state.as_object_mut() {
            map.remove("messages");
        }
        RuntimeEvent::AgentStateMessage {
            thread_id: self.thread_id.clone(),
            agent_name: self.agent_name.clone(),
            node_name: self.node_name.clone(),
            run_id: self.run_id.clone(),
            active: running,
            role: "assistant".into(),
            state: state.to_string(),
            running,
        }
    }

    /// Close anything open and report the final state as not running.
    fn finish(&mut self) -> Vec<RuntimeEvent> {
        let mut events = Vec::new();
        self.close(&mut events);
        if let Some(values) = self.last_state.take() {
            events.push(self.state_message(&values, false));
        }
        events
    }
}

fn map_run_stream(
    response: reqwest::Response,
    mapper: RunStreamMapper,
) -> impl futures::Stream<Item = anyhow::Result<RuntimeEvent>> + Send {
    let frames = Box::pin(parse_sse_stream(response));
    futures::stream::unfold(
        (frames, mapper, VecDeque::<anyhow::Result<RuntimeEvent>>::new(), false),
        |(mut frames, mut mapper, mut queue, mut done)| async move {
            loop {
                if let Some(item) = queue.pop_front() {
                    return Some((item, (frames, mapper, queue, done)));
                }
                if done {
                    return None;
                }
                match frames.next().await {
                    Some(Ok(frame)) => match mapper.map(&frame) {
                        Ok(events) => queue.extend(events.into_iter().map(Ok)),
                        Err(e) => {
                            queue.push_back(Err(e));
                            done = true;
                        }
                    },
                    Some(Err(e)) => {
                        queue.push_back(Err(e));
                        done = true;
                    }
                    None => {
                        queue.extend(mapper.finish().into_iter().map(Ok));
                        done = true;
                    }
                }
            }
        },
    )
}

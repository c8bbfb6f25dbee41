//! Direct endpoints: plain HTTP services exposing the runtime routes.
//!
//! | Route | Body | Response |
//! |---|---|---|
//! | `POST /info` | `{properties}` | `{actions, agents}` |
//! | `POST /agents/state` | `{properties, threadId, name}` | `{threadExists, state, messages}` |
//! | `POST /actions/execute` | `{name, arguments, properties}` | `{result}` |
//! | `POST /agents/execute` | see [`DirectAgentHandler`] | newline-delimited [`RuntimeEvent`]s |
//!
//! A 404 on any route is a discovery failure; any other non-2xx status or a
//! network error is a transport failure.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use switchyard_core::config::DirectEndpoint;
use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::events::{EventStream, RuntimeEvent};
use switchyard_core::types::{ActionDescriptor, AgentStateSnapshot, CallerContext, new_id};

use crate::actions::{ActionHandler, AgentHandler, AgentInvocation, ServerAction};

/// Agent entry of an `/info` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoAgent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoResponse {
    #[serde(default)]
    pub actions: Vec<ActionDescriptor>,
    #[serde(default)]
    pub agents: Vec<InfoAgent>,
}

impl InfoAgent {
    /// The endpoint's id, or a fresh one when it did not send any.
    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_id)
    }
}

/// POST `body` to `route` on `endpoint`, classifying failures.
async fn post(
    http: &reqwest::Client,
    endpoint: &DirectEndpoint,
    context: &CallerContext,
    route: &str,
    body: &serde_json::Value,
) -> Result<reqwest::Response> {
    let url = endpoint.route(route);
    let mut request = http.post(&url).json(body);
    for (name, value) in endpoint.request_headers(context) {
        request = request.header(name, value);
    }

    debug!(url = %url, "Calling direct endpoint");
    let response = request
        .send()
        .await
        .map_err(|e| RuntimeError::transport(url.clone(), e))?;

    let status = response.status();
    if !status.is_success() {
        warn!(url = %url, %status, "Direct endpoint returned an error status");
        return Err(RuntimeError::from_status(url, status.as_u16()));
    }
    Ok(response)
}

async fn read_json<T: serde::de::DeserializeOwned>(url: String, response: reqwest::Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| RuntimeError::transport(url, e))
}

/// `POST /info`: the agents and actions an endpoint offers.
pub async fn fetch_info(
    http: &reqwest::Client,
    endpoint: &DirectEndpoint,
    context: &CallerContext,
) -> Result<InfoResponse> {
    let body = json!({ "properties": context.properties });
    let response = post(http, endpoint, context, "info", &body).await?;
    read_json(endpoint.route("info"), response).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateResponse {
    #[serde(default)]
    thread_exists: bool,
    #[serde(default)]
    state: serde_json::Value,
    #[serde(default)]
    messages: serde_json::Value,
}

/// `POST /agents/state`: the endpoint already returns the canonical shape,
/// so `state` and `messages` are only re-serialized.
pub async fn fetch_state(
    http: &reqwest::Client,
    endpoint: &DirectEndpoint,
    context: &CallerContext,
    thread_id: &str,
    agent_name: &str,
) -> Result<AgentStateSnapshot> {
    let body = json!({
        "properties": context.properties,
        "threadId": thread_id,
        "name": agent_name,
    });
    let response = post(http, endpoint, context, "agents/state", &body).await?;
    let state: StateResponse = read_json(endpoint.route("agents/state"), response).await?;

    let serialized = |value: serde_json::Value, empty: &str| -> Result<String> {
        if value.is_null() {
            Ok(empty.to_string())
        } else {
            Ok(serde_json::to_string(&value)?)
        }
    };

    Ok(AgentStateSnapshot {
        thread_id: thread_id.to_string(),
        thread_exists: state.thread_exists,
        state: serialized(state.state, "{}")?,
        messages: serialized(state.messages, "[]")?,
    })
}

/// Callable action hosted by a direct endpoint.
pub struct DirectActionHandler {
    http: reqwest::Client,
    endpoint: Arc<DirectEndpoint>,
    name: String,
}

#[async_trait]
impl ActionHandler for DirectActionHandler {
    async fn call(
        &self,
        arguments: serde_json::Value,
        context: &CallerContext,
    ) -> anyhow::Result<serde_json::Value> {
        let body = json!({
            "name": self.name,
            "arguments": arguments,
            "properties": context.properties,
        });
        let response = post(&self.http, &self.endpoint, context, "actions/execute", &body).await?;
        let mut payload: serde_json::Value =
            read_json(self.endpoint.route("actions/execute"), response).await?;
        Ok(payload
            .get_mut("result")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

/// Agent hosted by a direct endpoint; runs stream back as NDJSON.
pub struct DirectAgentHandler {
    http: reqwest::Client,
    endpoint: Arc<DirectEndpoint>,
}

#[async_trait]
impl AgentHandler for DirectAgentHandler {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<EventStream> {
        let (state, config) = match &invocation.state {
            Some(input) => (
                serde_json::from_str(&input.state).unwrap_or_else(|_| json!({})),
                input
                    .config
                    .as_deref()
                    .and_then(|c| serde_json::from_str(c).ok())
                    .unwrap_or_else(|| json!({})),
            ),
            None => (json!({}), json!({})),
        };

        let body = json!({
            "name": invocation.name,
            "threadId": invocation.thread_id,
            "nodeName": invocation.node_name,
            "messages": invocation.messages,
            "state": state,
            "config": config,
            "properties": invocation.context.properties,
            "actions": invocation.actions,
            "metaEvents": invocation.meta_events,
        });
        let response = post(
            &self.http,
            &self.endpoint,
            &invocation.context,
            "agents/execute",
            &body,
        )
        .await?;
        Ok(Box::pin(parse_ndjson_events(Box::pin(response.bytes_stream()))))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>;

/// One [`RuntimeEvent`] per line; blank and malformed lines are skipped.
///
/// Lines are split on raw bytes and decoded whole, so multi-byte characters
/// split across chunks are kept intact.
fn parse_ndjson_events(bytes: ByteStream) -> impl Stream<Item = anyhow::Result<RuntimeEvent>> + Send {
    futures::stream::unfold(
        (bytes, BytesMut::new(), false),
        |(mut bytes, mut buffer, mut ended)| async move {
            loop {
                let line = match buffer.iter().position(|&b| b == b'\n') {
                    Some(pos) => Some(buffer.split_to(pos + 1)),
                    None if ended && !buffer.is_empty() => Some(buffer.split()),
                    None if ended => return None,
                    None => None,
                };

                if let Some(line) = line {
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<RuntimeEvent>(line) {
                        Ok(event) => return Some((Ok(event), (bytes, buffer, ended))),
                        Err(e) => {
                            let line = String::from_utf8_lossy(line);
                            warn!(error = %e, line = %line, "Skipping malformed agent event");
                            continue;
                        }
                    }
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("Agent event stream failed: {e}")),
                            (bytes, BytesMut::new(), true),
                        ));
                    }
                    None => ended = true,
                }
            }
        },
    )
}

/// Server actions contributed by a direct endpoint: its callable actions,
/// then one agent action per agent.
pub fn direct_actions(
    http: &reqwest::Client,
    endpoint: &Arc<DirectEndpoint>,
    info: InfoResponse,
) -> Vec<ServerAction> {
    let callable = info.actions.into_iter().map(|descriptor| {
        let handler = DirectActionHandler {
            http: http.clone(),
            endpoint: endpoint.clone(),
            name: descriptor.name.clone(),
        };
        ServerAction::new(descriptor, handler)
    });

    let agent_handler: Arc<dyn AgentHandler> = Arc::new(DirectAgentHandler {
        http: http.clone(),
        endpoint: endpoint.clone(),
    });
    let agents = info.agents.into_iter().map(move |agent| {
        ServerAction::agent(agent_descriptor(&agent.name, &agent.description), agent_handler.clone())
    });

    callable.chain(agents).collect()
}

/// Descriptor under which an agent is offered as an action.
pub fn agent_descriptor(name: &str, description: &str) -> ActionDescriptor {
    ActionDescriptor::new(
        name,
        description,
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the agent should do" }
            },
        }),
    )
}

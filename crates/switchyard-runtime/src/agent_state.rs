//! Agent state loading, normalized to [`AgentStateSnapshot`] for both
//! endpoint variants.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use switchyard_core::config::{EndpointDefinition, PlatformEndpoint};
use switchyard_core::error::{Result, RuntimeError};
use switchyard_core::types::{AgentStateSnapshot, CallerContext};

use crate::discovery::discover_agents;
use crate::langchain::from_langchain;
use crate::platform::PlatformClient;
use crate::remote::fetch_state;

/// Locate `agent_name` and fetch its state for `thread_id`.
pub async fn load_agent_state(
    http: &reqwest::Client,
    endpoints: &[Arc<EndpointDefinition>],
    context: &CallerContext,
    thread_id: &str,
    agent_name: &str,
) -> Result<AgentStateSnapshot> {
    let agents = discover_agents(http, endpoints, context).await?;
    let Some(agent) = agents.iter().find(|agent| agent.name == agent_name) else {
        return Err(RuntimeError::AgentDiscovery {
            agent_name: agent_name.to_string(),
            available: agents.iter().map(|a| a.name.clone()).collect(),
        });
    };

    match agent.endpoint.as_ref() {
        EndpointDefinition::Platform(platform) => {
            load_platform_state(http, platform, context, thread_id).await
        }
        EndpointDefinition::Direct(direct) => {
            fetch_state(http, direct, context, thread_id, agent_name).await
        }
    }
}

/// A failed state fetch is treated as an empty state, not an error.
async fn load_platform_state(
    http: &reqwest::Client,
    endpoint: &PlatformEndpoint,
    context: &CallerContext,
    thread_id: &str,
) -> Result<AgentStateSnapshot> {
    let client = PlatformClient::new(http, endpoint, context);
    let values = match client.thread_state(thread_id).await {
        Ok(values) => values,
        Err(e) => {
            warn!(error = %e, thread_id, "Thread state fetch failed, treating state as empty");
            Value::Null
        }
    };
    snapshot_from_values(thread_id, values)
}

/// Canonical snapshot from a platform thread's `values`.
pub fn snapshot_from_values(thread_id: &str, values: Value) -> Result<AgentStateSnapshot> {
    let mut state = match values {
        Value::Object(map) if !map.is_empty() => map,
        _ => return Ok(AgentStateSnapshot::empty(thread_id)),
    };

    let messages = match state.remove("messages") {
        Some(Value::Array(raw)) => from_langchain(&raw),
        _ => Vec::new(),
    };

    Ok(AgentStateSnapshot {
        thread_id: thread_id.to_string(),
        thread_exists: true,
        state: serde_json::to_string(&state)?,
        messages: serde_json::to_string(&messages)?,
    })
}

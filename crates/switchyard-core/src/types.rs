use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EndpointDefinition;

/// Caller context forwarded from the transport layer.
///
/// `properties` is opaque to the runtime except for `authorization`, which
/// platform endpoints forward as a bearer token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerContext {
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl CallerContext {
    pub fn with_properties(properties: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            properties,
            url: None,
        }
    }

    /// The `authorization` property, if it is a non-empty string.
    pub fn authorization(&self) -> Option<&str> {
        self.properties
            .get("authorization")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// A tool call requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

/// A conversation message, discriminated by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    System {
        id: String,
        content: String,
    },
    User {
        id: String,
        content: String,
    },
    Assistant {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        id: String,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_name: Option<String>,
        content: String,
    },
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Self::System { id, .. }
            | Self::User { id, .. }
            | Self::Assistant { id, .. }
            | Self::Tool { id, .. } => id,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            id: new_id(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            id: new_id(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            id: new_id(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Name, description and JSON Schema of an invocable action.
///
/// Identity is `name`: a working set never holds two descriptors with the
/// same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

impl ActionDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

pub fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Where a client-declared action may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionAvailability {
    #[default]
    Enabled,
    Disabled,
    /// Only offered to remote agents, never to the direct completion.
    Remote,
}

/// An action declared by the client (frontend) for this turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAction {
    #[serde(flatten)]
    pub descriptor: ActionDescriptor,
    #[serde(default)]
    pub available: ActionAvailability,
}

impl ClientAction {
    pub fn new(descriptor: ActionDescriptor) -> Self {
        Self {
            descriptor,
            available: ActionAvailability::Enabled,
        }
    }

    pub fn remote_only(descriptor: ActionDescriptor) -> Self {
        Self {
            descriptor,
            available: ActionAvailability::Remote,
        }
    }
}

/// A remote agent found during discovery. Recomputed on every call.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub name: String,
    pub id: String,
    pub description: String,
    #[serde(skip)]
    pub endpoint: Arc<EndpointDefinition>,
}

impl Agent {
    /// Structural equality ignoring the (possibly per-call) id.
    pub fn same_shape(&self, other: &Agent) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.endpoint.key() == other.endpoint.key()
    }
}

/// Identifies the agent (and thread) a turn is delegated to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Client-held state for an agent, sent along with a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateInput {
    pub agent_name: String,
    /// Serialized JSON state.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// Out-of-band event passed to remote agents (e.g. interrupt responses).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaEvent {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

/// Per-turn overrides for the completion backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// Canonical agent state, shared by both endpoint variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateSnapshot {
    pub thread_id: String,
    pub thread_exists: bool,
    /// Serialized JSON object.
    pub state: String,
    /// Serialized JSON array of messages.
    pub messages: String,
}

impl AgentStateSnapshot {
    pub fn empty(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            thread_exists: false,
            state: "{}".into(),
            messages: "[]".into(),
        }
    }
}

/// Random identifier used for messages, runs, threads and agents.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

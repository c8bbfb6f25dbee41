//! Granular runtime events streamed to the transport layer.
//!
//! The JSON form (`{"type": "TextMessageContent", "messageId": ..., ...}`) is
//! also what direct endpoints stream back from `/agents/execute`, one event
//! per line.

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Message, ToolCall, new_id};

/// One event in a turn's output sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RuntimeEvent {
    TextMessageStart {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    TextMessageContent {
        message_id: String,
        content: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    ActionExecutionStart {
        action_execution_id: String,
        action_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    ActionExecutionArgs {
        action_execution_id: String,
        args: String,
    },
    ActionExecutionEnd {
        action_execution_id: String,
    },
    ActionExecutionResult {
        action_name: String,
        action_execution_id: String,
        result: String,
    },
    AgentStateMessage {
        thread_id: String,
        agent_name: String,
        #[serde(default)]
        node_name: String,
        #[serde(default)]
        run_id: String,
        active: bool,
        #[serde(default = "default_agent_role")]
        role: String,
        /// Serialized JSON state.
        state: String,
        running: bool,
    },
    MetaEvent {
        name: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    /// A user-facing error rendered in the chat.
    RunError {
        message: String,
    },
}

fn default_agent_role() -> String {
    "assistant".into()
}

impl RuntimeEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::RunError { .. })
    }
}

/// Stream of events produced by a remote agent or adapter.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<RuntimeEvent>> + Send>>;

/// Terminal failure observed by subscribers of an event source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StreamFailure {
    pub message: String,
}

impl StreamFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Folds an event sequence into the messages it describes.
///
/// Text messages and action executions become assistant messages (an action
/// whose parent message is known is attached to it as a tool call), action
/// results become tool messages. Other events do not produce messages.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    messages: Vec<Message>,
    by_message_id: HashMap<String, usize>,
    by_action_id: HashMap<String, (usize, usize)>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::TextMessageStart { message_id, .. } => {
                self.assistant_slot(message_id);
            }
            RuntimeEvent::TextMessageContent {
                message_id,
                content,
            } => {
                let pos = self.assistant_slot(message_id);
                if let Message::Assistant { content: text, .. } = &mut self.messages[pos] {
                    text.get_or_insert_with(String::new).push_str(content);
                }
            }
            RuntimeEvent::ActionExecutionStart {
                action_execution_id,
                action_name,
                parent_message_id,
            } => {
                let owner = parent_message_id
                    .clone()
                    .unwrap_or_else(|| action_execution_id.clone());
                let pos = self.assistant_slot(&owner);
                if let Message::Assistant { tool_calls, .. } = &mut self.messages[pos] {
                    tool_calls.push(ToolCall {
                        id: action_execution_id.clone(),
                        name: action_name.clone(),
                        arguments: String::new(),
                    });
                    self.by_action_id
                        .insert(action_execution_id.clone(), (pos, tool_calls.len() - 1));
                }
            }
            RuntimeEvent::ActionExecutionArgs {
                action_execution_id,
                args,
            } => {
                if let Some(&(pos, idx)) = self.by_action_id.get(action_execution_id) {
                    if let Message::Assistant { tool_calls, .. } = &mut self.messages[pos] {
                        tool_calls[idx].arguments.push_str(args);
                    }
                }
            }
            RuntimeEvent::ActionExecutionResult {
                action_name,
                action_execution_id,
                result,
            } => {
                self.messages.push(Message::Tool {
                    id: new_id(),
                    tool_call_id: action_execution_id.clone(),
                    action_name: Some(action_name.clone()),
                    content: result.clone(),
                });
            }
            RuntimeEvent::TextMessageEnd { .. }
            | RuntimeEvent::ActionExecutionEnd { .. }
            | RuntimeEvent::AgentStateMessage { .. }
            | RuntimeEvent::MetaEvent { .. }
            | RuntimeEvent::RunError { .. } => {}
        }
    }

    pub fn finish(self) -> Vec<Message> {
        self.messages
    }

    fn assistant_slot(&mut self, message_id: &str) -> usize {
        if let Some(&pos) = self.by_message_id.get(message_id) {
            return pos;
        }
        self.messages.push(Message::Assistant {
            id: message_id.to_string(),
            content: None,
            tool_calls: Vec::new(),
        });
        let pos = self.messages.len() - 1;
        self.by_message_id.insert(message_id.to_string(), pos);
        pos
    }
}

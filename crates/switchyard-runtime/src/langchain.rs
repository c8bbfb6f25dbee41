//! Conversion between runtime messages and the LangChain message shape used
//! by platform threads (`{"type": "human" | "ai" | "system" | "tool", ...}`).

use serde_json::{Value, json};
use tracing::debug;

use switchyard_core::types::{Message, ToolCall, new_id};

/// Messages in the shape platform runs accept as input.
pub fn to_langchain(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message {
            Message::System { id, content } => json!({ "type": "system", "id": id, "content": content }),
            Message::User { id, content } => json!({ "type": "human", "id": id, "content": content }),
            Message::Assistant {
                id,
                content,
                tool_calls,
            } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        let args: Value = serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
                        json!({ "id": tc.id, "name": tc.name, "args": args })
                    })
                    .collect();
                json!({
                    "type": "ai",
                    "id": id,
                    "content": content.clone().unwrap_or_default(),
                    "tool_calls": calls,
                })
            }
            Message::Tool {
                id,
                tool_call_id,
                action_name,
                content,
            } => json!({
                "type": "tool",
                "id": id,
                "tool_call_id": tool_call_id,
                "name": action_name,
                "content": content,
            }),
        })
        .collect()
}

/// Normalize LangChain messages; unknown shapes are skipped.
pub fn from_langchain(values: &[Value]) -> Vec<Message> {
    values.iter().filter_map(convert_one).collect()
}

fn convert_one(value: &Value) -> Option<Message> {
    let kind = value.get("type").and_then(Value::as_str)?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_id);
    let content = text_content(value.get("content"));

    match kind {
        "human" => Some(Message::User { id, content }),
        "system" => Some(Message::System { id, content }),
        "ai" => {
            let tool_calls = value
                .get("tool_calls")
                .and_then(Value::as_array)
                .map(|calls| {
                    calls
                        .iter()
                        .filter_map(|call| {
                            Some(ToolCall {
                                id: call.get("id")?.as_str()?.to_string(),
                                name: call.get("name")?.as_str()?.to_string(),
                                arguments: call
                                    .get("args")
                                    .map(Value::to_string)
                                    .unwrap_or_else(|| "{}".into()),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Message::Assistant {
                id,
                content: (!content.is_empty()).then_some(content),
                tool_calls,
            })
        }
        "tool" => Some(Message::Tool {
            id,
            tool_call_id: value.get("tool_call_id")?.as_str()?.to_string(),
            action_name: value.get("name").and_then(Value::as_str).map(str::to_string),
            content,
        }),
        other => {
            debug!(kind = other, "Skipping unsupported LangChain message");
            None
        }
    }
}

/// Plain string content, or the concatenated text parts of multi-part content.
fn text_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect(),
        _ => String::new(),
    }
}

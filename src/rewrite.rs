//! Outgoing request rewriting
//!
//! Backends without native tool support never see `tools`: the definitions move into the system
//! prompt, and earlier tool calls and results in the history are flattened into the XML text the
//! model is asked to produce.

use crate::config::BackendConfig;
use crate::tools::{build_tool_prompt, ToolNames};
use anyhow::{Context, Result};
use llm::convert::{convert_request, message_text, tool_definitions};
use llm::{ToolDefinition, WireFormat};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt::Write;
use tracing::debug;

/// Request fields that only make sense to a backend with native tools
const TOOL_FIELDS: &[&str] = &["tools", "tool_choice", "parallel_tool_calls"];

#[derive(Debug, Clone)]
pub struct RewrittenRequest {
    /// Body in the backend's format, always streaming
    pub body: Value,
    /// Tools the client declared
    pub tools: Vec<ToolDefinition>,
}

/// Rewrite a client request for the backend.
///
/// `names` decides which parameters are rendered as raw text when history is flattened.
pub fn rewrite_request(
    body: &Value,
    client: WireFormat,
    backend: &BackendConfig,
    names: &ToolNames,
) -> Result<RewrittenRequest> {
    let tools = tool_definitions(body);
    let mut request = body
        .as_object()
        .context("Chat request body must be a JSON object")?
        .clone();

    if !backend.native_tools {
        for field in TOOL_FIELDS {
            request.remove(*field);
        }

        let mut messages = match request.remove("messages") {
            Some(Value::Array(messages)) => flatten_history(messages, names),
            _ => Vec::new(),
        };
        if !tools.is_empty() {
            inject_tool_prompt(&mut messages, &build_tool_prompt(&tools));
        }
        request.insert("messages".to_string(), Value::Array(messages));
    }

    let mut converted = convert_request(&Value::Object(request), client, backend.format)?;
    if let Some(model) = &backend.model {
        converted["model"] = json!(model);
    }

    debug!(
        "Rewrote {} request for {} backend with {} tool(s)",
        client,
        backend.format,
        tools.len()
    );
    Ok(RewrittenRequest {
        body: converted,
        tools,
    })
}

/// Extend the first system message with the tool prompt, or prepend one
fn inject_tool_prompt(messages: &mut Vec<Value>, prompt: &str) {
    let system = messages
        .iter_mut()
        .find(|message| message.get("role").and_then(Value::as_str) == Some("system"));

    match system {
        Some(message) => {
            let existing = message.get("content").map(message_text).unwrap_or_default();
            let content = if existing.trim().is_empty() {
                prompt.to_string()
            } else {
                format!("{}\n\n{}", existing.trim_end(), prompt)
            };
            message["content"] = Value::String(content);
        }
        None => messages.insert(0, json!({"role": "system", "content": prompt})),
    }
}

/// Turn assistant tool calls into XML text and tool results into user messages
fn flatten_history(messages: Vec<Value>, names: &ToolNames) -> Vec<Value> {
    // Event-stream results refer to their call by id
    let mut call_names: HashMap<String, String> = HashMap::new();

    messages
        .into_iter()
        .map(|message| {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match role.as_str() {
                "assistant" => flatten_tool_calls(message, names, &mut call_names),
                "tool" | "function" => tool_result_message(&message, &call_names),
                _ => message,
            }
        })
        .collect()
}

fn flatten_tool_calls(
    mut message: Value,
    names: &ToolNames,
    call_names: &mut HashMap<String, String>,
) -> Value {
    let Some(Value::Array(calls)) = message.as_object_mut().and_then(|m| m.remove("tool_calls"))
    else {
        return message;
    };
    if calls.is_empty() {
        return message;
    }

    let mut xml = String::from("<tool_calls>\n");
    for call in &calls {
        let function = call.get("function").unwrap_or(call);
        let name = function.get("name").and_then(Value::as_str).unwrap_or("");
        if let Some(id) = call.get("id").and_then(Value::as_str) {
            call_names.insert(id.to_string(), name.to_string());
        }

        let arguments = match function.get("arguments") {
            Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|_| json!({})),
            Some(other) => other.clone(),
            None => json!({}),
        };
        write_call(&mut xml, name, &arguments, names);
    }
    xml.push_str("</tool_calls>");

    let text = message.get("content").map(message_text).unwrap_or_default();
    let content = if text.trim().is_empty() {
        xml
    } else {
        format!("{}\n{}", text.trim_end(), xml)
    };
    message["content"] = Value::String(content);
    message
}

fn tool_result_message(message: &Value, call_names: &HashMap<String, String>) -> Value {
    let name = message
        .get("tool_name")
        .or_else(|| message.get("name"))
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("tool_call_id")
                .and_then(Value::as_str)
                .and_then(|id| call_names.get(id))
                .map(String::as_str)
        })
        .unwrap_or("unknown");
    let content = message.get("content").map(message_text).unwrap_or_default();

    json!({
        "role": "user",
        "content": format!(
            "<tool_result name=\"{}\">\n{}\n</tool_result>",
            escape_text(name),
            content.trim_end()
        ),
    })
}

fn write_call(xml: &mut String, name: &str, arguments: &Value, names: &ToolNames) {
    let _ = writeln!(xml, "<{name}>");
    if let Value::Object(map) = arguments {
        write_fields(xml, map, names);
    }
    let _ = writeln!(xml, "</{name}>");
}

fn write_fields(xml: &mut String, map: &Map<String, Value>, names: &ToolNames) {
    for (key, value) in map {
        match value {
            // Lists are repeated sibling elements
            Value::Array(items) => {
                for item in items {
                    write_element(xml, key, item, names);
                }
            }
            other => write_element(xml, key, other, names),
        }
    }
}

fn write_element(xml: &mut String, key: &str, value: &Value, names: &ToolNames) {
    match value {
        Value::Object(map) => {
            let _ = writeln!(xml, "<{key}>");
            write_fields(xml, map, names);
            let _ = writeln!(xml, "</{key}>");
        }
        Value::String(text) if names.is_raw_parameter(key) => {
            if text.contains("]]>") {
                let _ = writeln!(xml, "<{key}>{}</{key}>", escape_text(text));
            } else if text.contains(['<', '&']) {
                let _ = writeln!(xml, "<{key}><![CDATA[{text}]]></{key}>");
            } else {
                let _ = writeln!(xml, "<{key}>{text}</{key}>");
            }
        }
        Value::String(text) => {
            let _ = writeln!(xml, "<{key}>{}</{key}>", escape_text(text));
        }
        Value::Null => {
            let _ = writeln!(xml, "<{key}>null</{key}>");
        }
        other => {
            let _ = writeln!(xml, "<{key}>{other}</{key}>");
        }
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

//! System prompt describing the XML tool-call syntax

use llm::ToolDefinition;
use serde_json::Value;
use std::fmt::Write;

const TOOL_PROMPT: &str = include_str!("../../resources/tool_prompt.md");

const GENERIC_EXAMPLE: &str =
    "<tool_calls>\n<tool_name>\n<parameter>value</parameter>\n</tool_name>\n</tool_calls>";

/// Build the prompt that teaches a model without native tool support to emit XML calls
pub fn build_tool_prompt(tools: &[ToolDefinition]) -> String {
    let example = tools
        .first()
        .map(example_call)
        .unwrap_or_else(|| GENERIC_EXAMPLE.to_string());

    let documentation = tools
        .iter()
        .map(tool_documentation)
        .collect::<Vec<_>>()
        .join("\n");

    TOOL_PROMPT
        .replace("{{example}}", &example)
        .replace("{{tools}}", documentation.trim_end())
}

fn tool_documentation(tool: &ToolDefinition) -> String {
    let mut doc = format!("### {}\n", tool.name);
    if !tool.description.is_empty() {
        let _ = writeln!(doc, "{}", tool.description.trim());
    }

    let parameters = parameters(tool);
    if parameters.is_empty() {
        doc.push_str("Parameters: none\n");
        return doc;
    }

    doc.push_str("Parameters:\n");
    for parameter in parameters {
        let _ = write!(doc, "- `{}`", parameter.name);
        if let Some(kind) = parameter.kind {
            let _ = write!(doc, " ({kind})");
        }
        if parameter.required {
            doc.push_str(" (required)");
        }
        if let Some(description) = parameter.description {
            let _ = write!(doc, ": {description}");
        }
        doc.push('\n');
    }
    doc
}

struct Parameter<'a> {
    name: &'a str,
    kind: Option<&'a str>,
    description: Option<&'a str>,
    required: bool,
}

fn parameters(tool: &ToolDefinition) -> Vec<Parameter<'_>> {
    let required: Vec<&str> = tool
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    tool.parameters
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, schema)| Parameter {
                    name,
                    kind: schema.get("type").and_then(Value::as_str),
                    description: schema.get("description").and_then(Value::as_str),
                    required: required.contains(&name.as_str()),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn example_call(tool: &ToolDefinition) -> String {
    let mut example = format!("<tool_calls>\n<{}>\n", tool.name);
    for parameter in parameters(tool) {
        let _ = writeln!(example, "<{0}>value</{0}>", parameter.name);
    }
    let _ = write!(example, "</{}>\n</tool_calls>", tool.name);
    example
}

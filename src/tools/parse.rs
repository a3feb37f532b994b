//! Conversion of complete tool-call fragments into structured calls

use super::detect::{detect, Detection, PartialState};
use super::names::ToolNames;
use super::scan::{
    find_closing, html_unescape, local_name, read_close_tag, read_open_tag, strip_cdata, CloseScan,
    TagScan, CDATA_CLOSE,
    CDATA_OPEN,
};
use super::types::{ExtractedToolCall, ToolError};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Content starting with one of these is treated as markup and kept verbatim
const MARKUP_PREFIXES: &[&str] = &[
    "<!doctype", "<?xml", "<html", "<div", "<svg", "<script", "<style", "<body", "<head", "<!--",
];

/// Result of scanning a whole text for tool calls
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Text before the tool-call fragment
    pub prefix: String,
    pub calls: Vec<ExtractedToolCall>,
    /// Text after the tool-call fragment
    pub remainder: String,
}

/// Parse one complete fragment, a bare tool element or a wrapper, into its calls.
///
/// Returns `None` for anything that is not a well-formed call to a declared tool.
pub fn parse_fragment(fragment: &str, names: &ToolNames) -> Option<Vec<ExtractedToolCall>> {
    match try_parse_fragment(fragment, names, false) {
        Ok(calls) => Some(calls),
        Err(e) => {
            debug!("Rejected tool call fragment: {}", e);
            None
        }
    }
}

/// Like `parse_fragment`, but tolerates a missing closing tag for the root element.
///
/// Used once the backend stream has ended, for models that stop right before the root's
/// closing tag (often because it was configured as a stop sequence).
pub fn parse_unterminated(fragment: &str, names: &ToolNames) -> Option<Vec<ExtractedToolCall>> {
    match try_parse_fragment(fragment, names, true) {
        Ok(calls) => Some(calls),
        Err(e) => {
            debug!("Rejected unterminated tool call fragment: {}", e);
            None
        }
    }
}

/// Run detection over a complete text and parse the chosen fragment
pub fn extract_tool_calls(text: &str, names: &ToolNames) -> Option<Extraction> {
    let (detection, _) = detect(text, names, &PartialState::Idle);
    let Detection::Complete { start, end, .. } = detection else {
        return None;
    };

    let calls = parse_fragment(&text[start..end], names)?;
    Some(Extraction {
        prefix: text[..start].to_string(),
        calls,
        remainder: text[end..].to_string(),
    })
}

fn try_parse_fragment(
    fragment: &str,
    names: &ToolNames,
    allow_unterminated: bool,
) -> Result<Vec<ExtractedToolCall>, ToolError> {
    trace!("Parsing tool call fragment:\n{}", fragment);
    let fragment = fragment.trim();
    if !fragment.starts_with('<') {
        return Err(ToolError::ParseError("Fragment does not start with a tag".into()));
    }

    let (root, body) = match read_open_tag(fragment, 0) {
        TagScan::Open {
            name,
            self_closing: true,
            end,
        } => (name, Body::Complete("", end)),
        TagScan::Open { name, end, .. } => match find_closing(fragment, end, name) {
            Some((content_end, close_end)) => {
                (name, Body::Complete(&fragment[end..content_end], close_end))
            }
            None if allow_unterminated => (name, Body::Unterminated(&fragment[end..])),
            None => {
                return Err(ToolError::ParseError(format!(
                    "Missing closing tag for {name}"
                )))
            }
        },
        _ => return Err(ToolError::ParseError("Malformed root tag".into())),
    };

    let body = match body {
        Body::Complete(content, close_end) => {
            if !fragment[close_end..].trim().is_empty() {
                return Err(ToolError::ParseError(format!(
                    "Unexpected text after closing tag of {root}"
                )));
            }
            content
        }
        Body::Unterminated(content) => content,
    };

    if names.is_wrapper(root) {
        let calls = parse_wrapper_body(body, names)?;
        if calls.is_empty() {
            return Err(ToolError::ParseError(
                "Wrapper contains no declared tool".into(),
            ));
        }
        return Ok(calls);
    }

    let name = local_name(root);
    if !names.is_known(name) {
        return Err(ToolError::UnknownTool(name.to_string()));
    }
    Ok(vec![ExtractedToolCall::new(name, parse_arguments(body, names)?)])
}

enum Body<'a> {
    /// Content and the offset just past the closing tag
    Complete(&'a str, usize),
    Unterminated(&'a str),
}

/// Calls inside a wrapper: one per declared-tool element, or a JSON payload
fn parse_wrapper_body(body: &str, names: &ToolNames) -> Result<Vec<ExtractedToolCall>, ToolError> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return parse_json_calls(trimmed, names);
    }

    let mut calls = Vec::new();
    for element in elements(body)? {
        let name = local_name(element.name);
        if names.is_known(name) {
            calls.push(ExtractedToolCall::new(
                name,
                parse_arguments(element.content, names)?,
            ));
        } else {
            debug!("Skipping undeclared element <{}> inside wrapper", element.name);
        }
    }
    Ok(calls)
}

/// `{"name": .., "arguments": {..}}` objects, alone or in an array
fn parse_json_calls(text: &str, names: &ToolNames) -> Result<Vec<ExtractedToolCall>, ToolError> {
    let value: Value = serde_json::from_str(text)?;
    let entries = match value {
        Value::Array(entries) => entries,
        other => vec![other],
    };

    let mut calls = Vec::new();
    for entry in entries {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            return Err(ToolError::ParseError("JSON tool call without a name".into()));
        };
        if !names.is_known(name) {
            debug!("Skipping undeclared JSON tool call {}", name);
            continue;
        }
        let arguments = match entry.get("arguments").or_else(|| entry.get("parameters")) {
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(Value::String(text)) => serde_json::from_str(text)?,
            None => Map::new(),
            Some(other) => {
                return Err(ToolError::ParseError(format!(
                    "Arguments of {name} are not an object: {other}"
                )))
            }
        };
        calls.push(ExtractedToolCall::new(name, arguments));
    }
    Ok(calls)
}

/// Arguments of one tool element: a JSON object body or nested parameter elements
fn parse_arguments(body: &str, names: &ToolNames) -> Result<Map<String, Value>, ToolError> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let children = elements(body)?;
    if children.is_empty() && !trimmed.is_empty() {
        return Err(ToolError::ParseError(format!(
            "Expected parameter elements, found text: {trimmed}"
        )));
    }
    collect_children(children, names)
}

fn collect_children(
    children: Vec<Element<'_>>,
    names: &ToolNames,
) -> Result<Map<String, Value>, ToolError> {
    let mut arguments = Map::new();
    let mut repeated: HashSet<String> = HashSet::new();

    for child in children {
        let key = local_name(child.name).to_string();
        let value = parse_value(&child, names)?;

        match arguments.get_mut(&key) {
            None => {
                arguments.insert(key, value);
            }
            Some(Value::Array(items)) if repeated.contains(&key) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
                repeated.insert(key);
            }
        }
    }

    Ok(arguments)
}

fn parse_value(element: &Element<'_>, names: &ToolNames) -> Result<Value, ToolError> {
    let content = element.content;
    if names.is_raw_parameter(element.name) || looks_like_markup(content) {
        return Ok(Value::String(strip_cdata(content).into_owned()));
    }

    let children = elements(content)?;
    if children.is_empty() {
        return Ok(coerce_leaf(&leaf_text(content)));
    }
    Ok(Value::Object(collect_children(children, names)?))
}

fn looks_like_markup(content: &str) -> bool {
    let start = content.trim_start();
    MARKUP_PREFIXES.iter().any(|prefix| {
        start
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Leaf text with entities decoded outside CDATA sections
fn leaf_text(content: &str) -> String {
    let mut text = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find(CDATA_OPEN) {
        text.push_str(&html_unescape(&rest[..start]));
        let inner = &rest[start + CDATA_OPEN.len()..];
        let end = inner.find(CDATA_CLOSE).unwrap_or(inner.len());
        text.push_str(&inner[..end]);
        rest = inner.get(end + CDATA_CLOSE.len()..).unwrap_or("");
    }
    text.push_str(&html_unescape(rest));
    text
}

/// Type a leaf value: booleans, null, JSON numbers and JSON containers; anything else stays a
/// trimmed string
pub fn coerce_leaf(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed {
        "" => return Value::String(String::new()),
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }

    if let Ok(number) = serde_json::from_str::<serde_json::Number>(trimmed) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    Value::String(trimmed.to_string())
}

struct Element<'a> {
    name: &'a str,
    content: &'a str,
}

/// Split content into its top-level elements.
///
/// Text between elements, comments and processing instructions is skipped. A stray closing
/// tag or an element that never closes is an error.
fn elements(content: &str) -> Result<Vec<Element<'_>>, ToolError> {
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(offset) = content[pos..].find('<') {
        let at = pos + offset;
        let rest = &content[at..];

        if let Some(skip) = skip_non_element(rest) {
            pos = at + skip?;
            continue;
        }

        if rest.starts_with("</") {
            match read_close_tag(content, at) {
                CloseScan::Close { name, .. } => {
                    return Err(ToolError::ParseError(format!("Unexpected closing tag </{name}>")))
                }
                CloseScan::Incomplete => {
                    return Err(ToolError::ParseError("Truncated closing tag".into()))
                }
                CloseScan::NotATag => {
                    pos = at + 1;
                    continue;
                }
            }
        }

        match read_open_tag(content, at) {
            TagScan::Open {
                name,
                end,
                self_closing: true,
            } => {
                found.push(Element { name, content: "" });
                pos = end;
            }
            TagScan::Open { name, end, .. } => {
                let (content_end, close_end) = find_closing(content, end, name)
                    .ok_or_else(|| ToolError::ParseError(format!("Unclosed element <{name}>")))?;
                found.push(Element {
                    name,
                    content: &content[end..content_end],
                });
                pos = close_end;
            }
            TagScan::Incomplete { name, .. } => {
                return Err(ToolError::ParseError(format!("Truncated tag <{name}")));
            }
            TagScan::NotATag => pos = at + 1,
        }
    }

    Ok(found)
}

/// Length to skip for CDATA, comments and processing instructions at the start of `rest`
fn skip_non_element(rest: &str) -> Option<Result<usize, ToolError>> {
    let (open, close) = if rest.starts_with(CDATA_OPEN) {
        (CDATA_OPEN, CDATA_CLOSE)
    } else if rest.starts_with("<!--") {
        ("<!--", "-->")
    } else if rest.starts_with("<?") {
        ("<?", "?>")
    } else {
        return None;
    };

    Some(
        rest[open.len()..]
            .find(close)
            .map(|end| open.len() + end + close.len())
            .ok_or_else(|| ToolError::ParseError(format!("Unterminated {open}"))),
    )
}

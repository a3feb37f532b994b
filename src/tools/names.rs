//! Known tool names and the markers the detector looks for

use super::scan::local_name;
use llm::ToolDefinition;
use std::collections::HashSet;

/// Accepted spellings of the element wrapping one or more tool invocations
pub const WRAPPER_TAGS: [&str; 2] = ["tool_calls", "tool:calls"];

/// Parameters whose content is always kept as verbatim text
pub const DEFAULT_RAW_PARAMETERS: &[&str] = &["content", "code", "html", "markdown", "body"];

/// Longest namespace prefix (including the colon) tolerated in front of a tag name
pub const MAX_NAMESPACE_PREFIX: usize = 16;

/// Read-only view of the tools declared for one request
#[derive(Debug, Clone, Default)]
pub struct ToolNames {
    tools: HashSet<String>,
    raw_parameters: HashSet<String>,
    longest_name: usize,
    require_wrapper: bool,
}

impl ToolNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tools: HashSet<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|name| !name.is_empty())
            .collect();
        let longest_name = tools
            .iter()
            .map(String::len)
            .chain(WRAPPER_TAGS.iter().map(|tag| tag.len()))
            .max()
            .unwrap_or(0);

        Self {
            tools,
            raw_parameters: DEFAULT_RAW_PARAMETERS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            longest_name,
            require_wrapper: false,
        }
    }

    pub fn from_definitions(definitions: &[ToolDefinition]) -> Self {
        Self::new(definitions.iter().map(|tool| tool.name.clone()))
    }

    /// Add parameter names whose content must be kept verbatim
    pub fn with_raw_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw_parameters.extend(names.into_iter().map(Into::into));
        self
    }

    /// Only accept invocations enclosed in a wrapper element
    pub fn with_require_wrapper(mut self, require_wrapper: bool) -> Self {
        self.require_wrapper = require_wrapper;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn require_wrapper(&self) -> bool {
        self.require_wrapper
    }

    /// Whether `name`, with any namespace prefix removed, is a declared tool
    pub fn is_known(&self, name: &str) -> bool {
        self.tools.contains(local_name(name))
    }

    /// Whether `name` is one of the wrapper spellings, or `tool_calls` under any namespace
    pub fn is_wrapper(&self, name: &str) -> bool {
        WRAPPER_TAGS.contains(&name) || local_name(name) == WRAPPER_TAGS[0]
    }

    pub fn is_raw_parameter(&self, name: &str) -> bool {
        self.raw_parameters.contains(local_name(name))
    }

    /// Whether a tag name cut off at the end of the text could still grow into a marker
    pub fn could_complete(&self, partial: &str) -> bool {
        let (prefix, local) = match partial.rfind(':') {
            Some(colon) => (&partial[..=colon], &partial[colon + 1..]),
            None => ("", partial),
        };
        if prefix.len() > MAX_NAMESPACE_PREFIX {
            return false;
        }

        let grows_into = |full: &str| full.starts_with(local);
        if WRAPPER_TAGS.iter().any(|tag| tag.starts_with(partial))
            || grows_into(WRAPPER_TAGS[0])
            || self.tools.iter().any(|tool| grows_into(tool))
        {
            return true;
        }

        // Without a colon yet, the text may still turn out to be a namespace prefix
        prefix.is_empty() && partial.len() < MAX_NAMESPACE_PREFIX
    }

    /// Length of the longest opening marker, `<` + name + `>`
    pub fn longest_marker_len(&self) -> usize {
        self.longest_name + 2
    }

    /// Number of trailing bytes that may be held back while waiting for a marker to complete
    pub fn window_len(&self) -> usize {
        self.longest_marker_len() + MAX_NAMESPACE_PREFIX
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(String::as_str)
    }
}

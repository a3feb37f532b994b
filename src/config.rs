//! Proxy configuration loaded from `config.json`

use crate::bridge::{BridgeOptions, ToolCallPolicy};
use anyhow::{Context, Result};
use llm::WireFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub backend: BackendConfig,
    pub tool_calls: ToolCallConfig,
    /// Bound of the per-stream frame channel toward the client
    pub channel_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 11435)),
            backend: BackendConfig::default(),
            tool_calls: ToolCallConfig::default(),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub format: WireFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// The backend understands tool definitions itself; no interception
    pub native_tools: bool,
    /// Model name sent upstream instead of the client's
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            format: WireFormat::LineJson,
            api_key: None,
            native_tools: false,
            model: None,
        }
    }
}

impl BackendConfig {
    /// Upstream chat endpoint for the configured format
    pub fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.format {
            WireFormat::EventStream => {
                if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
            WireFormat::LineJson => format!("{base}/api/chat"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolCallConfig {
    pub max_buffer_bytes: usize,
    pub policy: ToolCallPolicy,
    /// Parameter names whose content is kept verbatim, in addition to the built-in ones
    pub raw_parameters: Vec<String>,
    /// Only `<tool_calls>` wrappers start a call; bare tool tags stay text
    pub require_wrapper: bool,
}

impl Default for ToolCallConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 64 * 1024,
            policy: ToolCallPolicy::SinglePerTurn,
            raw_parameters: Vec::new(),
            require_wrapper: false,
        }
    }
}

impl ToolCallConfig {
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            policy: self.policy,
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }
}

impl ProxyConfig {
    /// Load from `custom_path`, or from the first config directory holding `config.json`.
    /// Without any file the defaults apply; an explicit path must exist.
    pub fn load(custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Configuration file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => match Self::find_config_file() {
                Some(path) => path,
                None => {
                    info!("No configuration file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        let value = substitute_env_vars_in_value(value)
            .with_context(|| format!("Failed to substitute env vars in {}", path.display()))?;

        serde_json::from_value(value)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    fn find_config_file() -> Option<PathBuf> {
        config_directories()
            .into_iter()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|candidate| candidate.exists())
    }
}

/// Directories that may contain the configuration, ordered by priority
fn config_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(custom_dir) = std::env::var("TOOL_BRIDGE_CONFIG_DIR") {
        push_unique_dir(&mut dirs, PathBuf::from(custom_dir));
    }
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        push_unique_dir(&mut dirs, PathBuf::from(xdg_config).join("tool-bridge"));
    }
    if let Some(home_dir) = dirs::home_dir() {
        push_unique_dir(&mut dirs, home_dir.join(".config").join("tool-bridge"));
    }
    if let Some(system_config) = dirs::config_dir() {
        push_unique_dir(&mut dirs, system_config.join("tool-bridge"));
    }

    dirs
}

fn push_unique_dir(dirs: &mut Vec<PathBuf>, candidate: PathBuf) {
    if !dirs.iter().any(|existing| existing == &candidate) {
        dirs.push(candidate);
    }
}

/// Recursively substitute environment variables in JSON string values
fn substitute_env_vars_in_value(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_env_vars_in_string(&s)?)),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, val)| Ok((key, substitute_env_vars_in_value(val)?)))
            .collect::<Result<_>>()
            .map(Value::Object),
        Value::Array(items) => items
            .into_iter()
            .map(substitute_env_vars_in_value)
            .collect::<Result<_>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// Substitute `${VAR_NAME}` references in a string
fn substitute_env_vars_in_string(input: &str) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let end = rest[start..].find('}').ok_or_else(|| {
            anyhow::anyhow!("Unclosed environment variable substitution: {input}")
        })?;
        let var_name = &rest[start + 2..start + end];
        let var_value = std::env::var(var_name)
            .with_context(|| format!("Environment variable not set: {var_name}"))?;

        result.push_str(&rest[..start]);
        result.push_str(&var_value);
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}

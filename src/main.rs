use anyhow::Result;
use clap::Parser;
use llm::WireFormat;
use std::net::SocketAddr;
use std::path::PathBuf;
use tool_bridge::bridge::ToolCallPolicy;
use tool_bridge::config::ProxyConfig;
use tool_bridge::{logging, server};
use tracing::debug;

/// Streaming chat proxy that turns XML tool calls from the model into native tool-call deltas
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (default: ~/.config/tool-bridge/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Base URL of the backend
    #[arg(long)]
    backend_url: Option<String>,

    /// Wire format the backend speaks
    #[arg(long, value_enum)]
    backend_format: Option<WireFormat>,

    /// API key sent to the backend as a bearer token
    #[arg(long, env = "TOOL_BRIDGE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model name sent to the backend instead of the client's
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// The backend supports tools natively; only convert between formats
    #[arg(long)]
    native_tools: bool,

    /// How many tool calls to surface per backend turn
    #[arg(long, value_enum)]
    policy: Option<ToolCallPolicy>,

    /// Only treat `<tool_calls>` wrappers as tool calls
    #[arg(long)]
    require_wrapper: bool,

    /// Enable verbose logging (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Command line values take precedence over the configuration file
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(url) = &self.backend_url {
            config.backend.base_url = url.clone();
        }
        if let Some(format) = self.backend_format {
            config.backend.format = format;
        }
        if let Some(api_key) = &self.api_key {
            config.backend.api_key = Some(api_key.clone());
        }
        if let Some(model) = &self.model {
            config.backend.model = Some(model.clone());
        }
        if self.native_tools {
            config.backend.native_tools = true;
        }
        if let Some(policy) = self.policy {
            config.tool_calls.policy = policy;
        }
        if self.require_wrapper {
            config.tool_calls.require_wrapper = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logging::setup_logging(args.verbose, args.log_file.as_deref());

    let mut config = ProxyConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    debug!(
        "Backend {} ({}), native tools: {}",
        config.backend.base_url, config.backend.format, config.backend.native_tools
    );

    server::serve(config).await
}

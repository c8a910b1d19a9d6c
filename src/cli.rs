use clap::Parser;

use crate::config::types::GatewaySettings;

#[derive(Parser)]
#[command(
    name = "hub-gateway",
    about = "HTTP gateway for stdio, HTTP and SSE tool servers"
)]
pub struct Cli {
    /// Path to the backend document (.toml or .json)
    #[arg(long, default_value = "mcp-servers.toml", env = "MCP_CONFIG")]
    pub config: String,

    /// Port to listen on
    #[arg(long, default_value_t = 3000, env = "PORT")]
    pub port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Public base URL used in endpoint listings (default http://localhost:{port})
    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Allowed cross-origin request source; "*" or a comma-separated list
    #[arg(long, default_value = "*", env = "CORS_ORIGIN")]
    pub cors_origin: String,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn settings(&self) -> GatewaySettings {
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port));
        GatewaySettings::new(&base_url, &self.cors_origin)
    }
}

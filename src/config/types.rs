use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// One backend as declared in the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    #[serde(flatten)]
    pub transport: Transport,
}

/// How a backend is reached. Each variant carries only its own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transport {
    #[serde(alias = "stdio")]
    Process(ProcessConfig),
    #[serde(alias = "http")]
    HttpProxy(HttpProxyConfig),
    #[serde(alias = "sse")]
    SseRelay(SseRelayConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Process,
    HttpProxy,
    SseRelay,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Process => "process",
            TransportKind::HttpProxy => "http-proxy",
            TransportKind::SseRelay => "sse-relay",
        }
    }
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Process(_) => TransportKind::Process,
            Transport::HttpProxy(_) => TransportKind::HttpProxy,
            Transport::SseRelay(_) => TransportKind::SseRelay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl ProcessConfig {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
            timeout_secs: default_timeout(),
            autostart: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseRelayConfig {
    /// Event-stream endpoint.
    pub url: String,
    /// Endpoint for request/response POSTs; defaults to `url`.
    #[serde(default)]
    pub message_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SseRelayConfig {
    pub fn post_url(&self) -> &str {
        self.message_url.as_deref().unwrap_or(&self.url)
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

/// Process-wide settings, fixed after startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Public base URL used to build endpoint strings, without trailing slash.
    pub base_url: String,
    pub cors_origin: String,
}

impl GatewaySettings {
    pub fn new(base_url: &str, cors_origin: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            cors_origin: cors_origin.to_string(),
        }
    }

    pub fn endpoint(&self, id: &str) -> String {
        format!("{}/mcp/{id}", self.base_url)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::new("http://localhost:3000", "*")
    }
}

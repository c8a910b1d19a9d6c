pub mod secrets;
pub mod types;

pub use types::*;

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;

/// Reads and validates the backend document at `path`.
///
/// Files ending in `.json` are parsed as JSON, anything else as TOML.
pub fn load_config(path: &str) -> Result<HubConfig, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {path}"))?;

    let is_json = Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config: HubConfig = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {path}"))?
    } else {
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {path}"))?
    };

    config.validate()?;
    Ok(config)
}

/// Like [`load_config`], but a missing or malformed document yields an empty
/// backend set instead of an error.
pub fn load_config_lenient(path: &str) -> HubConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path,
                error = %format!("{e:#}"),
                "Config load failed, starting with no backends"
            );
            HubConfig::default()
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let mut ids = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() || backend.id.contains('/') {
                anyhow::bail!("Invalid backend id: {:?}", backend.id);
            }
            if !ids.insert(&backend.id) {
                anyhow::bail!("Duplicate backend id: {}", backend.id);
            }

            match &backend.transport {
                Transport::Process(process) => {
                    if process.command.trim().is_empty() {
                        anyhow::bail!(
                            "process backend '{}' must have a non-empty 'command' field",
                            backend.id
                        );
                    }
                }
                Transport::HttpProxy(http) => check_url(&backend.id, &http.url)?,
                Transport::SseRelay(sse) => {
                    check_url(&backend.id, &sse.url)?;
                    if let Some(message_url) = &sse.message_url {
                        check_url(&backend.id, message_url)?;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_url(id: &str, url: &str) -> Result<(), anyhow::Error> {
    let parsed = reqwest::Url::parse(url)
        .with_context(|| format!("backend '{id}' has an invalid url: {url}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("backend '{id}' url must be http or https: {url}");
    }
    Ok(())
}

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ChatRelayError;
use crate::rate_limit::{resolve_presets, PresetOverride, RateLimitPreset};

fn default_web_host() -> String {
    "127.0.0.1".into()
}
fn default_web_port() -> u16 {
    10962
}
fn default_agent_timeout_secs() -> u64 {
    30
}
fn default_stream_deadline_ms() -> u64 {
    120_000
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Upstream agent endpoint speaking newline-delimited JSON.
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Hard cap on one streamed response, measured from session start.
    #[serde(default = "default_stream_deadline_ms")]
    pub stream_deadline_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub rate_limits: HashMap<String, PresetOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_host: default_web_host(),
            web_port: default_web_port(),
            agent_url: None,
            agent_timeout_secs: default_agent_timeout_secs(),
            stream_deadline_ms: default_stream_deadline_ms(),
            log_level: default_log_level(),
            rate_limits: HashMap::new(),
        }
    }
}

impl Config {
    pub fn resolve_config_path() -> Result<Option<PathBuf>, ChatRelayError> {
        if let Ok(custom) = std::env::var("CHATRELAY_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(ChatRelayError::Config(format!(
                "CHATRELAY_CONFIG points to non-existent file: {custom}"
            )));
        }

        if std::path::Path::new("./chatrelay.config.yaml").exists() {
            return Ok(Some(PathBuf::from("./chatrelay.config.yaml")));
        }
        if std::path::Path::new("./chatrelay.config.yml").exists() {
            return Ok(Some(PathBuf::from("./chatrelay.config.yml")));
        }
        Ok(None)
    }

    /// Load config from YAML, falling back to defaults when no file exists.
    pub fn load() -> Result<Self, ChatRelayError> {
        match Self::resolve_config_path()? {
            Some(path) => {
                let path_str = path.to_string_lossy().to_string();
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    ChatRelayError::Config(format!("Failed to read {path_str}: {e}"))
                })?;
                let mut config: Config = serde_yaml::from_str(&content).map_err(|e| {
                    ChatRelayError::Config(format!("Failed to parse {path_str}: {e}"))
                })?;
                config.post_deserialize()?;
                Ok(config)
            }
            None => {
                let mut config = Self::default();
                config.post_deserialize()?;
                Ok(config)
            }
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ChatRelayError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| ChatRelayError::Config(format!("Failed to parse: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    /// Apply post-deserialization normalization and validation.
    pub fn post_deserialize(&mut self) -> Result<(), ChatRelayError> {
        if self.web_host.trim().is_empty() {
            self.web_host = default_web_host();
        }
        if let Some(url) = &self.agent_url {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                self.agent_url = None;
            } else if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
                return Err(ChatRelayError::Config(format!(
                    "agent_url must be an http(s) URL: {trimmed}"
                )));
            } else {
                self.agent_url = Some(trimmed.to_string());
            }
        }
        if self.agent_timeout_secs == 0 {
            self.agent_timeout_secs = default_agent_timeout_secs();
        }
        if self.stream_deadline_ms == 0 {
            self.stream_deadline_ms = default_stream_deadline_ms();
        }
        self.log_level = self.log_level.trim().to_lowercase();
        if self.log_level.is_empty() {
            self.log_level = default_log_level();
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ChatRelayError::Config(format!(
                "Invalid log_level: {}",
                self.log_level
            )));
        }
        self.rate_limit_presets()?;
        Ok(())
    }

    /// Built-in presets with this config's overrides applied.
    pub fn rate_limit_presets(&self) -> Result<Vec<RateLimitPreset>, ChatRelayError> {
        resolve_presets(&self.rate_limits).map_err(ChatRelayError::Config)
    }

    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.web_host, self.web_port)
    }
}

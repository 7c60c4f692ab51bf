use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const CONVERSATION: &str = "conversation";
pub const MESSAGE: &str = "message";
pub const CLAUDE_CHAT: &str = "claude-chat";

const MINUTE_MS: u64 = 60_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: u64,
    #[serde(default)]
    pub rationale: String,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, window_ms: u64, rationale: &str) -> Self {
        Self {
            max_requests,
            window_ms,
            rationale: rationale.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitTier {
    /// Advertised to clients so they can throttle themselves; not enforced.
    Client,
    /// Enforced by the admission middleware.
    Server,
}

/// Both tiers of one feature. The client tier must stay strictly below the
/// server tier so a well-behaved client never sees a 429.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitPreset {
    pub feature: String,
    pub client: Option<RateLimitConfig>,
    pub server: RateLimitConfig,
}

impl RateLimitPreset {
    pub fn tier(&self, tier: RateLimitTier) -> Option<&RateLimitConfig> {
        match tier {
            RateLimitTier::Client => self.client.as_ref(),
            RateLimitTier::Server => Some(&self.server),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let tiers = self
            .client
            .iter()
            .map(|c| ("client", c))
            .chain(std::iter::once(("server", &self.server)));
        for (tier, cfg) in tiers {
            if cfg.max_requests == 0 {
                return Err(format!(
                    "rate_limits.{}.{tier}.max_requests must be > 0",
                    self.feature
                ));
            }
            if cfg.window_ms == 0 {
                return Err(format!(
                    "rate_limits.{}.{tier}.window_ms must be > 0",
                    self.feature
                ));
            }
        }
        if let Some(client) = &self.client {
            if client.max_requests >= self.server.max_requests {
                return Err(format!(
                    "rate_limits.{}: client max_requests ({}) must be below server max_requests ({})",
                    self.feature, client.max_requests, self.server.max_requests
                ));
            }
        }
        Ok(())
    }
}

/// Override for one tier as written in the config file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOverride {
    #[serde(default)]
    pub max_requests: Option<usize>,
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl TierOverride {
    fn apply(&self, base: &mut RateLimitConfig) {
        if let Some(max) = self.max_requests {
            base.max_requests = max;
        }
        if let Some(window) = self.window_ms {
            base.window_ms = window;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetOverride {
    #[serde(default)]
    pub client: Option<TierOverride>,
    #[serde(default)]
    pub server: Option<TierOverride>,
}

pub fn builtin_presets() -> Vec<RateLimitPreset> {
    vec![
        RateLimitPreset {
            feature: CONVERSATION.into(),
            client: Some(RateLimitConfig::new(
                5,
                MINUTE_MS,
                "UI debounce for creating conversations",
            )),
            server: RateLimitConfig::new(
                10,
                MINUTE_MS,
                "caps conversation creation per caller",
            ),
        },
        RateLimitPreset {
            feature: MESSAGE.into(),
            client: Some(RateLimitConfig::new(
                3,
                MINUTE_MS,
                "UI debounce for saving messages",
            )),
            server: RateLimitConfig::new(5, MINUTE_MS, "caps message writes per caller"),
        },
        RateLimitPreset {
            feature: CLAUDE_CHAT.into(),
            client: Some(RateLimitConfig::new(
                5,
                MINUTE_MS,
                "UI throttle for agent turns",
            )),
            server: RateLimitConfig::new(
                10,
                MINUTE_MS,
                "protects the upstream agent service",
            ),
        },
    ]
}

/// Built-in presets with config overrides applied. Overrides for unknown
/// features add a server-only preset when they carry both fields.
pub fn resolve_presets(
    overrides: &HashMap<String, PresetOverride>,
) -> Result<Vec<RateLimitPreset>, String> {
    let mut presets = builtin_presets();
    let mut names = overrides.keys().collect::<Vec<_>>();
    names.sort();
    for name in names {
        let ov = &overrides[name];
        match presets.iter_mut().find(|p| &p.feature == name) {
            Some(preset) => {
                if let Some(server) = &ov.server {
                    server.apply(&mut preset.server);
                }
                if let Some(client) = &ov.client {
                    let window_ms = preset.server.window_ms;
                    let base = preset
                        .client
                        .get_or_insert_with(|| RateLimitConfig::new(0, window_ms, "configured"));
                    client.apply(base);
                }
            }
            None => {
                let server = ov.server.as_ref().ok_or_else(|| {
                    format!("rate_limits.{name}: unknown feature needs a server tier")
                })?;
                let (Some(max_requests), Some(window_ms)) = (server.max_requests, server.window_ms)
                else {
                    return Err(format!(
                        "rate_limits.{name}.server needs max_requests and window_ms"
                    ));
                };
                let mut preset = RateLimitPreset {
                    feature: name.clone(),
                    client: None,
                    server: RateLimitConfig::new(max_requests, window_ms, "configured"),
                };
                if let Some(client) = &ov.client {
                    let mut base = RateLimitConfig::new(0, window_ms, "configured");
                    client.apply(&mut base);
                    preset.client = Some(base);
                }
                presets.push(preset);
            }
        }
    }
    for preset in &presets {
        preset.validate()?;
    }
    Ok(presets)
}

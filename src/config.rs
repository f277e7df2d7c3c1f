// ABOUTME: Bridge configuration resolved from environment variables and the
// ABOUTME: host's plugin-config object; env wins, then plugin keys, then defaults.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Agent ids routed through the engine; empty set means the plugin is
    /// inactive and the hook passes everything through
    pub agents: HashSet<String>,
    pub redis_url: String,
    /// Inbound rendezvous timeout in seconds
    pub timeout_seconds: u64,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Content publisher endpoint; `None` disables oversize publishing
    pub publisher_url: Option<String>,
    pub publisher_token: Option<String>,
    /// Public base used to shape published-page links
    pub publisher_public_url: Option<String>,
    pub rate_limit_global_per_hour: usize,
    pub rate_limit_agent_per_hour: usize,
    /// Chat id alerted on rate-limit denials; empty disables alerting
    pub rate_limit_alert_chat_id: String,
    pub rate_limit_alert_channel: String,
    pub rate_limit_alert_cooldown_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl BridgeConfig {
    /// Resolve configuration from the process environment layered over the
    /// host's plugin-config object.
    pub fn resolve(plugin_cfg: &Value) -> Result<Self> {
        let agents = resolve_agents(plugin_cfg);

        let redis_url = lookup(plugin_cfg, "REDIS_URL", "redisUrl")
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let timeout_seconds =
            lookup_number(plugin_cfg, "REDIS_BRIDGE_TIMEOUT_SECONDS", "timeoutSeconds")
                .context("timeoutSeconds is not a valid number")?
                .unwrap_or(120);

        let consumer_group = lookup(plugin_cfg, "REDIS_BRIDGE_CONSUMER_GROUP", "consumerGroup")
            .unwrap_or_else(|| "clawdbot-bridge".to_string());
        let consumer_name = lookup(plugin_cfg, "REDIS_BRIDGE_CONSUMER_NAME", "consumerName")
            .unwrap_or_else(|| format!("clawdbot-{}", std::process::id()));

        let publisher_url = lookup(plugin_cfg, "CONTENT_PUBLISHER_URL", "contentPublisherUrl");
        let publisher_token = lookup(
            plugin_cfg,
            "CONTENT_PUBLISHER_TOKEN",
            "contentPublisherToken",
        );
        let publisher_public_url = lookup(
            plugin_cfg,
            "CONTENT_PUBLISHER_PUBLIC_URL",
            "contentPublisherPublicUrl",
        );

        let rate_limit_global_per_hour = lookup_number(
            plugin_cfg,
            "RATE_LIMIT_GLOBAL_PER_HOUR",
            "rateLimitGlobalPerHour",
        )
        .context("rateLimitGlobalPerHour is not a valid number")?
        .unwrap_or(60) as usize;

        let rate_limit_agent_per_hour = lookup_number(
            plugin_cfg,
            "RATE_LIMIT_AGENT_PER_HOUR",
            "rateLimitAgentPerHour",
        )
        .context("rateLimitAgentPerHour is not a valid number")?
        .unwrap_or(20) as usize;

        let rate_limit_alert_chat_id = lookup(
            plugin_cfg,
            "RATE_LIMIT_ALERT_CHAT_ID",
            "rateLimitAlertChatId",
        )
        .unwrap_or_default();

        let rate_limit_alert_channel = lookup(
            plugin_cfg,
            "RATE_LIMIT_ALERT_CHANNEL",
            "rateLimitAlertChannel",
        )
        .unwrap_or_else(|| "telegram".to_string());

        let rate_limit_alert_cooldown_secs = lookup_number(
            plugin_cfg,
            "RATE_LIMIT_ALERT_COOLDOWN",
            "rateLimitAlertCooldown",
        )
        .context("rateLimitAlertCooldown is not a valid number")?
        .unwrap_or(300);

        let breaker_threshold = lookup_number(
            plugin_cfg,
            "REDIS_BRIDGE_BREAKER_THRESHOLD",
            "breakerThreshold",
        )
        .context("breakerThreshold is not a valid number")?
        .unwrap_or(5) as u32;

        let breaker_cooldown_secs = lookup_number(
            plugin_cfg,
            "REDIS_BRIDGE_BREAKER_COOLDOWN",
            "breakerCooldownSeconds",
        )
        .context("breakerCooldownSeconds is not a valid number")?
        .unwrap_or(15);

        Ok(Self {
            agents,
            redis_url,
            timeout_seconds,
            consumer_group,
            consumer_name,
            publisher_url,
            publisher_token,
            publisher_public_url,
            rate_limit_global_per_hour,
            rate_limit_agent_per_hour,
            rate_limit_alert_chat_id,
            rate_limit_alert_channel,
            rate_limit_alert_cooldown_secs,
            breaker_threshold,
            breaker_cooldown_secs,
        })
    }

    /// Resolve from the environment alone (worker binary).
    pub fn from_env() -> Result<Self> {
        Self::resolve(&Value::Null)
    }

    /// The plugin only intercepts traffic when at least one agent is bridged.
    pub fn is_active(&self) -> bool {
        !self.agents.is_empty()
    }
}

/// Non-empty env value, else non-empty plugin-config string
fn lookup(plugin_cfg: &Value, env_key: &str, cfg_key: &str) -> Option<String> {
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    plugin_cfg
        .get(cfg_key)
        .and_then(value_to_string)
        .filter(|v| !v.is_empty())
}

fn lookup_number(plugin_cfg: &Value, env_key: &str, cfg_key: &str) -> Result<Option<u64>> {
    match lookup(plugin_cfg, env_key, cfg_key) {
        Some(raw) => {
            let parsed = raw
                .parse::<u64>()
                .with_context(|| format!("'{}' is not a number", raw))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The agent set accepts a comma-separated string (env or plugin config) or a
/// JSON array of strings.
fn resolve_agents(plugin_cfg: &Value) -> HashSet<String> {
    if let Ok(raw) = std::env::var("REDIS_BRIDGE_AGENTS") {
        if !raw.trim().is_empty() {
            return split_agents(&raw);
        }
    }
    match plugin_cfg.get("agents") {
        Some(Value::String(raw)) => split_agents(raw),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => HashSet::new(),
    }
}

fn split_agents(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

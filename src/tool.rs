// ABOUTME: The explicitly invocable redis_bridge tool, built per agent by a factory.
// ABOUTME: A thin opt-in RPC path: errors surface to the caller instead of the breaker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::protocol::{response_key, EngineReply, InboundEntry};
use crate::transport::EngineTransport;

/// Sender identity stamped on tool-originated requests
const TOOL_ORIGIN: &str = "proxy";

/// Build the tool for an invoking agent, or `None` when the agent is not
/// bridged and the tool must not be registered.
pub fn bridge_tool(
    agent: &str,
    config: Arc<BridgeConfig>,
    transport: Arc<dyn EngineTransport>,
) -> Option<BridgeTool> {
    if !config.agents.contains(agent) {
        return None;
    }
    Some(BridgeTool {
        agent: agent.to_string(),
        config,
        transport,
    })
}

/// Forwards one message to the engine and waits for the correlated reply.
///
/// Unlike the hook, this path exercises neither the breaker nor the rate
/// limiter: the caller opted in explicitly and should see errors directly.
pub struct BridgeTool {
    agent: String,
    config: Arc<BridgeConfig>,
    transport: Arc<dyn EngineTransport>,
}

impl BridgeTool {
    pub const NAME: &'static str = "redis_bridge";

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    pub fn description(&self) -> &'static str {
        "Relay a message to the external conversational engine and wait for its reply"
    }

    /// JSON schema of the tool parameters, as registered with the host.
    pub fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to forward to the engine",
                }
            },
            "required": ["message"],
        })
    }

    /// Forward `message` and return the engine's reply text.
    pub async fn invoke(&self, message: &str) -> Result<String> {
        if message.trim().is_empty() {
            bail!("message must be a non-empty string");
        }

        let correlation_id = Uuid::new_v4().to_string();
        let entry = InboundEntry {
            correlation_id: correlation_id.clone(),
            message: message.to_string(),
            from: TOOL_ORIGIN.to_string(),
            agent: self.agent.clone(),
            channel: TOOL_ORIGIN.to_string(),
            account_id: String::new(),
            sender_name: None,
            sender_username: None,
            sender_id: None,
            transcript: None,
            session_key: InboundEntry::default_session_key(TOOL_ORIGIN, "", TOOL_ORIGIN),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };

        self.transport
            .append_inbound(&entry.fields())
            .await
            .context("Failed to append inbound entry")?;

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let raw = self
            .transport
            .await_response(&response_key(&correlation_id), timeout)
            .await
            .context("Rendezvous wait failed")?;

        match raw {
            None => bail!(
                "The engine did not respond within {} seconds",
                self.config.timeout_seconds
            ),
            Some(raw) => match EngineReply::parse(&raw) {
                EngineReply::Error(error) => bail!("Engine error: {}", error),
                EngineReply::Text(text) => Ok(text),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockResponse, MockTransport};
    use serde_json::json;

    fn config_with_agents(agents: &[&str]) -> Arc<BridgeConfig> {
        let agents = agents.join(",");
        Arc::new(BridgeConfig::resolve(&json!({ "agents": agents, "timeoutSeconds": 1 })).unwrap())
    }

    #[test]
    fn test_factory_rejects_unbridged_agent() {
        let transport: Arc<dyn EngineTransport> = Arc::new(MockTransport::new());
        let config = config_with_agents(&["eng-1"]);
        assert!(bridge_tool("other", Arc::clone(&config), Arc::clone(&transport)).is_none());
        assert!(bridge_tool("eng-1", config, transport).is_some());
    }

    #[tokio::test]
    async fn test_invoke_returns_engine_text() {
        let mock = MockTransport::new();
        mock.push_response(MockResponse::Value(r#"{"text":"pong"}"#.to_string()));
        let transport: Arc<dyn EngineTransport> = Arc::new(mock.clone());
        let tool = bridge_tool("eng-1", config_with_agents(&["eng-1"]), transport).unwrap();

        let reply = tool.invoke("ping").await.unwrap();
        assert_eq!(reply, "pong");
        assert_eq!(mock.appended_count(), 1);
        assert_eq!(mock.last_field("from").as_deref(), Some("proxy"));
        assert_eq!(mock.last_field("agent").as_deref(), Some("eng-1"));
    }

    #[tokio::test]
    async fn test_invoke_rejects_empty_message() {
        let mock = MockTransport::new();
        let transport: Arc<dyn EngineTransport> = Arc::new(mock.clone());
        let tool = bridge_tool("eng-1", config_with_agents(&["eng-1"]), transport).unwrap();

        assert!(tool.invoke("   ").await.is_err());
        assert_eq!(mock.appended_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_surfaces_timeout() {
        let mock = MockTransport::new();
        mock.push_response(MockResponse::Timeout);
        let transport: Arc<dyn EngineTransport> = Arc::new(mock.clone());
        let tool = bridge_tool("eng-1", config_with_agents(&["eng-1"]), transport).unwrap();

        let err = tool.invoke("ping").await.unwrap_err();
        assert!(err.to_string().contains("did not respond"));
    }

    #[tokio::test]
    async fn test_invoke_surfaces_engine_error() {
        let mock = MockTransport::new();
        mock.push_response(MockResponse::Value(
            r#"{"text":"","error":"boom"}"#.to_string(),
        ));
        let transport: Arc<dyn EngineTransport> = Arc::new(mock.clone());
        let tool = bridge_tool("eng-1", config_with_agents(&["eng-1"]), transport).unwrap();

        let err = tool.invoke("ping").await.unwrap_err();
        assert_eq!(err.to_string(), "Engine error: boom");
    }
}

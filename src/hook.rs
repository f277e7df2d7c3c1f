// ABOUTME: The before_reply hook bridging gateway messages to the engine over Redis.
// ABOUTME: Total by construction: every path, including internal failures, ends in a reply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::config::BridgeConfig;
use crate::delivery::MessageDelivery;
use crate::protocol::{response_key, EngineReply, InboundEntry};
use crate::rate_limit::{AlertConfig, RateLimitAlerter, RateLimitConfig, RateLimiter};
use crate::transport::EngineTransport;

/// Command bodies containing either marker are gateway keep-alives; they are
/// answered locally because the engine has no semantics for them and each
/// forwarded call would incur engine cost.
const HEARTBEAT_MARKERS: [&str; 2] = ["HEARTBEAT_OK", "Read HEARTBEAT.md"];
const HEARTBEAT_REPLY: &str = "HEARTBEAT_OK";

/// Exact wording asserted by downstream gateways; do not reword.
const ENGINE_TIMEOUT_MSG: &str = "The engine did not respond in time. Please try again.";
const ENGINE_UNAVAILABLE_MSG: &str =
    "⚠️ Le moteur est temporairement indisponible. Réessayez dans quelques instants.";
const CONNECTION_LOST_MSG: &str = "⚠️ Connexion au moteur perdue. Réessayez dans un instant.";
const ENGINE_ERROR_MSG: &str = "⚠️ Le moteur a rencontré une erreur. Réessayez.";

/// A chat message as handed to the hook by the gateway host.
#[derive(Debug, Clone, Default)]
pub struct ChatEvent {
    pub from: String,
    pub agent: String,
    pub channel: String,
    pub account_id: String,
    /// The user's command body
    pub body: String,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    pub sender_id: Option<String>,
    pub transcript: Option<String>,
    /// Host-supplied conversation identity, when present
    pub session_key: Option<String>,
}

/// Reply returned to the host to short-circuit its built-in model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub is_error: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// The inbound bridge hook, registered for the host's `before_reply` event.
///
/// An unhandled error here would make the host fall back silently to its
/// built-in model and hallucinate tool results, so `before_reply` never
/// propagates anything: each failure mode is translated into an error reply
/// and recorded against the circuit breaker.
pub struct BridgeHook {
    config: Arc<BridgeConfig>,
    transport: Arc<dyn EngineTransport>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    alerter: Arc<RateLimitAlerter>,
}

impl BridgeHook {
    pub fn new(
        config: Arc<BridgeConfig>,
        transport: Arc<dyn EngineTransport>,
        alert_delivery: Arc<dyn MessageDelivery>,
    ) -> Self {
        let breaker = CircuitBreaker::new(BreakerConfig {
            threshold: config.breaker_threshold,
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
        });
        let limiter = RateLimiter::new(RateLimitConfig {
            global_per_hour: config.rate_limit_global_per_hour,
            agent_per_hour: config.rate_limit_agent_per_hour,
        });
        let alerter = Arc::new(RateLimitAlerter::new(
            AlertConfig {
                chat_id: config.rate_limit_alert_chat_id.clone(),
                channel: config.rate_limit_alert_channel.clone(),
                cooldown: Duration::from_secs(config.rate_limit_alert_cooldown_secs),
            },
            alert_delivery,
        ));
        Self {
            config,
            transport,
            breaker,
            limiter,
            alerter,
        }
    }

    /// Handle one gateway message. `None` passes the message through to the
    /// host; `Some(reply)` short-circuits it.
    pub async fn before_reply(&self, event: &ChatEvent) -> Option<Reply> {
        if !self.config.agents.contains(&event.agent) {
            return None;
        }
        Some(self.bridged_reply(event).await)
    }

    /// Current breaker state, exposed for diagnostics.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current rate-limiter snapshot, exposed for diagnostics.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn bridged_reply(&self, event: &ChatEvent) -> Reply {
        if is_heartbeat(&event.body) {
            tracing::debug!(agent = %event.agent, "Answering gateway heartbeat locally");
            return Reply::text(HEARTBEAT_REPLY);
        }

        if let Some(denied) = self.limiter.check(&event.agent) {
            tracing::warn!(agent = %event.agent, "Request denied by rate limiter");
            let alerter = Arc::clone(&self.alerter);
            let reason = denied.clone();
            let agent = event.agent.clone();
            // Fire-and-forget: alerting must never delay or fail the reply
            tokio::spawn(async move {
                alerter.alert(&reason, &agent).await;
            });
            return Reply::error(denied);
        }
        self.limiter.record(&event.agent);

        match self.breaker.state() {
            BreakerState::Open => {
                tracing::warn!(agent = %event.agent, "Circuit open, rejecting request");
                return Reply::error(ENGINE_UNAVAILABLE_MSG);
            }
            BreakerState::HalfOpen => {
                tracing::info!(agent = %event.agent, "Circuit half-open, letting a probe request through");
            }
            BreakerState::Closed => {}
        }

        if !self.transport.ensure_connected().await {
            self.breaker.record_failure();
            tracing::error!(agent = %event.agent, "Broker unreachable after repair attempt");
            return Reply::error(CONNECTION_LOST_MSG);
        }

        let correlation_id = Uuid::new_v4().to_string();
        match self.relay(event, &correlation_id).await {
            Ok(reply) => reply,
            Err(e) => {
                self.breaker.record_failure();
                tracing::error!(
                    correlation_id = %correlation_id,
                    agent = %event.agent,
                    error = %e,
                    "Bridge request failed"
                );
                Reply::error(ENGINE_ERROR_MSG)
            }
        }
    }

    /// Correlated request/response exchange: append the inbound entry, then
    /// block on the rendezvous key for the engine's reply.
    async fn relay(&self, event: &ChatEvent, correlation_id: &str) -> Result<Reply> {
        let entry = inbound_entry(event, correlation_id);
        let key = response_key(correlation_id);

        self.transport
            .append_inbound(&entry.fields())
            .await
            .context("Failed to append inbound entry")?;
        tracing::debug!(
            correlation_id = %correlation_id,
            agent = %event.agent,
            "Request forwarded to engine"
        );

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let Some(raw) = self
            .transport
            .await_response(&key, timeout)
            .await
            .context("Rendezvous wait failed")?
        else {
            self.breaker.record_failure();
            tracing::warn!(
                correlation_id = %correlation_id,
                timeout_secs = self.config.timeout_seconds,
                "Engine response timed out"
            );
            return Ok(Reply::error(ENGINE_TIMEOUT_MSG));
        };

        match EngineReply::parse(&raw) {
            EngineReply::Error(error) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    error = %error,
                    "Engine returned an error"
                );
                Ok(Reply::error(format!("Engine error: {}", error)))
            }
            EngineReply::Text(text) => {
                self.breaker.record_success();
                Ok(Reply::text(text))
            }
        }
    }
}

fn is_heartbeat(body: &str) -> bool {
    HEARTBEAT_MARKERS.iter().any(|marker| body.contains(marker))
}

fn inbound_entry(event: &ChatEvent, correlation_id: &str) -> InboundEntry {
    let session_key = event.session_key.clone().unwrap_or_else(|| {
        InboundEntry::default_session_key(&event.channel, &event.account_id, &event.from)
    });
    InboundEntry {
        correlation_id: correlation_id.to_string(),
        message: event.body.clone(),
        from: event.from.clone(),
        agent: event.agent.clone(),
        channel: event.channel.clone(),
        account_id: event.account_id.clone(),
        sender_name: event.sender_name.clone(),
        sender_username: event.sender_username.clone(),
        sender_id: event.sender_id.clone(),
        transcript: event.transcript.clone(),
        session_key,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    }
}

// =============================================================================
// Tests
// =============================================================================

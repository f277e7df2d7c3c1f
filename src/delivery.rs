// ABOUTME: Delivery of outbound chunks through the gateway's CLI child process.
// ABOUTME: Probes for the openclaw binary with a clawdbot fallback; mock included for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Preferred delivery binary, probed at startup
const PRIMARY_BINARY: &str = "openclaw";
/// Fallback when the probe fails
const FALLBACK_BINARY: &str = "clawdbot";
/// Probe timeout for `--version`
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-invocation delivery timeout
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for delivering one message chunk to an end user.
/// Abstracts the gateway CLI so the worker and alerter are testable.
#[async_trait]
pub trait MessageDelivery: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        message: &str,
        account_id: Option<&str>,
    ) -> Result<()>;
}

// =============================================================================
// CLI Implementation
// =============================================================================

/// Delivers messages by spawning the gateway CLI.
pub struct CliDelivery {
    binary: String,
}

impl CliDelivery {
    /// Resolve the delivery binary: `openclaw` if `--version` succeeds within
    /// the probe timeout, else `clawdbot`.
    pub async fn resolve() -> Self {
        let probe = Command::new(PRIMARY_BINARY).arg("--version").output();
        let binary = match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => PRIMARY_BINARY,
            _ => {
                tracing::info!(
                    fallback = FALLBACK_BINARY,
                    "openclaw probe failed, using fallback delivery binary"
                );
                FALLBACK_BINARY
            }
        };
        tracing::debug!(binary, "Resolved delivery CLI");
        Self {
            binary: binary.to_string(),
        }
    }

    /// Use an explicit binary, skipping the probe.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl MessageDelivery for CliDelivery {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        message: &str,
        account_id: Option<&str>,
    ) -> Result<()> {
        let mut args = vec![
            "message", "send", "--channel", channel, "--target", target, "--message", message,
        ];
        if let Some(account) = account_id {
            args.extend(["--account", account]);
        }

        tracing::debug!(
            binary = %self.binary,
            channel,
            target,
            message_len = message.len(),
            "Spawning delivery CLI"
        );

        let output = tokio::time::timeout(
            SEND_TIMEOUT,
            Command::new(&self.binary).args(&args).output(),
        )
        .await
        .with_context(|| format!("{} timed out delivering to {}", self.binary, target))?
        .with_context(|| format!("Failed to spawn {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with code {:?}: {}",
                self.binary,
                output.status.code(),
                stderr.trim()
            );
        }

        Ok(())
    }
}

// =============================================================================
// Mock Implementation for Testing
// =============================================================================

/// A message captured by `MockDelivery`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: String,
    pub target: String,
    pub message: String,
    pub account_id: Option<String>,
}

/// Mock delivery that records sends instead of spawning a process.
#[derive(Default, Clone)]
pub struct MockDelivery {
    pub sent: Arc<Mutex<Vec<SentMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<SentMessage> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageDelivery for MockDelivery {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        message: &str,
        account_id: Option<&str>,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("mock delivery failure");
        }
        self.sent.lock().unwrap().push(SentMessage {
            channel: channel.to_string(),
            target: target.to_string(),
            message: message.to_string(),
            account_id: account_id.map(String::from),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_delivery_records_sends() {
        let delivery = MockDelivery::new();
        delivery
            .send("telegram", "12345", "hello", Some("acct"))
            .await
            .unwrap();

        assert_eq!(delivery.count(), 1);
        let sent = delivery.last().unwrap();
        assert_eq!(sent.channel, "telegram");
        assert_eq!(sent.target, "12345");
        assert_eq!(sent.message, "hello");
        assert_eq!(sent.account_id.as_deref(), Some("acct"));
    }

    #[tokio::test]
    async fn test_mock_delivery_failure_injection() {
        let delivery = MockDelivery::new();
        delivery.set_failing(true);
        assert!(delivery.send("telegram", "1", "x", None).await.is_err());
        assert_eq!(delivery.count(), 0);

        delivery.set_failing(false);
        assert!(delivery.send("telegram", "1", "x", None).await.is_ok());
        assert_eq!(delivery.count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_when_probe_fails() {
        // openclaw is not installed in the test environment, so the probe
        // errors immediately and the fallback binary is selected.
        let delivery = CliDelivery::resolve().await;
        assert_eq!(delivery.binary(), FALLBACK_BINARY);
    }

    #[tokio::test]
    async fn test_cli_delivery_spawn_failure_is_error() {
        let delivery = CliDelivery::with_binary("definitely-not-a-real-binary");
        let err = delivery
            .send("telegram", "1", "hello", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}

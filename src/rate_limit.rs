// ABOUTME: Sliding-window rate limiting for bridged requests, global and per agent.
// ABOUTME: Includes the cooldown-limited, fire-and-forget operator alerter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::delivery::MessageDelivery;

/// Window length for both the global and per-agent counters
const WINDOW: Duration = Duration::from_secs(3600);

/// Limiter tuning knobs
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_per_hour: usize,
    pub agent_per_hour: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_hour: 60,
            agent_per_hour: 20,
        }
    }
}

/// Snapshot of current window sizes, agents with zero requests omitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateStats {
    pub global_count: usize,
    pub per_agent: HashMap<String, usize>,
}

#[derive(Default)]
struct Windows {
    global: VecDeque<Instant>,
    per_agent: HashMap<String, VecDeque<Instant>>,
}

impl Windows {
    fn prune(&mut self, agent_id: &str, now: Instant, window: Duration) {
        let cutoff = |stamp: &Instant| now.duration_since(*stamp) < window;
        self.global.retain(cutoff);
        if let Some(agent_window) = self.per_agent.get_mut(agent_id) {
            agent_window.retain(cutoff);
        }
    }
}

/// Sliding 1-hour rate limiter.
///
/// `check` must be consulted before `record`; denied requests are never
/// recorded. Call sites run the pair back to back for a single inbound
/// request, so no request can slip between its own check and record.
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: WINDOW,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Returns `None` when the request is allowed, or the user-facing denial
    /// message. The agent window is consulted before the global one.
    pub fn check(&self, agent_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.prune(agent_id, now, self.window);

        let agent_count = windows
            .per_agent
            .get(agent_id)
            .map(VecDeque::len)
            .unwrap_or(0);
        if agent_count >= self.config.agent_per_hour {
            return Some(format!(
                "⏳ Limite de débit atteinte pour l'agent {} ({} requêtes/heure). Réessayez dans quelques minutes.",
                agent_id, self.config.agent_per_hour
            ));
        }

        if windows.global.len() >= self.config.global_per_hour {
            return Some(format!(
                "⏳ Limite de débit globale atteinte ({} requêtes/heure). Réessayez plus tard.",
                self.config.global_per_hour
            ));
        }

        None
    }

    /// Charge one request to both windows. Only call after a successful
    /// `check`.
    pub fn record(&self, agent_id: &str) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.global.push_back(now);
        windows
            .per_agent
            .entry(agent_id.to_string())
            .or_default()
            .push_back(now);
    }

    pub fn stats(&self) -> RateStats {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let cutoff = |stamp: &Instant| now.duration_since(*stamp) < self.window;
        windows.global.retain(cutoff);

        let mut per_agent = HashMap::new();
        for (agent, window) in windows.per_agent.iter_mut() {
            window.retain(cutoff);
            if !window.is_empty() {
                per_agent.insert(agent.clone(), window.len());
            }
        }

        RateStats {
            global_count: windows.global.len(),
            per_agent,
        }
    }
}

// =============================================================================
// Operator alerting
// =============================================================================

/// Alerter tuning knobs. An empty chat id disables alerting entirely.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub chat_id: String,
    pub channel: String,
    pub cooldown: Duration,
}

/// Best-effort operator alerting when the limiter denies requests.
///
/// Alerts ride the same delivery CLI as outbound messages and are themselves
/// rate-limited by `cooldown`. Failures are logged, never raised; callers
/// spawn `alert` and do not await it on the hot path.
pub struct RateLimitAlerter {
    config: AlertConfig,
    delivery: Arc<dyn MessageDelivery>,
    last_alert: Mutex<Option<Instant>>,
}

impl RateLimitAlerter {
    pub fn new(config: AlertConfig, delivery: Arc<dyn MessageDelivery>) -> Self {
        Self {
            config,
            delivery,
            last_alert: Mutex::new(None),
        }
    }

    pub async fn alert(&self, reason: &str, agent_id: &str) {
        if self.config.chat_id.is_empty() {
            return;
        }

        {
            let mut last_alert = self.last_alert.lock().unwrap();
            if let Some(last) = *last_alert {
                if last.elapsed() < self.config.cooldown {
                    tracing::debug!(agent = agent_id, "Rate-limit alert suppressed by cooldown");
                    return;
                }
            }
            // Stamp before sending so concurrent denials cannot alert twice
            *last_alert = Some(Instant::now());
        }

        let message = format!(
            "🚨 Limite de débit déclenchée (agent {})\n{}",
            agent_id, reason
        );
        if let Err(e) = self
            .delivery
            .send(&self.config.channel, &self.config.chat_id, &message, None)
            .await
        {
            tracing::warn!(error = %e, "Rate-limit alert delivery failed");
        } else {
            tracing::info!(agent = agent_id, "Rate-limit alert sent");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MockDelivery;

    fn limiter(global: usize, agent: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            global_per_hour: global,
            agent_per_hour: agent,
        })
    }

    #[test]
    fn test_allows_under_both_limits() {
        let limiter = limiter(10, 5);
        assert!(limiter.check("eng-1").is_none());
        limiter.record("eng-1");
        assert!(limiter.check("eng-1").is_none());
    }

    #[test]
    fn test_agent_limit_denies_and_names_agent() {
        let limiter = limiter(100, 2);
        for _ in 0..2 {
            assert!(limiter.check("eng-1").is_none());
            limiter.record("eng-1");
        }
        let denial = limiter.check("eng-1").unwrap();
        assert!(denial.contains("eng-1"));

        // Another agent is still within its own window
        assert!(limiter.check("eng-2").is_none());
    }

    #[test]
    fn test_global_limit_denies_across_agents() {
        let limiter = limiter(3, 100);
        for agent in ["a", "b", "c"] {
            assert!(limiter.check(agent).is_none());
            limiter.record(agent);
        }
        let denial = limiter.check("d").unwrap();
        assert!(denial.contains("globale"));
    }

    #[test]
    fn test_agent_limit_checked_before_global() {
        let limiter = limiter(1, 1);
        limiter.record("eng-1");
        // Both limits are saturated; the agent message wins
        let denial = limiter.check("eng-1").unwrap();
        assert!(denial.contains("eng-1"));
    }

    #[test]
    fn test_expired_entries_are_pruned() {
        let limiter = RateLimiter {
            config: RateLimitConfig {
                global_per_hour: 1,
                agent_per_hour: 1,
            },
            window: Duration::from_millis(30),
            windows: Mutex::new(Windows::default()),
        };

        limiter.record("eng-1");
        assert!(limiter.check("eng-1").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check("eng-1").is_none());
        assert_eq!(limiter.stats().global_count, 0);
    }

    #[test]
    fn test_denied_requests_not_recorded() {
        let limiter = limiter(100, 1);
        limiter.record("eng-1");
        assert!(limiter.check("eng-1").is_some());
        assert!(limiter.check("eng-1").is_some());

        let stats = limiter.stats();
        assert_eq!(stats.global_count, 1);
        assert_eq!(stats.per_agent.get("eng-1"), Some(&1));
    }

    #[test]
    fn test_stats_omits_idle_agents() {
        let limiter = limiter(100, 10);
        limiter.record("eng-1");
        limiter.record("eng-1");
        limiter.record("eng-2");

        let stats = limiter.stats();
        assert_eq!(stats.global_count, 3);
        assert_eq!(stats.per_agent.len(), 2);
        assert_eq!(stats.per_agent.get("eng-1"), Some(&2));
        assert!(!stats.per_agent.contains_key("eng-3"));
    }

    #[tokio::test]
    async fn test_alerter_sends_to_configured_chat() {
        let delivery = MockDelivery::new();
        let alerter = RateLimitAlerter::new(
            AlertConfig {
                chat_id: "ops-chat".to_string(),
                channel: "telegram".to_string(),
                cooldown: Duration::from_secs(300),
            },
            Arc::new(delivery.clone()),
        );

        alerter.alert("limite globale", "eng-1").await;

        assert_eq!(delivery.count(), 1);
        let sent = delivery.last().unwrap();
        assert_eq!(sent.target, "ops-chat");
        assert_eq!(sent.channel, "telegram");
        assert!(sent.message.contains("eng-1"));
    }

    #[tokio::test]
    async fn test_alerter_cooldown_suppresses_repeat() {
        let delivery = MockDelivery::new();
        let alerter = RateLimitAlerter::new(
            AlertConfig {
                chat_id: "ops-chat".to_string(),
                channel: "telegram".to_string(),
                cooldown: Duration::from_secs(300),
            },
            Arc::new(delivery.clone()),
        );

        alerter.alert("first", "eng-1").await;
        alerter.alert("second", "eng-1").await;

        assert_eq!(delivery.count(), 1);
    }

    #[tokio::test]
    async fn test_alerter_disabled_without_chat_id() {
        let delivery = MockDelivery::new();
        let alerter = RateLimitAlerter::new(
            AlertConfig {
                chat_id: String::new(),
                channel: "telegram".to_string(),
                cooldown: Duration::from_secs(300),
            },
            Arc::new(delivery.clone()),
        );

        alerter.alert("limite", "eng-1").await;
        assert_eq!(delivery.count(), 0);
    }

    #[tokio::test]
    async fn test_alerter_delivery_failure_is_swallowed() {
        let delivery = MockDelivery::new();
        delivery.set_failing(true);
        let alerter = RateLimitAlerter::new(
            AlertConfig {
                chat_id: "ops-chat".to_string(),
                channel: "telegram".to_string(),
                cooldown: Duration::from_secs(300),
            },
            Arc::new(delivery.clone()),
        );

        // Must not panic or propagate
        alerter.alert("limite", "eng-1").await;
        assert_eq!(delivery.count(), 0);
    }
}

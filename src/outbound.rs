// ABOUTME: Outbound delivery worker consuming the engine's stream via a consumer group.
// ABOUTME: Delivers entries through the gateway CLI with ack/retry/dead-letter semantics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::watch;

use crate::delivery::MessageDelivery;
use crate::protocol::OutboundEntry;
use crate::publisher::ContentPublisher;
use crate::splitter::{split_message, MAX_MSG_LEN, PUBLISH_THRESHOLD};
use crate::transport::{StreamEntry, StreamSource};

/// Entries redelivered more than this many times are dead-lettered
const DEAD_LETTER_MAX_DELIVERIES: u64 = 5;
/// Flat delay after a transient read or processing error
const INNER_RETRY_DELAY: Duration = Duration::from_secs(3);
/// Starting delay for poll-loop restarts
const OUTER_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Ceiling for poll-loop restart backoff
const OUTER_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Consecutive read failures that terminate the poll loop and escalate to the
/// restart backoff
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 5;

/// Multiply a delay by (0.5 + rand·0.5) so multiple instances never retry in
/// lock-step against the broker.
fn jittered(base: Duration) -> Duration {
    let factor = 0.5 + rand::thread_rng().gen_range(0.0..0.5);
    base.mul_f64(factor)
}

/// Consumes the outbound stream and fans entries out to end users.
///
/// Delivery is at-least-once: an entry is acknowledged only after every chunk
/// was delivered, and an entry redelivered past the cap is dead-lettered so a
/// poisoned message cannot stall the stream forever.
pub struct OutboundWorker {
    source: Arc<dyn StreamSource>,
    delivery: Arc<dyn MessageDelivery>,
    publisher: Option<Arc<ContentPublisher>>,
    stop_rx: watch::Receiver<bool>,
}

impl OutboundWorker {
    pub fn new(
        source: Arc<dyn StreamSource>,
        delivery: Arc<dyn MessageDelivery>,
        publisher: Option<Arc<ContentPublisher>>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            delivery,
            publisher,
            stop_rx,
        }
    }

    /// Run until the stop signal fires. The poll loop handles transient
    /// errors itself; if it terminates anyway, it is restarted with jittered
    /// exponential backoff.
    pub async fn run(mut self) {
        tracing::info!("Outbound delivery worker started");
        let mut backoff = OUTER_BACKOFF_INITIAL;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            match self.poll_loop(&mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    let delay = jittered(backoff);
                    tracing::error!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Outbound poll loop terminated, restarting after backoff"
                    );
                    backoff = std::cmp::min(backoff * 2, OUTER_BACKOFF_MAX);
                    if self.sleep_or_stop(delay).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("Outbound delivery worker stopped");
    }

    /// Inner loop: blocking group read, then per-entry processing. Transient
    /// errors are logged and retried after a flat jittered delay; persistent
    /// read failure escalates to the caller. Returns `Ok` only on stop.
    async fn poll_loop(&mut self, backoff: &mut Duration) -> Result<()> {
        let mut consecutive_read_failures = 0u32;

        loop {
            if *self.stop_rx.borrow() {
                return Ok(());
            }

            let source = Arc::clone(&self.source);
            let batch = tokio::select! {
                result = source.read_batch() => result,
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        // Stop sender dropped; treat as shutdown
                        return Ok(());
                    }
                    continue;
                }
            };

            match batch {
                Ok(entries) => {
                    consecutive_read_failures = 0;
                    *backoff = OUTER_BACKOFF_INITIAL;
                    for entry in entries {
                        if *self.stop_rx.borrow() {
                            return Ok(());
                        }
                        if let Err(e) = self.process_entry(&entry).await {
                            tracing::error!(
                                entry_id = %entry.id,
                                error = %e,
                                "Outbound entry processing failed, leaving unacknowledged"
                            );
                            if self.sleep_or_stop(jittered(INNER_RETRY_DELAY)).await {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_read_failures += 1;
                    tracing::error!(
                        error = %e,
                        failures = consecutive_read_failures,
                        "Outbound stream read failed"
                    );
                    if consecutive_read_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                        return Err(e).context("Outbound stream read failed repeatedly");
                    }
                    if self.sleep_or_stop(jittered(INNER_RETRY_DELAY)).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Process one stream entry.
    ///
    /// Malformed entries and entries past the dead-letter cap are
    /// acknowledged and dropped. A delivery failure leaves the entry
    /// unacknowledged so the broker redelivers it.
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<()> {
        let record = match OutboundEntry::from_fields(&entry.fields) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    entry_id = %entry.id,
                    error = %e,
                    "Discarding malformed outbound entry"
                );
                self.source.ack(&entry.id).await?;
                return Ok(());
            }
        };

        if let Some(deliveries) = self.source.delivery_count(&entry.id).await {
            if deliveries > DEAD_LETTER_MAX_DELIVERIES {
                tracing::error!(
                    entry_id = %entry.id,
                    deliveries,
                    channel = %record.channel,
                    to = %record.to,
                    "Dead-lettering outbound entry after repeated delivery failures"
                );
                self.source.ack(&entry.id).await?;
                return Ok(());
            }
        }

        let mut message = record.message.clone();
        if let Some(publisher) = &self.publisher {
            if message.chars().count() > PUBLISH_THRESHOLD {
                if let Some(summary) = publisher.publish_summary(&message).await {
                    message = summary;
                }
            }
        }

        let chunks = split_message(&message, MAX_MSG_LEN);
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            self.delivery
                .send(
                    &record.channel,
                    &record.to,
                    chunk,
                    record.account_id.as_deref(),
                )
                .await
                .with_context(|| {
                    format!("Chunk {}/{} of entry {} failed", index + 1, total, entry.id)
                })?;
        }

        self.source.ack(&entry.id).await?;
        tracing::debug!(
            entry_id = %entry.id,
            channel = %record.channel,
            to = %record.to,
            chunks = total,
            "Outbound entry delivered"
        );
        Ok(())
    }

    /// Sleep, waking early on the stop signal. Returns true when the worker
    /// should stop.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => *self.stop_rx.borrow(),
            changed = self.stop_rx.changed() => changed.is_err() || *self.stop_rx.borrow(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay < Duration::from_secs(10));
        }
    }
}

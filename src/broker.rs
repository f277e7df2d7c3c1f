// ABOUTME: Redis connection supervision: a normal client for commands and a dedicated
// ABOUTME: client for blocking reads, with PING-derived readiness and single-flight repair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::protocol::{INBOUND_STREAM, OUTBOUND_STREAM};
use crate::transport::{EngineTransport, StreamEntry, StreamSource};

/// How long service start waits for both connections
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Cap on the readiness PING round-trip
const PING_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `ensure_connected` polls for readiness
const RECONNECT_WAIT: Duration = Duration::from_secs(3);
/// Poll interval while waiting for readiness
const RECONNECT_POLL: Duration = Duration::from_millis(200);
/// Batch size for consumer-group reads
const READ_COUNT: usize = 10;
/// Server-side block window for consumer-group reads
const BLOCK_MS: usize = 5000;
/// Client-side slack past a server-side blocking timeout before the socket is
/// presumed dead
const BLOCKING_GRACE: Duration = Duration::from_secs(5);

/// Maintains the two broker connections the bridge needs.
///
/// Blocking commands hold their connection at the server, so a shared client
/// would let one rendezvous pop starve every other command; the blocking
/// connection is reserved for BLPOP and XREADGROUP, the normal one handles
/// appends, acks, group creation, and pending inspection. Neither connection
/// retries commands: a retried blocking read would double-consume.
pub struct BrokerSupervisor {
    client: redis::Client,
    consumer_group: String,
    consumer_name: String,
    normal: Mutex<Option<MultiplexedConnection>>,
    blocking: Mutex<Option<MultiplexedConnection>>,
    reconnect_in_flight: AtomicBool,
}

impl BrokerSupervisor {
    /// Prepare the supervisor. No connection is made until `connect`.
    pub fn new(redis_url: &str, consumer_group: &str, consumer_name: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
        Ok(Self {
            client,
            consumer_group: consumer_group.to_string(),
            consumer_name: consumer_name.to_string(),
            normal: Mutex::new(None),
            blocking: Mutex::new(None),
            reconnect_in_flight: AtomicBool::new(false),
        })
    }

    /// Establish both connections, aborting service start unless both come
    /// up within the shared startup timeout.
    pub async fn connect(&self) -> Result<()> {
        let (normal, blocking) = tokio::time::timeout(STARTUP_TIMEOUT, async {
            tokio::try_join!(
                self.client.get_multiplexed_tokio_connection(),
                self.client.get_multiplexed_tokio_connection(),
            )
        })
        .await
        .context("Timed out waiting for the broker connections")?
        .context("Failed to establish the broker connections")?;

        *self.normal.lock().await = Some(normal);
        *self.blocking.lock().await = Some(blocking);
        tracing::info!("Broker connections established");
        Ok(())
    }

    /// Drop both connections. Shutdown never fails.
    pub async fn close(&self) {
        *self.normal.lock().await = None;
        *self.blocking.lock().await = None;
        tracing::debug!("Broker connections closed");
    }

    async fn normal_conn(&self) -> Result<MultiplexedConnection> {
        self.normal
            .lock()
            .await
            .clone()
            .context("Broker connection not established")
    }

    async fn blocking_conn(&self) -> Result<MultiplexedConnection> {
        self.blocking
            .lock()
            .await
            .clone()
            .context("Blocking broker connection not established")
    }

    /// A blocking command that failed leaves a connection of unknown state;
    /// clearing the slot makes the next readiness probe report false.
    async fn invalidate_blocking(&self) {
        *self.blocking.lock().await = None;
    }

    /// Probe readiness. The answer is derived from a live PING on every call
    /// rather than a cached flag, so silent socket death is observed here.
    /// The blocking connection is not pinged (an in-flight blocked read would
    /// stall the probe); its health is tracked through command failures.
    pub async fn is_ready(&self) -> bool {
        if self.blocking.lock().await.is_none() {
            return false;
        }
        let Some(mut conn) = self.normal.lock().await.clone() else {
            return false;
        };
        let ping = async move {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            redis::RedisResult::Ok(pong)
        };
        matches!(tokio::time::timeout(PING_TIMEOUT, ping).await, Ok(Ok(_)))
    }

    /// Restore connectivity if it is lost. Only one task performs the actual
    /// reconnect; concurrent callers wait for its outcome instead of piling
    /// additional connection attempts onto the broker.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_ready().await {
            return true;
        }

        if self.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            return self.wait_ready(RECONNECT_WAIT).await;
        }

        tracing::warn!("Broker not ready, reconnecting");
        self.reconnect_slot(&self.normal, "normal").await;
        self.reconnect_slot(&self.blocking, "blocking").await;

        let ready = self.wait_ready(RECONNECT_WAIT).await;
        if ready {
            tracing::info!("Broker connection restored");
        } else {
            tracing::error!("Broker reconnect failed");
        }
        self.reconnect_in_flight.store(false, Ordering::SeqCst);
        ready
    }

    async fn reconnect_slot(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
        label: &'static str,
    ) {
        // Connection errors are logged, not raised; the readiness poll that
        // follows decides the overall outcome.
        match tokio::time::timeout(
            RECONNECT_WAIT,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                *slot.lock().await = Some(conn);
                tracing::debug!(client = label, "Broker client reconnected");
            }
            Ok(Err(e)) => {
                tracing::warn!(client = label, error = %e, "Broker client reconnect failed")
            }
            Err(_) => {
                tracing::warn!(client = label, "Broker client reconnect timed out")
            }
        }
    }

    async fn wait_ready(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.is_ready().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RECONNECT_POLL).await;
        }
    }

    /// Append a flat entry to `stream`, returning the assigned id.
    pub async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.normal_conn().await?;
        let id: String = conn
            .xadd(stream, "*", fields)
            .await
            .with_context(|| format!("XADD to {} failed", stream))?;
        Ok(id)
    }

    /// Blocking pop of one list element, `Ok(None)` on timeout. The timeout
    /// is enforced server-side; a grace deadline on top catches a dead socket
    /// that will never answer.
    pub async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.blocking_conn().await?;
        let key_owned = key.to_string();
        let pop = async move {
            conn.blpop::<_, Option<(String, String)>>(&key_owned, timeout.as_secs_f64())
                .await
        };

        match tokio::time::timeout(timeout + BLOCKING_GRACE, pop).await {
            Ok(Ok(popped)) => Ok(popped.map(|(_, value)| value)),
            Ok(Err(e)) => {
                self.invalidate_blocking().await;
                Err(e).with_context(|| format!("BLPOP on {} failed", key))
            }
            Err(_) => {
                self.invalidate_blocking().await;
                bail!("BLPOP on {} exceeded the client-side deadline", key);
            }
        }
    }

    /// Create the outbound consumer group at stream offset 0, creating the
    /// stream as needed. An already-existing group is not an error.
    pub async fn create_group(&self) -> Result<()> {
        let mut conn = self.normal_conn().await?;
        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(OUTBOUND_STREAM, &self.consumer_group, "0")
            .await;
        match created {
            Ok(_) => {
                tracing::info!(group = %self.consumer_group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!(group = %self.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to create consumer group"),
        }
    }

    /// Blocking consumer-group read of new entries (cursor `>`).
    pub async fn read_group(&self) -> Result<Vec<StreamEntry>> {
        let mut conn = self.blocking_conn().await?;
        let options = StreamReadOptions::default()
            .group(&self.consumer_group, &self.consumer_name)
            .count(READ_COUNT)
            .block(BLOCK_MS);
        let read = async move {
            conn.xread_options::<_, _, StreamReadReply>(&[OUTBOUND_STREAM], &[">"], &options)
                .await
        };

        let block = Duration::from_millis(BLOCK_MS as u64);
        let reply = match tokio::time::timeout(block + BLOCKING_GRACE, read).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.invalidate_blocking().await;
                return Err(e).context("XREADGROUP on the outbound stream failed");
            }
            Err(_) => {
                self.invalidate_blocking().await;
                bail!("XREADGROUP exceeded the client-side deadline");
            }
        };

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for stream_id in stream_key.ids {
                let mut fields = HashMap::new();
                for (name, value) in &stream_id.map {
                    match redis::from_redis_value::<String>(value) {
                        Ok(text) => {
                            fields.insert(name.clone(), text);
                        }
                        Err(_) => {
                            tracing::debug!(
                                entry_id = %stream_id.id,
                                field = %name,
                                "Skipping non-string stream field"
                            );
                        }
                    }
                }
                entries.push(StreamEntry {
                    id: stream_id.id,
                    fields,
                });
            }
        }
        Ok(entries)
    }

    /// Acknowledge one entry in the outbound consumer group.
    pub async fn ack_entry(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.normal_conn().await?;
        let _: i64 = conn
            .xack(OUTBOUND_STREAM, &self.consumer_group, &[entry_id])
            .await
            .with_context(|| format!("XACK for {} failed", entry_id))?;
        Ok(())
    }

    /// Delivery count for one pending entry, using the entry id as both range
    /// bounds. Best-effort: any inspection error yields `None` and the caller
    /// proceeds to delivery.
    pub async fn pending_delivery_count(&self, entry_id: &str) -> Option<u64> {
        let mut conn = self.normal_conn().await.ok()?;
        let reply: StreamPendingCountReply = match conn
            .xpending_count(OUTBOUND_STREAM, &self.consumer_group, entry_id, entry_id, 1)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(entry_id, error = %e, "Pending inspection failed");
                return None;
            }
        };
        reply
            .ids
            .first()
            .map(|pending| pending.times_delivered as u64)
    }
}

#[async_trait]
impl EngineTransport for BrokerSupervisor {
    async fn is_ready(&self) -> bool {
        BrokerSupervisor::is_ready(self).await
    }

    async fn ensure_connected(&self) -> bool {
        BrokerSupervisor::ensure_connected(self).await
    }

    async fn append_inbound(&self, fields: &[(String, String)]) -> Result<String> {
        self.append(INBOUND_STREAM, fields).await
    }

    async fn await_response(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        self.blocking_pop(key, timeout).await
    }
}

#[async_trait]
impl StreamSource for BrokerSupervisor {
    async fn create_group(&self) -> Result<()> {
        BrokerSupervisor::create_group(self).await
    }

    async fn read_batch(&self) -> Result<Vec<StreamEntry>> {
        self.read_group().await
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        self.ack_entry(entry_id).await
    }

    async fn delivery_count(&self, entry_id: &str) -> Option<u64> {
        self.pending_delivery_count(entry_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(BrokerSupervisor::new("not a url", "group", "consumer").is_err());
    }

    #[tokio::test]
    async fn test_not_ready_before_connect() {
        let supervisor =
            BrokerSupervisor::new("redis://localhost:6379", "group", "consumer").unwrap();
        assert!(!supervisor.is_ready().await);
    }

    #[tokio::test]
    async fn test_commands_fail_before_connect() {
        let supervisor =
            BrokerSupervisor::new("redis://localhost:6379", "group", "consumer").unwrap();
        let err = supervisor
            .append(INBOUND_STREAM, &[("k".to_string(), "v".to_string())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not established"));
    }
}

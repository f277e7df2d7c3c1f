// ABOUTME: Traits for abstracting broker operations behind the hook and the worker.
// ABOUTME: Enables testing both bridge directions without a live Redis connection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Request-side broker operations used by the inbound hook and the tool.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Whether the broker can serve commands right now. Re-derived on every
    /// call, never a cached flag.
    async fn is_ready(&self) -> bool;

    /// Attempt to restore connectivity; returns the resulting readiness.
    async fn ensure_connected(&self) -> bool;

    /// Append a flat field/value entry to the inbound stream, returning the
    /// broker-assigned entry id.
    async fn append_inbound(&self, fields: &[(String, String)]) -> Result<String>;

    /// Block until the engine pushes a value onto `key`, up to `timeout`.
    /// `Ok(None)` means the wait timed out.
    async fn await_response(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
}

/// One entry delivered from the outbound stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Consumer-group operations used by the outbound worker.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Create the consumer group, tolerating an already-existing group.
    async fn create_group(&self) -> Result<()>;

    /// Blocking read of the next batch of new entries for this consumer.
    /// An empty batch means the block window expired.
    async fn read_batch(&self) -> Result<Vec<StreamEntry>>;

    /// Acknowledge one processed entry.
    async fn ack(&self, entry_id: &str) -> Result<()>;

    /// How many times the broker has delivered this entry, when the pending
    /// list can be inspected. Best-effort: `None` when unknown.
    async fn delivery_count(&self, entry_id: &str) -> Option<u64>;
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

/// Canned rendezvous outcome for `MockTransport::await_response`
#[derive(Debug, Clone)]
pub enum MockResponse {
    Value(String),
    Timeout,
    Error(String),
}

/// In-memory transport capturing appends and replaying canned responses.
#[derive(Default, Clone)]
pub struct MockTransport {
    ready: Arc<AtomicBool>,
    fail_append: Arc<AtomicBool>,
    pub appended: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.ready.store(true, Ordering::SeqCst);
        transport
    }

    /// Toggle readiness; `ensure_connected` reports the same value.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make the next `append_inbound` calls fail.
    pub fn set_append_failing(&self, failing: bool) {
        self.fail_append.store(failing, Ordering::SeqCst);
    }

    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn appended(&self) -> Vec<Vec<(String, String)>> {
        self.appended.lock().unwrap().clone()
    }

    pub fn appended_count(&self) -> usize {
        self.appended.lock().unwrap().len()
    }

    /// Value of `field` in the most recent appended entry
    pub fn last_field(&self, field: &str) -> Option<String> {
        self.appended
            .lock()
            .unwrap()
            .last()
            .and_then(|fields| fields.iter().find(|(k, _)| k == field))
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl EngineTransport for MockTransport {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn append_inbound(&self, fields: &[(String, String)]) -> Result<String> {
        if self.fail_append.load(Ordering::SeqCst) {
            bail!("mock append failure");
        }
        let mut appended = self.appended.lock().unwrap();
        appended.push(fields.to_vec());
        Ok(format!("0-{}", appended.len()))
    }

    async fn await_response(&self, _key: &str, _timeout: Duration) -> Result<Option<String>> {
        match self.responses.lock().unwrap().pop_front() {
            Some(MockResponse::Value(value)) => Ok(Some(value)),
            Some(MockResponse::Timeout) | None => Ok(None),
            Some(MockResponse::Error(message)) => bail!("{}", message),
        }
    }
}

/// In-memory stream source feeding queued entries and recording acks.
#[derive(Default, Clone)]
pub struct MockStreamSource {
    entries: Arc<Mutex<VecDeque<StreamEntry>>>,
    pub acked: Arc<Mutex<Vec<String>>>,
    delivery_counts: Arc<Mutex<HashMap<String, u64>>>,
    group_created: Arc<AtomicBool>,
}

impl MockStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_entry(&self, id: &str, fields: &[(&str, &str)]) {
        self.entries.lock().unwrap().push_back(StreamEntry {
            id: id.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    pub fn set_delivery_count(&self, id: &str, count: u64) {
        self.delivery_counts
            .lock()
            .unwrap()
            .insert(id.to_string(), count);
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn group_was_created(&self) -> bool {
        self.group_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn create_group(&self) -> Result<()> {
        self.group_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_batch(&self) -> Result<Vec<StreamEntry>> {
        let drained: Vec<StreamEntry> = self.entries.lock().unwrap().drain(..).collect();
        if drained.is_empty() {
            // Simulate the blocking window expiring without new entries
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(drained)
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        self.acked.lock().unwrap().push(entry_id.to_string());
        Ok(())
    }

    async fn delivery_count(&self, entry_id: &str) -> Option<u64> {
        self.delivery_counts.lock().unwrap().get(entry_id).copied()
    }
}

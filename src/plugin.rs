// ABOUTME: Registration glue wiring config, broker, hook, tool, and worker together.
// ABOUTME: Owns the plugin lifecycle: connect and spawn on start, drain and close on stop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::broker::BrokerSupervisor;
use crate::config::BridgeConfig;
use crate::delivery::{CliDelivery, MessageDelivery};
use crate::hook::BridgeHook;
use crate::outbound::OutboundWorker;
use crate::publisher::ContentPublisher;
use crate::tool::{bridge_tool, BridgeTool};
use crate::transport::{EngineTransport, StreamSource};

/// The assembled bridge plugin.
///
/// The host registers `hook()` for its `before_reply` event and calls
/// `tool()` from its per-agent tool factory; `start()`/`stop()` bracket the
/// background outbound service.
pub struct BridgePlugin {
    config: Arc<BridgeConfig>,
    broker: Arc<BrokerSupervisor>,
    hook: Arc<BridgeHook>,
    delivery: Arc<dyn MessageDelivery>,
    publisher: Option<Arc<ContentPublisher>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BridgePlugin {
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        if !config.is_active() {
            tracing::warn!("No bridged agents configured; the hook will pass everything through");
        }

        let config = Arc::new(config);
        let broker = Arc::new(BrokerSupervisor::new(
            &config.redis_url,
            &config.consumer_group,
            &config.consumer_name,
        )?);
        let delivery: Arc<dyn MessageDelivery> = Arc::new(CliDelivery::resolve().await);
        let publisher = ContentPublisher::from_config(&config)?.map(Arc::new);

        let transport: Arc<dyn EngineTransport> = Arc::clone(&broker) as Arc<dyn EngineTransport>;
        let hook = Arc::new(BridgeHook::new(
            Arc::clone(&config),
            transport,
            Arc::clone(&delivery),
        ));

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            config,
            broker,
            hook,
            delivery,
            publisher,
            stop_tx,
            stop_rx,
            worker_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The before_reply hook to register with the host.
    pub fn hook(&self) -> Arc<BridgeHook> {
        Arc::clone(&self.hook)
    }

    /// Per-agent tool factory: `None` for agents that are not bridged.
    pub fn tool(&self, agent: &str) -> Option<BridgeTool> {
        let transport: Arc<dyn EngineTransport> = Arc::clone(&self.broker) as Arc<dyn EngineTransport>;
        bridge_tool(agent, Arc::clone(&self.config), transport)
    }

    /// Connect the broker, create the consumer group, and spawn the outbound
    /// worker. Fails fast when the broker is unreachable or group creation
    /// reports anything other than an existing group.
    pub async fn start(&self) -> Result<()> {
        self.broker
            .connect()
            .await
            .context("Bridge startup aborted: broker unreachable")?;
        self.broker.create_group().await?;

        let source: Arc<dyn StreamSource> = Arc::clone(&self.broker) as Arc<dyn StreamSource>;
        let worker = OutboundWorker::new(
            source,
            Arc::clone(&self.delivery),
            self.publisher.clone(),
            self.stop_rx.clone(),
        );
        let handle = tokio::spawn(worker.run());
        *self.worker_handle.lock().await = Some(handle);

        tracing::info!(
            agents = self.config.agents.len(),
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "Bridge plugin started"
        );
        Ok(())
    }

    /// Signal the worker, wait for it to drain, and close the broker.
    /// Shutdown never fails.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.worker_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Outbound worker task ended abnormally");
            }
        }
        self.broker.close().await;
        tracing::info!("Bridge plugin stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

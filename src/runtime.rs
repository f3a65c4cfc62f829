//! Module lifecycle: subscribe, consume, publish, graceful shutdown.
//!
//! Every module is one long-lived task. Its `on_iu` hook is dispatched
//! sequentially — never concurrently with itself — and per-topic input
//! order is preserved. All coupling between modules goes through the bus.

use crate::bus::{Bus, Subscription};
use crate::config::RemdisConfig;
use crate::error::Result;
use crate::iu::IncrementalUnit;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Capacity of the per-module merge channel feeding `on_iu`.
const DISPATCH_CHANNEL_SIZE: usize = 8;

/// Hooks implemented by every incremental module.
#[async_trait]
pub trait IncrementalModule: Send + 'static {
    /// Stable module name, used as the IU producer field and in logs.
    fn name(&self) -> &'static str;

    /// Called once before the first IU is dispatched.
    async fn on_start(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        Ok(())
    }

    /// Called sequentially for every IU arriving on a subscribed topic.
    async fn on_iu(&mut self, topic: &str, iu: IncrementalUnit, ctx: &ModuleCtx) -> Result<()>;

    /// Called once after input has drained, before the task exits.
    async fn on_shutdown(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        Ok(())
    }
}

/// Per-module view of the shared runtime: bus access plus the immutable
/// configuration snapshot taken at construction.
#[derive(Clone)]
pub struct ModuleCtx {
    bus: Bus,
    config: Arc<RemdisConfig>,
}

impl ModuleCtx {
    pub fn new(bus: Bus, config: Arc<RemdisConfig>) -> Self {
        Self { bus, config }
    }

    /// Configuration snapshot this module was constructed with.
    pub fn config(&self) -> &RemdisConfig {
        &self.config
    }

    /// Publish an IU to a topic.
    pub async fn publish(&self, topic: &str, iu: IncrementalUnit) {
        self.bus.publish(topic, iu).await;
    }

    /// The underlying bus, for modules that need extra subscriptions.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }
}

/// Handle to a spawned module task.
pub struct ModuleHandle {
    name: &'static str,
    join: JoinHandle<()>,
}

impl ModuleHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the module task to exit.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(module = self.name, "module task panicked: {e}");
        }
    }
}

/// Merge several topic subscriptions into one `(topic, iu)` channel.
///
/// One forwarder task per topic keeps per-topic order intact; interleaving
/// across topics is arbitrary, which matches the bus contract. Forwarders
/// exit on cancellation or when the receiver is dropped.
pub fn merge_subscriptions(
    bus: &Bus,
    topics: &[&str],
    cancel: CancellationToken,
) -> mpsc::Receiver<(String, IncrementalUnit)> {
    let subs: Vec<Subscription> = topics.iter().map(|t| bus.subscribe(t)).collect();
    let (merge_tx, merge_rx) = mpsc::channel::<(String, IncrementalUnit)>(DISPATCH_CHANNEL_SIZE);
    for mut sub in subs {
        let tx = merge_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    iu = sub.recv() => {
                        if tx.send((sub.topic().to_owned(), iu)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    merge_rx
}

/// Spawn a module: subscribe its input topics, run the hook loop until the
/// token cancels, then drain and shut down.
pub fn spawn_module<M: IncrementalModule>(
    mut module: M,
    bus: &Bus,
    config: Arc<RemdisConfig>,
    input_topics: &[&str],
    cancel: CancellationToken,
) -> ModuleHandle {
    let name = module.name();
    let ctx = ModuleCtx::new(bus.clone(), config);
    let mut merge_rx = merge_subscriptions(bus, input_topics, cancel.clone());

    let join = tokio::spawn(async move {
        let drain_timeout = Duration::from_millis(ctx.config().runtime.drain_timeout_ms);

        if let Err(e) = module.on_start(&ctx).await {
            error!(module = name, "on_start failed: {e}");
            return;
        }

        info!(module = name, "module started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = merge_rx.recv() => {
                    match next {
                        Some((topic, iu)) => {
                            if let Err(e) = module.on_iu(&topic, iu, &ctx).await {
                                warn!(module = name, topic, "on_iu error: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Bounded drain of whatever the forwarders already queued.
        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, merge_rx.recv()).await {
                Ok(Some((topic, iu))) => {
                    if let Err(e) = module.on_iu(&topic, iu, &ctx).await {
                        warn!(module = name, topic, "on_iu error during drain: {e}");
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if let Err(e) = module.on_shutdown(&ctx).await {
            warn!(module = name, "on_shutdown failed: {e}");
        }
        info!(module = name, "module stopped");
    });

    ModuleHandle { name, join }
}

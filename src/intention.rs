//! Silence watchdog: publishes an INTENT IU when the user has been quiet
//! past the configured threshold.
//!
//! The module tracks the most recent activity on the ASR and TTS streams;
//! the dialogue controller owns the prompt budget and cooldown.

use crate::error::Result;
use crate::iu::{ChainTracker, IncrementalUnit, Payload};
use crate::runtime::{IncrementalModule, ModuleCtx};
use crate::topics;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Poll period of the watchdog loop.
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// The timeout/intention module.
pub struct Intention {
    tracker: ChainTracker,
    last_activity: Arc<Mutex<Instant>>,
    stopped: Arc<AtomicBool>,
}

impl Intention {
    pub fn new() -> Self {
        Self {
            tracker: ChainTracker::new(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for Intention {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IncrementalModule for Intention {
    fn name(&self) -> &'static str {
        "intention"
    }

    async fn on_start(&mut self, ctx: &ModuleCtx) -> Result<()> {
        let last_activity = Arc::clone(&self.last_activity);
        let stopped = Arc::clone(&self.stopped);
        let ctx = ctx.clone();
        let max_silence = Duration::from_secs_f64(ctx.config().dialogue.max_silence_time_secs);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                if stopped.load(Ordering::Relaxed) {
                    break;
                }
                let mut last = last_activity.lock().await;
                let silence = last.elapsed();
                if silence >= max_silence {
                    info!(silence_secs = silence.as_secs_f64(), "user silence threshold hit");
                    // Restart the clock so the next INTENT needs a fresh
                    // full silence period.
                    *last = Instant::now();
                    drop(last);
                    let iu = IncrementalUnit::add("intention", Payload::Intent {
                        silence_secs: silence.as_secs_f64(),
                    });
                    ctx.publish(topics::INTENT_TIMEOUT, iu).await;
                }
            }
        });
        Ok(())
    }

    async fn on_iu(&mut self, _topic: &str, iu: IncrementalUnit, _ctx: &ModuleCtx) -> Result<()> {
        if !self.tracker.admit_or_log(&iu) {
            return Ok(());
        }
        // Any ASR or TTS traffic counts as activity.
        *self.last_activity.lock().await = Instant::now();
        Ok(())
    }

    async fn on_shutdown(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }
}

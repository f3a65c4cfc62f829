//! Shared test utilities: a scripted LLM source for deterministic tests.

use crate::error::{RemdisError, Result};
use crate::llm::{CancelToken, LlmRequest, TokenRx, TokenSource};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A [`TokenSource`] that replays a fixed token script with configurable
/// delays, recording every request it receives.
#[derive(Clone)]
pub struct ScriptedLlm {
    tokens: Vec<String>,
    first_delay: Duration,
    token_delay: Duration,
    /// Emit a stream error after this many tokens instead of finishing.
    fail_after: Option<usize>,
    requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl ScriptedLlm {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            first_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            fail_after: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay before the first token (for first-token timeout tests).
    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    /// Delay between consecutive tokens.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Fail the stream after emitting `n` tokens.
    pub fn with_failure_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Every request this source has received, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("request log").clone()
    }

    /// The final user message of each recorded request.
    pub fn queries(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.messages.last().map(|m| m.content.clone()))
            .collect()
    }
}

impl TokenSource for ScriptedLlm {
    fn stream(&self, request: LlmRequest, cancel: CancelToken) -> TokenRx {
        self.requests.lock().expect("request log").push(request);
        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        let tokens = self.tokens.clone();
        let first_delay = self.first_delay;
        let token_delay = self.token_delay;
        let fail_after = self.fail_after;

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(first_delay) => {}
            }
            for (i, token) in tokens.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(RemdisError::Llm("scripted failure".to_owned())))
                        .await;
                    return;
                }
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
                if !token_delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(token_delay) => {}
                    }
                }
            }
        });

        rx
    }
}

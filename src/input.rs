//! Typed-input ASR simulation.
//!
//! Converts UI `user_input` messages into the same IU streams a real
//! recognizer would publish: partial tokens as a chain of ADDs on
//! `asr.partial` (with a chain REVOKE when the text is rewritten), finals as
//! an ASR_COMMIT chain on `asr.commit`. A typing timeout auto-commits the
//! pending buffer so the dialogue keeps moving when the user stops typing.

use crate::bus::Bus;
use crate::iu::{IncrementalUnit, Payload};
use crate::topics;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Client→system message from the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    pub is_final: bool,
}

/// Auto-commit the buffer after this much typing silence.
const INPUT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Stability stamped on simulated partial tokens.
const SIM_STABILITY: f64 = 0.5;

struct TypedInput {
    bus: Bus,
    /// Tokens published on the current partial chain.
    tokens: Vec<String>,
    chain_tail: Option<IncrementalUnit>,
    last_input: Option<Instant>,
}

impl TypedInput {
    fn new(bus: Bus) -> Self {
        Self {
            bus,
            tokens: Vec::new(),
            chain_tail: None,
            last_input: None,
        }
    }

    async fn handle(&mut self, input: UserInput) {
        if input.is_final {
            self.commit(&input.text).await;
        } else {
            self.partial(&input.text).await;
            self.last_input = Some(Instant::now());
        }
    }

    /// Publish the token-level increment between the previous partial text
    /// and the new one.
    async fn partial(&mut self, text: &str) {
        let new_tokens: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
        if new_tokens == self.tokens {
            return;
        }

        let extends = new_tokens.len() >= self.tokens.len()
            && new_tokens[..self.tokens.len()] == self.tokens[..];
        if !extends {
            // Rewritten text retracts the whole partial chain.
            if let Some(tail) = self.chain_tail.take() {
                debug!("partial text rewritten, revoking chain");
                self.bus.publish(topics::ASR_PARTIAL, tail.revoke()).await;
            }
            self.tokens.clear();
        }

        for token in new_tokens.iter().skip(self.tokens.len()) {
            let payload = Payload::AsrToken {
                text: token.clone(),
                stability: SIM_STABILITY,
                confidence: SIM_STABILITY,
            };
            let iu = match &self.chain_tail {
                None => IncrementalUnit::add("input", payload),
                Some(tail) => tail.revision(payload),
            };
            self.chain_tail = Some(iu.clone());
            self.bus.publish(topics::ASR_PARTIAL, iu).await;
        }
        self.tokens = new_tokens;
    }

    /// Publish the final utterance and reset the partial state.
    async fn commit(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        info!(%text, "typed input committed");
        let add = IncrementalUnit::add("input", Payload::AsrCommit {
            text: text.to_owned(),
        });
        let commit = add.commit();
        self.bus.publish(topics::ASR_COMMIT, add).await;
        self.bus.publish(topics::ASR_COMMIT, commit).await;

        self.tokens.clear();
        self.chain_tail = None;
        self.last_input = None;
    }

    /// Pending partial text, for timeout auto-commit.
    fn pending_text(&self) -> Option<String> {
        if self.tokens.is_empty() {
            None
        } else {
            Some(self.tokens.join(" "))
        }
    }
}

/// Spawn the typed-input bridge; it consumes `rx` until cancellation.
pub fn spawn_typed_input(
    bus: Bus,
    mut rx: mpsc::Receiver<UserInput>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = TypedInput::new(bus);
        loop {
            let deadline = state.last_input.map(|at| at + INPUT_TIMEOUT);
            tokio::select! {
                () = cancel.cancelled() => break,
                input = rx.recv() => {
                    match input {
                        Some(input) => state.handle(input).await,
                        None => break,
                    }
                }
                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(text) = state.pending_text() {
                        info!("typing timeout, auto-committing input");
                        state.commit(&text).await;
                    } else {
                        state.last_input = None;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iu::UpdateType;

    #[tokio::test]
    async fn partials_extend_one_chain() {
        let bus = Bus::new(32);
        let mut sub = bus.subscribe(topics::ASR_PARTIAL);
        let mut input = TypedInput::new(bus.clone());

        input.partial("hello").await;
        input.partial("hello there").await;

        let first = sub.recv().await;
        let second = sub.recv().await;
        assert_eq!(first.previous_id, None);
        assert_eq!(second.previous_id, Some(first.id));
        match &second.payload {
            Payload::AsrToken { text, .. } => assert_eq!(text, "there"),
            other => unreachable!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewrite_revokes_and_restarts() {
        let bus = Bus::new(32);
        let mut sub = bus.subscribe(topics::ASR_PARTIAL);
        let mut input = TypedInput::new(bus.clone());

        input.partial("hello").await;
        input.partial("help").await;

        let add = sub.recv().await;
        assert_eq!(add.update_type, UpdateType::Add);
        let revoke = sub.recv().await;
        assert_eq!(revoke.update_type, UpdateType::Revoke);
        assert_eq!(revoke.previous_id, Some(add.id));
        let fresh = sub.recv().await;
        assert_eq!(fresh.update_type, UpdateType::Add);
        assert_eq!(fresh.previous_id, None);
        match &fresh.payload {
            Payload::AsrToken { text, .. } => assert_eq!(text, "help"),
            other => unreachable!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_input_publishes_commit_chain() {
        let bus = Bus::new(32);
        let mut sub = bus.subscribe(topics::ASR_COMMIT);
        let mut input = TypedInput::new(bus.clone());

        input.commit("tell me a joke").await;

        let add = sub.recv().await;
        assert_eq!(add.update_type, UpdateType::Add);
        match &add.payload {
            Payload::AsrCommit { text } => assert_eq!(text, "tell me a joke"),
            other => unreachable!("unexpected payload {other:?}"),
        }
        let commit = sub.recv().await;
        assert_eq!(commit.update_type, UpdateType::Commit);
        assert_eq!(commit.previous_id, Some(add.id));
    }
}

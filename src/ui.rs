//! Event bridge between the bus and UI clients.
//!
//! Subscribes to the dialogue/ASR/state topics and re-emits the
//! event-oriented UI protocol on a broadcast channel; the websocket (or any
//! other transport) stays outside this crate.

use crate::error::Result;
use crate::iu::{ChainTracker, IncrementalUnit, Payload, UpdateType};
use crate::runtime::{IncrementalModule, ModuleCtx};
use crate::topics;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// System→client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    NewText {
        role: String,
        text: String,
    },
    AsrToken {
        text: String,
        stability: f64,
    },
    PartialUser {
        text: String,
    },
    UserFinishedSpeaking,
    AsrRevoked,
    SystemState {
        expression: String,
        action: String,
        progress: Option<f64>,
        current_text: Option<String>,
        concept: Option<String>,
    },
    SystemFinishedSpeaking,
}

/// The UI bridge module.
pub struct UiBridge {
    events: broadcast::Sender<UiEvent>,
    tracker: ChainTracker,
    partial: Vec<String>,
}

impl UiBridge {
    /// Create a bridge; `capacity` bounds the broadcast backlog.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            tracker: ChainTracker::new(),
            partial: Vec::new(),
        }
    }

    /// Subscribe a UI client to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: UiEvent) {
        // A send error only means no client is connected right now.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl IncrementalModule for UiBridge {
    fn name(&self) -> &'static str {
        "ui_bridge"
    }

    async fn on_iu(&mut self, topic: &str, iu: IncrementalUnit, _ctx: &ModuleCtx) -> Result<()> {
        if !self.tracker.admit_or_log(&iu) {
            return Ok(());
        }
        match topic {
            topics::DIALOGUE_TEXT => match (&iu.update_type, &iu.payload) {
                (UpdateType::Add, Payload::Text { text }) => {
                    self.emit(UiEvent::NewText {
                        role: "system".to_owned(),
                        text: text.clone(),
                    });
                }
                (UpdateType::Commit, _) => self.emit(UiEvent::SystemFinishedSpeaking),
                _ => {}
            },
            topics::SYSTEM_STATE => {
                if let Payload::SystemState {
                    expression,
                    action,
                    concept,
                    current_text,
                    progress,
                } = &iu.payload
                {
                    self.emit(UiEvent::SystemState {
                        expression: expression.clone(),
                        action: action.clone(),
                        progress: *progress,
                        current_text: if current_text.is_empty() {
                            None
                        } else {
                            Some(current_text.clone())
                        },
                        concept: if concept.is_empty() {
                            None
                        } else {
                            Some(concept.clone())
                        },
                    });
                }
            }
            topics::ASR_PARTIAL => match (&iu.update_type, &iu.payload) {
                (UpdateType::Add, Payload::AsrToken { text, stability, .. }) => {
                    if iu.previous_id.is_none() {
                        self.partial.clear();
                    }
                    self.partial.push(text.clone());
                    self.emit(UiEvent::AsrToken {
                        text: text.clone(),
                        stability: *stability,
                    });
                    self.emit(UiEvent::PartialUser {
                        text: self.partial.join(" "),
                    });
                }
                (UpdateType::Revoke, _) => {
                    self.partial.clear();
                    self.emit(UiEvent::AsrRevoked);
                }
                _ => {}
            },
            topics::ASR_COMMIT => {
                if let (UpdateType::Add, Payload::AsrCommit { text }) =
                    (&iu.update_type, &iu.payload)
                {
                    self.partial.clear();
                    self.emit(UiEvent::NewText {
                        role: "user".to_owned(),
                        text: text.clone(),
                    });
                    self.emit(UiEvent::UserFinishedSpeaking);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Topics the bridge subscribes to.
pub const UI_TOPICS: [&str; 4] = [
    topics::DIALOGUE_TEXT,
    topics::SYSTEM_STATE,
    topics::ASR_PARTIAL,
    topics::ASR_COMMIT,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = UiEvent::SystemState {
            expression: "joy".to_owned(),
            action: "nod".to_owned(),
            progress: None,
            current_text: None,
            concept: Some("Paris".to_owned()),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"system_state\""));
        assert!(json.contains("\"concept\":\"Paris\""));
    }

    #[tokio::test]
    async fn dialogue_add_becomes_new_text() {
        let mut bridge = Fixture::default();
        let mut rx = bridge.bridge.subscribe();
        let iu = IncrementalUnit::add("dialogue", Payload::Text {
            text: "hello there,".to_owned(),
        });
        bridge.feed(topics::DIALOGUE_TEXT, iu).await;
        match rx.recv().await.expect("event") {
            UiEvent::NewText { role, text } => {
                assert_eq!(role, "system");
                assert_eq!(text, "hello there,");
            }
            other => unreachable!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoked_partial_clears_buffer() {
        let mut bridge = Fixture::default();
        let mut rx = bridge.bridge.subscribe();
        let token = IncrementalUnit::add("input", Payload::AsrToken {
            text: "hello".to_owned(),
            stability: 0.5,
            confidence: 0.5,
        });
        bridge.feed(topics::ASR_PARTIAL, token.clone()).await;
        bridge.feed(topics::ASR_PARTIAL, token.revoke()).await;

        // AsrToken, PartialUser, then AsrRevoked.
        let _ = rx.recv().await.expect("token event");
        let _ = rx.recv().await.expect("partial event");
        match rx.recv().await.expect("revoke event") {
            UiEvent::AsrRevoked => {}
            other => unreachable!("unexpected event {other:?}"),
        }
    }

    /// Harness that drives the bridge's hook directly.
    struct Fixture {
        bridge: UiBridge,
        ctx: ModuleCtx,
    }

    impl Default for Fixture {
        fn default() -> Self {
            let bus = crate::bus::Bus::new(8);
            let config = std::sync::Arc::new(crate::config::RemdisConfig::default());
            Self {
                bridge: UiBridge::new(16),
                ctx: ModuleCtx::new(bus, config),
            }
        }
    }

    impl Fixture {
        async fn feed(&mut self, topic: &str, iu: IncrementalUnit) {
            self.bridge
                .on_iu(topic, iu, &self.ctx)
                .await
                .expect("on_iu");
        }
    }
}

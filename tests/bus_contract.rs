//! Bus and IU contract properties: wire round-trip, idempotent delivery,
//! and ordering through the module runtime.

use async_trait::async_trait;
use remdis::bus::Bus;
use remdis::config::RemdisConfig;
use remdis::iu::{ChainTracker, ChainVerdict, IncrementalUnit, Payload, UpdateType};
use remdis::runtime::{IncrementalModule, ModuleCtx, spawn_module};
use remdis::topics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[test]
fn every_payload_variant_round_trips() {
    let payloads = vec![
        Payload::Audio {
            bytes: vec![1, 2, 3],
        },
        Payload::AsrToken {
            text: "hello".to_owned(),
            stability: 0.25,
            confidence: 0.75,
        },
        Payload::AsrCommit {
            text: "hello world".to_owned(),
        },
        Payload::Vap {
            p_now: 0.8,
            p_future: 0.9,
        },
        Payload::Text {
            text: "chunk one,".to_owned(),
        },
        Payload::TtsAudio {
            bytes: vec![9, 8, 7],
        },
        Payload::SystemState {
            expression: "joy".to_owned(),
            action: "nod".to_owned(),
            concept: "Paris".to_owned(),
            current_text: "I went to".to_owned(),
            progress: Some(0.5),
        },
        Payload::Backchannel {
            intensity: 6,
            expression: "surprise".to_owned(),
            action: "nod".to_owned(),
            concept: "holidays".to_owned(),
            phrase: "Uh-huh.".to_owned(),
        },
        Payload::Intent { silence_secs: 5.2 },
    ];

    for payload in payloads {
        let iu = IncrementalUnit::add("test", payload).with_meta("k", "v");
        let wire = serde_json::to_string(&iu).expect("serialize");
        let back: IncrementalUnit = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(iu, back, "round-trip changed the IU: {wire}");
    }
}

#[test]
fn linked_ius_round_trip_with_previous_id() {
    let root = IncrementalUnit::add("dialogue", Payload::Text {
        text: "one,".to_owned(),
    });
    let commit = root.commit();
    let wire = serde_json::to_string(&commit).expect("serialize");
    let back: IncrementalUnit = serde_json::from_str(&wire).expect("deserialize");
    assert_eq!(back.previous_id, Some(root.id));
    assert_eq!(back.update_type, UpdateType::Commit);
}

/// A consumer that applies the chain grammar and counts accepted IUs, as
/// every real module does.
struct CountingConsumer {
    tracker: ChainTracker,
    accepted: Arc<Mutex<Vec<IncrementalUnit>>>,
}

#[async_trait]
impl IncrementalModule for CountingConsumer {
    fn name(&self) -> &'static str {
        "counting_consumer"
    }

    async fn on_iu(
        &mut self,
        _topic: &str,
        iu: IncrementalUnit,
        _ctx: &ModuleCtx,
    ) -> remdis::Result<()> {
        if let Ok(ChainVerdict::Accepted) = self.tracker.admit(&iu) {
            self.accepted.lock().expect("accepted log").push(iu);
        }
        Ok(())
    }
}

/// Redelivering the same IU (same id) leaves the observable state unchanged.
#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let bus = Bus::new(16);
    let cancel = CancellationToken::new();
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let module = spawn_module(
        CountingConsumer {
            tracker: ChainTracker::new(),
            accepted: Arc::clone(&accepted),
        },
        &bus,
        Arc::new(RemdisConfig::default()),
        &[topics::DIALOGUE_TEXT],
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let iu = IncrementalUnit::add("dialogue", Payload::Text {
        text: "once.".to_owned(),
    });
    // Simulated redelivery after a transport hiccup.
    bus.publish(topics::DIALOGUE_TEXT, iu.clone()).await;
    bus.publish(topics::DIALOGUE_TEXT, iu.clone()).await;
    bus.publish(topics::DIALOGUE_TEXT, iu).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    module.join().await;

    assert_eq!(accepted.lock().expect("accepted log").len(), 1);
}

/// IUs observed by a subscriber appear in the producer's publication order.
#[tokio::test]
async fn module_observes_publication_order() {
    let bus = Bus::new(64);
    let cancel = CancellationToken::new();
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let module = spawn_module(
        CountingConsumer {
            tracker: ChainTracker::new(),
            accepted: Arc::clone(&accepted),
        },
        &bus,
        Arc::new(RemdisConfig::default()),
        &[topics::DIALOGUE_TEXT],
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut published = Vec::new();
    let mut tail: Option<IncrementalUnit> = None;
    for i in 0..10 {
        let payload = Payload::Text {
            text: format!("chunk {i},"),
        };
        let iu = match &tail {
            None => IncrementalUnit::add("dialogue", payload),
            Some(prev) => prev.revision(payload),
        };
        tail = Some(iu.clone());
        published.push(iu.id);
        bus.publish(topics::DIALOGUE_TEXT, iu).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    module.join().await;

    let observed: Vec<_> = accepted
        .lock()
        .expect("accepted log")
        .iter()
        .map(|iu| iu.id)
        .collect();
    assert_eq!(observed, published);
}

/// A causality-violating IU is dropped without disturbing later traffic.
#[tokio::test]
async fn orphan_commit_is_dropped_not_fatal() {
    let bus = Bus::new(16);
    let cancel = CancellationToken::new();
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let module = spawn_module(
        CountingConsumer {
            tracker: ChainTracker::new(),
            accepted: Arc::clone(&accepted),
        },
        &bus,
        Arc::new(RemdisConfig::default()),
        &[topics::DIALOGUE_TEXT],
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A commit whose chain this consumer never saw.
    let unseen_root = IncrementalUnit::add("dialogue", Payload::Text {
        text: "ghost,".to_owned(),
    });
    bus.publish(topics::DIALOGUE_TEXT, unseen_root.commit())
        .await;

    // Ordinary traffic keeps flowing.
    let ok = IncrementalUnit::add("dialogue", Payload::Text {
        text: "real.".to_owned(),
    });
    bus.publish(topics::DIALOGUE_TEXT, ok.clone()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    module.join().await;

    let observed = accepted.lock().expect("accepted log");
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].id, ok.id);
}

//! The Incremental Unit: the atomic message exchanged between modules.
//!
//! An IU is immutable once constructed. Streams of IUs form *chains* linked
//! by `previous_id`; a chain is extended with ADDs, retracted with a single
//! REVOKE, or sealed with a single COMMIT. [`ChainTracker`] enforces the
//! chain grammar on the consumer side.

use crate::error::{RemdisError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Globally unique IU identifier.
pub type IuId = Uuid;

/// Seconds since the UNIX epoch, the timestamp domain of every IU.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Revision protocol verb carried by every IU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// New content appended to a stream (or a revision when linked).
    Add,
    /// Retracts the chain of the referenced IU.
    Revoke,
    /// Seals the chain of the referenced IU as final.
    Commit,
}

/// Typed IU payload, tagged on the wire by its data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    /// Raw microphone audio frame.
    Audio { bytes: Vec<u8> },
    /// One recognized token of a user utterance in progress.
    AsrToken {
        text: String,
        stability: f64,
        confidence: f64,
    },
    /// Final text of a completed user utterance.
    AsrCommit { text: String },
    /// Turn-shift probabilities from the voice-activity-projection model.
    Vap { p_now: f64, p_future: f64 },
    /// A speakable chunk of system text bound for TTS.
    Text { text: String },
    /// Synthesized audio frame.
    TtsAudio { bytes: Vec<u8> },
    /// Avatar/UI state update.
    SystemState {
        expression: String,
        action: String,
        concept: String,
        current_text: String,
        progress: Option<f64>,
    },
    /// Backchannel suggestion from the text-VAP adapter.
    Backchannel {
        intensity: u8,
        expression: String,
        action: String,
        concept: String,
        phrase: String,
    },
    /// Silence watchdog signal.
    Intent { silence_secs: f64 },
}

impl Payload {
    /// Wire name of this payload's data type.
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "AUDIO",
            Self::AsrToken { .. } => "ASR_TOKEN",
            Self::AsrCommit { .. } => "ASR_COMMIT",
            Self::Vap { .. } => "VAP",
            Self::Text { .. } => "TEXT",
            Self::TtsAudio { .. } => "TTS_AUDIO",
            Self::SystemState { .. } => "SYSTEM_STATE",
            Self::Backchannel { .. } => "BACKCHANNEL",
            Self::Intent { .. } => "INTENT",
        }
    }
}

/// The atomic message exchanged between modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalUnit {
    /// Globally unique identifier.
    pub id: IuId,
    /// Module name of origin.
    pub producer: String,
    /// Wall clock at creation, seconds since the UNIX epoch.
    pub timestamp: f64,
    /// The IU this one revises or extends, if any.
    pub previous_id: Option<IuId>,
    /// Revision protocol verb.
    pub update_type: UpdateType,
    /// Typed payload.
    #[serde(flatten)]
    pub payload: Payload,
    /// Producer-specific extras.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl IncrementalUnit {
    /// A chain-root ADD.
    pub fn add(producer: &str, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: producer.to_owned(),
            timestamp: now_ts(),
            previous_id: None,
            update_type: UpdateType::Add,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// An ADD linked to `self`, extending or revising its chain.
    pub fn revision(&self, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: self.producer.clone(),
            timestamp: now_ts(),
            previous_id: Some(self.id),
            update_type: UpdateType::Add,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// A COMMIT sealing the chain of `self`.
    pub fn commit(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: self.producer.clone(),
            timestamp: now_ts(),
            previous_id: Some(self.id),
            update_type: UpdateType::Commit,
            payload: self.payload.clone(),
            metadata: BTreeMap::new(),
        }
    }

    /// A REVOKE retracting the chain of `self`.
    pub fn revoke(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: self.producer.clone(),
            timestamp: now_ts(),
            previous_id: Some(self.id),
            update_type: UpdateType::Revoke,
            payload: self.payload.clone(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry (builder style).
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }
}

/// Outcome of admitting one IU against the chain grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerdict {
    /// The IU is new and consistent; process it.
    Accepted,
    /// Same id was delivered before; skip silently (idempotence).
    Duplicate,
}

/// Consumer-side enforcement of the chain grammar
/// `ADD (ADD|REV)* (REVOKE|COMMIT)?`.
///
/// One tracker per consumer; feed it every IU before acting on it.
#[derive(Debug, Default)]
pub struct ChainTracker {
    /// Accepted IU id → chain root id.
    chains: HashMap<IuId, IuId>,
    /// Chains sealed by COMMIT or retracted by REVOKE.
    closed: HashSet<IuId>,
}

impl ChainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain root of an accepted IU, if known.
    pub fn chain_of(&self, id: IuId) -> Option<IuId> {
        self.chains.get(&id).copied()
    }

    /// Whether a chain has been sealed or retracted.
    pub fn is_closed(&self, root: IuId) -> bool {
        self.closed.contains(&root)
    }

    /// Validate one incoming IU against the chain grammar.
    ///
    /// # Errors
    ///
    /// `Causality` when the referenced ancestor was never observed, or when a
    /// REVOKE targets an already-sealed chain; `Protocol` when a verb arrives
    /// on a chain that is already closed. Violations are never fatal: log,
    /// drop the IU, continue.
    pub fn admit(&mut self, iu: &IncrementalUnit) -> Result<ChainVerdict> {
        if self.chains.contains_key(&iu.id) {
            return Ok(ChainVerdict::Duplicate);
        }

        match (iu.update_type, iu.previous_id) {
            (UpdateType::Add, None) => {
                self.chains.insert(iu.id, iu.id);
                Ok(ChainVerdict::Accepted)
            }
            (UpdateType::Add, Some(prev)) => {
                let root = self.require_ancestor(prev)?;
                if self.closed.contains(&root) {
                    return Err(RemdisError::Protocol(format!(
                        "ADD {} on closed chain {root}",
                        iu.id
                    )));
                }
                self.chains.insert(iu.id, root);
                Ok(ChainVerdict::Accepted)
            }
            (UpdateType::Commit, Some(prev)) => {
                let root = self.require_ancestor(prev)?;
                if self.closed.contains(&root) {
                    return Err(RemdisError::Protocol(format!(
                        "COMMIT {} on closed chain {root}",
                        iu.id
                    )));
                }
                self.closed.insert(root);
                self.chains.insert(iu.id, root);
                Ok(ChainVerdict::Accepted)
            }
            (UpdateType::Revoke, Some(prev)) => {
                let root = self.require_ancestor(prev)?;
                if self.closed.contains(&root) {
                    return Err(RemdisError::Protocol(format!(
                        "REVOKE {} on closed chain {root}",
                        iu.id
                    )));
                }
                self.closed.insert(root);
                self.chains.insert(iu.id, root);
                Ok(ChainVerdict::Accepted)
            }
            (UpdateType::Commit | UpdateType::Revoke, None) => Err(RemdisError::Causality(format!(
                "{:?} {} carries no previous_id",
                iu.update_type, iu.id
            ))),
        }
    }

    /// Admit an IU, logging violations; returns whether to process it.
    pub fn admit_or_log(&mut self, iu: &IncrementalUnit) -> bool {
        match self.admit(iu) {
            Ok(ChainVerdict::Accepted) => true,
            Ok(ChainVerdict::Duplicate) => {
                tracing::debug!(id = %iu.id, "dropping duplicate IU");
                false
            }
            Err(e) => {
                tracing::warn!(id = %iu.id, producer = %iu.producer, "dropping IU: {e}");
                false
            }
        }
    }

    fn require_ancestor(&self, prev: IuId) -> Result<IuId> {
        self.chains
            .get(&prev)
            .copied()
            .ok_or_else(|| RemdisError::Causality(format!("unknown ancestor {prev}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Payload {
        Payload::Text { text: s.to_owned() }
    }

    #[test]
    fn ids_are_unique() {
        let a = IncrementalUnit::add("test", text("a"));
        let b = IncrementalUnit::add("test", text("a"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serde_round_trip_preserves_every_field() {
        let iu = IncrementalUnit::add("asr", Payload::AsrToken {
            text: "hello".to_owned(),
            stability: 0.4,
            confidence: 0.97,
        })
        .with_meta("lang", "en");
        let wire = serde_json::to_string(&iu).expect("serialize");
        let back: IncrementalUnit = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(iu, back);

        // The tag is the documented data-type name.
        assert!(wire.contains("\"data_type\":\"ASR_TOKEN\""));
    }

    #[test]
    fn chain_grammar_accepts_add_add_commit() {
        let mut tracker = ChainTracker::new();
        let a = IncrementalUnit::add("dlg", text("first,"));
        let b = a.revision(text("second."));
        let c = b.commit();
        assert_eq!(tracker.admit(&a).unwrap(), ChainVerdict::Accepted);
        assert_eq!(tracker.admit(&b).unwrap(), ChainVerdict::Accepted);
        assert_eq!(tracker.admit(&c).unwrap(), ChainVerdict::Accepted);
        assert!(tracker.is_closed(a.id));
    }

    #[test]
    fn add_after_commit_is_protocol_violation() {
        let mut tracker = ChainTracker::new();
        let a = IncrementalUnit::add("dlg", text("done."));
        let c = a.commit();
        let late = a.revision(text("more"));
        tracker.admit(&a).unwrap();
        tracker.admit(&c).unwrap();
        match tracker.admit(&late) {
            Err(RemdisError::Protocol(_)) => {}
            other => unreachable!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn second_commit_is_protocol_violation() {
        let mut tracker = ChainTracker::new();
        let a = IncrementalUnit::add("dlg", text("done."));
        tracker.admit(&a).unwrap();
        tracker.admit(&a.commit()).unwrap();
        assert!(matches!(
            tracker.admit(&a.commit()),
            Err(RemdisError::Protocol(_))
        ));
    }

    #[test]
    fn revoke_after_commit_is_rejected() {
        let mut tracker = ChainTracker::new();
        let a = IncrementalUnit::add("dlg", text("done."));
        tracker.admit(&a).unwrap();
        tracker.admit(&a.commit()).unwrap();
        assert!(tracker.admit(&a.revoke()).is_err());
    }

    #[test]
    fn unknown_ancestor_is_causality_violation() {
        let mut tracker = ChainTracker::new();
        let orphan = IncrementalUnit::add("dlg", text("x"));
        let commit = orphan.commit();
        assert!(matches!(
            tracker.admit(&commit),
            Err(RemdisError::Causality(_))
        ));
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut tracker = ChainTracker::new();
        let a = IncrementalUnit::add("dlg", text("x"));
        assert_eq!(tracker.admit(&a).unwrap(), ChainVerdict::Accepted);
        assert_eq!(tracker.admit(&a).unwrap(), ChainVerdict::Duplicate);
    }
}

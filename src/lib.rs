//! Remdis: a real-time incremental spoken-dialogue framework.
//!
//! Modules exchange *Incremental Units* (IUs) over an in-process topic bus:
//! ASR partials and VAP turn-taking probabilities flow into the dialogue
//! controller, which speculates on a response while the user is still
//! talking and streams speakable chunks out to TTS.
//!
//! # Architecture
//!
//! Independent long-lived tasks connected only through the bus:
//! - **IU model** ([`iu`]): the revision protocol (ADD/REVOKE/COMMIT) and
//!   its consumer-side chain grammar enforcement
//! - **Bus** ([`bus`]): per-subscriber bounded queues with a
//!   commit-preserving drop policy
//! - **Module runtime** ([`runtime`]): subscribe/consume/publish lifecycle
//!   with sequential dispatch and drain-on-shutdown
//! - **Dialogue controller** ([`dialogue`]): the turn-taking state machine
//!   with speculative generation, barge-in, backchannels, and silence
//!   prompts
//! - **LLM adapter** ([`llm`]): cancellable token streaming with a
//!   first-token deadline and punctuation chunking
//! - **Text-VAP** ([`text_vap`]): rate-limited backchannel/concept
//!   inference over the partial utterance
//! - **Intention** ([`intention`]): the user-silence watchdog

pub mod bus;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod input;
pub mod intention;
pub mod iu;
pub mod labels;
pub mod llm;
pub mod prompts;
pub mod runtime;
pub mod test_utils;
pub mod text_vap;
pub mod topics;
pub mod ui;

pub use bus::{Bus, Subscription};
pub use config::RemdisConfig;
pub use dialogue::{DialogueController, DialogueState};
pub use error::{RemdisError, Result};
pub use iu::{ChainTracker, IncrementalUnit, Payload, UpdateType};
pub use runtime::{IncrementalModule, ModuleCtx, spawn_module};

//! The dialogue turn-taking controller.
//!
//! Merges three input streams — ASR partials/commits, VAP probabilities,
//! and silence-timeout signals — and produces TEXT chunks for TTS plus
//! SYSTEM_STATE updates for the avatar. The controller interleaves token
//! pumping with input handling in one select loop, so `on_iu`-style hooks
//! would serialize away the speculation; it drives the bus directly instead,
//! through the same subscription-merge the module runtime uses.

use crate::bus::Bus;
use crate::config::RemdisConfig;
use crate::dialogue::draft::ResponseDraft;
use crate::dialogue::history::DialogueHistory;
use crate::dialogue::state::DialogueState;
use crate::dialogue::{VapEvent, classify_vap};
use crate::error::{RemdisError, Result};
use crate::iu::{ChainTracker, IncrementalUnit, Payload, UpdateType, now_ts};
use crate::llm::{Chunker, Generation, LlmRequest, TokenSource};
use crate::prompts::PromptSet;
use crate::runtime::merge_subscriptions;
use crate::topics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer name stamped on every IU this controller publishes.
const PRODUCER: &str = "dialogue";

/// Backchannel suggestions at or above this intensity are spoken aloud;
/// weaker ones only update the avatar state.
const VERBAL_INTENSITY_MIN: u8 = 5;

/// Why the active generation exists.
enum GenerationKind {
    /// Responding to a user utterance (speculative until the turn is taken).
    Response,
    /// Self-initiated filler after a user silence timeout.
    TimeoutPrompt,
}

/// One in-flight generation and everything needed to publish it.
struct ActiveGeneration {
    generation: Generation,
    chunker: Chunker,
    draft: ResponseDraft,
    kind: GenerationKind,
    /// When set, completed chunks go straight onto the TEXT chain.
    flushing: bool,
    /// Trailing expression/action code pair, parsed at stream end.
    closing_state: Option<(&'static str, &'static str)>,
}

/// The turn-taking state machine plus its bookkeeping.
pub struct DialogueController {
    config: Arc<RemdisConfig>,
    prompts: PromptSet,
    llm: Arc<dyn TokenSource>,
    bus: Bus,
    cancel: CancellationToken,

    state: DialogueState,
    state_watch: watch::Sender<DialogueState>,
    history: DialogueHistory,
    tracker: ChainTracker,
    active: Option<ActiveGeneration>,

    /// Tokens of the user utterance in progress (current ASR chain).
    partial: Vec<String>,
    /// Committed user utterance awaiting its system turn in the history.
    pending_user: Option<(String, f64, f64)>,
    user_turn_started: Option<f64>,

    last_asr_ts: f64,
    last_vap_at: Option<Instant>,
    prev_vap_event: Option<VapEvent>,
    vap_fallback_logged: bool,

    timeout_count: u32,
    cooldown_until: Option<Instant>,

    backchannel_idx: usize,
    verbal_backchannels: usize,
    generation_counter: u64,
}

impl DialogueController {
    pub fn new(
        config: Arc<RemdisConfig>,
        prompts: PromptSet,
        llm: Arc<dyn TokenSource>,
        bus: Bus,
        cancel: CancellationToken,
    ) -> Self {
        let history = DialogueHistory::new(config.dialogue.history_length);
        let (state_watch, _) = watch::channel(DialogueState::Idle);
        Self {
            config,
            prompts,
            llm,
            bus,
            cancel,
            state: DialogueState::Idle,
            state_watch,
            history,
            tracker: ChainTracker::new(),
            active: None,
            partial: Vec::new(),
            pending_user: None,
            user_turn_started: None,
            last_asr_ts: 0.0,
            last_vap_at: None,
            prev_vap_event: None,
            vap_fallback_logged: false,
            timeout_count: 0,
            cooldown_until: None,
            backchannel_idx: 0,
            verbal_backchannels: 0,
            generation_counter: 0,
        }
    }

    /// Current state, for tests and diagnostics.
    pub fn state(&self) -> DialogueState {
        self.state
    }

    /// Watch the controller's state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DialogueState> {
        self.state_watch.subscribe()
    }

    fn set_state(&mut self, next: DialogueState) {
        if next != self.state {
            debug!(from = %self.state, to = %next, "state transition");
            self.state = next;
            self.state_watch.send_replace(next);
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut inputs = merge_subscriptions(
            &self.bus,
            &[
                topics::ASR_PARTIAL,
                topics::ASR_COMMIT,
                topics::VAP_PROB,
                topics::INTENT_TIMEOUT,
                topics::BC_SUGGEST,
                topics::TTS_AUDIO,
            ],
            cancel.clone(),
        );

        info!("dialogue controller started");
        loop {
            // Pump the generation only while it still produces tokens.
            let pumping = self
                .active
                .as_ref()
                .is_some_and(|a| !a.draft.completed);

            if pumping {
                enum Step {
                    Cancelled,
                    Token(Result<Option<String>>),
                    Input(Option<(String, IncrementalUnit)>),
                }
                let mut active = self.active.take().expect("active generation");
                let step = tokio::select! {
                    () = cancel.cancelled() => Step::Cancelled,
                    token = active.generation.next_token() => Step::Token(token),
                    next = inputs.recv() => Step::Input(next),
                };
                self.active = Some(active);
                match step {
                    Step::Cancelled => {
                        if let Some(active) = &self.active {
                            active.generation.cancel();
                        }
                        break;
                    }
                    Step::Token(token) => self.handle_token(token).await,
                    Step::Input(Some((topic, iu))) => self.handle_iu(&topic, iu).await,
                    Step::Input(None) => break,
                }
            } else {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = inputs.recv() => {
                        match next {
                            Some((topic, iu)) => self.handle_iu(&topic, iu).await,
                            None => break,
                        }
                    }
                }
            }
        }

        if let Some(active) = self.active.take() {
            active.generation.cancel();
        }
        info!("dialogue controller stopped");
        Ok(())
    }

    // ── Input dispatch ──────────────────────────────────────────────────

    async fn handle_iu(&mut self, topic: &str, iu: IncrementalUnit) {
        if !self.tracker.admit_or_log(&iu) {
            return;
        }
        match topic {
            topics::ASR_PARTIAL => self.on_asr_partial(iu).await,
            topics::ASR_COMMIT => self.on_asr_commit(iu).await,
            topics::VAP_PROB => self.on_vap(iu).await,
            topics::INTENT_TIMEOUT => self.on_intent(iu).await,
            topics::BC_SUGGEST => self.on_backchannel_suggestion(iu).await,
            topics::TTS_AUDIO => self.on_tts(iu).await,
            other => debug!(topic = other, "ignoring IU on unexpected topic"),
        }
    }

    async fn on_asr_partial(&mut self, iu: IncrementalUnit) {
        match iu.update_type {
            UpdateType::Add => {
                let (text, stability) = match &iu.payload {
                    Payload::AsrToken {
                        text, stability, ..
                    } => (text.clone(), *stability),
                    other => {
                        debug!(data_type = other.data_type(), "non-token IU on asr.partial");
                        return;
                    }
                };
                if iu.previous_id.is_none() {
                    // A fresh chain replaces the previous partial sequence.
                    self.partial.clear();
                }
                if !text.is_empty() {
                    self.partial.push(text);
                }
                self.note_user_activity(iu.timestamp);
                self.on_user_speech(stability, iu.timestamp).await;
            }
            UpdateType::Revoke => {
                // The recognizer retracted the whole partial chain.
                self.partial.clear();
                self.note_user_activity(iu.timestamp);
            }
            UpdateType::Commit => {}
        }
    }

    /// React to a partial token: state transitions plus the speculative
    /// generation policy.
    async fn on_user_speech(&mut self, stability: f64, ts: f64) {
        match self.state {
            DialogueState::Idle => {
                self.set_state(DialogueState::Listening);
                self.user_turn_started = Some(ts);
                info!(state = %self.state, "user speech started");
            }
            DialogueState::Speaking => {
                if stability >= self.config.dialogue.barge_in_stability {
                    self.on_barge_in(ts).await;
                } else {
                    return;
                }
            }
            DialogueState::TimeoutPrompt => {
                // User spoke before the filler produced anything audible.
                self.cancel_active_generation(true).await;
                self.set_state(DialogueState::Listening);
                self.user_turn_started = Some(ts);
            }
            DialogueState::Listening | DialogueState::Thinking | DialogueState::Backchannel => {}
        }
        self.speculate().await;
    }

    /// Barge-in: revoke the in-flight system output and go back to listening.
    async fn on_barge_in(&mut self, ts: f64) {
        info!("user barge-in, revoking system turn");
        let flushed_text = self
            .active
            .as_ref()
            .map(|a| a.draft.partial_text.clone())
            .unwrap_or_default();
        self.cancel_active_generation(true).await;
        self.close_turn_interrupted(&flushed_text);
        self.set_state(DialogueState::Listening);
        self.user_turn_started = Some(ts);
        self.publish_state("normal", "listening", "", None).await;
    }

    /// Record the interrupted system turn (and its user turn) in history.
    fn close_turn_interrupted(&mut self, system_text: &str) {
        if let Some((text, started, ended)) = self.pending_user.take() {
            self.history.push_user(&text, started, ended);
        }
        if !system_text.trim().is_empty() {
            self.history
                .push_system(system_text, now_ts(), now_ts(), true);
        }
    }

    /// Speculative generation policy: one generation at a time, restarted
    /// when the user draft diverges from its prompt snapshot. Applies only
    /// while listening; once the turn is taken the draft is frozen.
    async fn speculate(&mut self) {
        if self.state != DialogueState::Listening {
            return;
        }
        let draft_text = self.partial.join(" ");
        if draft_text.trim().is_empty() {
            return;
        }
        let restart = match &self.active {
            Some(active) => active.draft.diverges_from(&draft_text),
            None => true,
        };
        if !restart {
            return;
        }
        self.cancel_active_generation(true).await;
        self.start_generation(GenerationKind::Response, &draft_text, false);
    }

    async fn on_asr_commit(&mut self, iu: IncrementalUnit) {
        let text = match &iu.payload {
            Payload::AsrCommit { text } => text.trim().to_owned(),
            _ => return,
        };
        if iu.update_type != UpdateType::Add || text.is_empty() {
            return;
        }
        self.note_user_activity(iu.timestamp);
        self.check_vap_fallback();

        if self.state == DialogueState::Speaking {
            // Commit arriving mid-speech is a barge-in by content.
            self.on_barge_in(iu.timestamp).await;
        }

        let started = self.user_turn_started.take().unwrap_or(iu.timestamp);
        self.pending_user = Some((text.clone(), started, iu.timestamp));
        self.partial.clear();
        self.verbal_backchannels = 0;
        self.take_turn(&text).await;
    }

    /// The user turn is over: promote or restart the speculation and start
    /// flushing chunks to TTS.
    async fn take_turn(&mut self, utterance: &str) {
        let keep = self
            .active
            .as_ref()
            .is_some_and(|a| !a.draft.diverges_from(utterance));
        if keep {
            debug!("continuing speculative generation for committed turn");
        } else {
            self.cancel_active_generation(true).await;
            self.start_generation(GenerationKind::Response, utterance, false);
        }
        self.set_state(DialogueState::Thinking);
        if let Some(active) = self.active.as_mut() {
            active.flushing = true;
        }
        self.flush_pending().await;
        self.maybe_finalize().await;
    }

    async fn on_vap(&mut self, iu: IncrementalUnit) {
        let (p_now, p_future) = match &iu.payload {
            Payload::Vap { p_now, p_future } => (*p_now, *p_future),
            _ => return,
        };
        self.last_vap_at = Some(Instant::now());

        // Reconcile against ASR time: a VAP reading older than the newest
        // ASR activity (beyond the window) describes speech that has since
        // changed.
        let window = self.config.vap.reconcile_window_ms as f64 / 1000.0;
        if self.last_asr_ts > 0.0 && iu.timestamp + window < self.last_asr_ts {
            debug!("ignoring stale VAP reading");
            return;
        }

        let event = classify_vap(
            p_now,
            p_future,
            self.config.vap.threshold,
            self.prev_vap_event,
        );
        let Some(event) = event else { return };
        self.prev_vap_event = Some(event);

        match event {
            VapEvent::SystemTakeTurn => {
                if self.state == DialogueState::Listening && !self.partial.is_empty() {
                    let utterance = self.partial.join(" ");
                    info!("VAP projects a turn shift, taking the turn");
                    let started = self.user_turn_started.take().unwrap_or(iu.timestamp);
                    self.pending_user = Some((utterance.clone(), started, iu.timestamp));
                    self.partial.clear();
                    self.verbal_backchannels = 0;
                    self.take_turn(&utterance).await;
                }
            }
            VapEvent::SystemBackchannel => {
                self.emit_verbal_backchannel(None).await;
            }
            VapEvent::UserTakeTurn => {}
        }
    }

    async fn on_intent(&mut self, iu: IncrementalUnit) {
        let silence = match &iu.payload {
            Payload::Intent { silence_secs } => *silence_secs,
            _ => return,
        };
        if self.state != DialogueState::Idle {
            return;
        }
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                debug!("timeout prompt suppressed by cooldown");
                return;
            }
            self.cooldown_until = None;
        }
        if self.timeout_count >= self.config.intention.max_timeout_num {
            info!("timeout prompt budget exhausted, entering cooldown");
            self.cooldown_until = Some(
                Instant::now()
                    + Duration::from_secs_f64(self.config.intention.block_time_secs),
            );
            self.timeout_count = 0;
            return;
        }
        self.timeout_count += 1;
        info!(
            silence_secs = silence,
            count = self.timeout_count,
            "user silence timeout, prompting"
        );
        self.cancel_active_generation(true).await;
        self.set_state(DialogueState::TimeoutPrompt);
        self.start_timeout_generation();
    }

    async fn on_backchannel_suggestion(&mut self, iu: IncrementalUnit) {
        let (intensity, expression, action, concept, phrase) = match &iu.payload {
            Payload::Backchannel {
                intensity,
                expression,
                action,
                concept,
                phrase,
            } => (
                *intensity,
                expression.clone(),
                action.clone(),
                concept.clone(),
                phrase.clone(),
            ),
            _ => return,
        };

        // Expression/action/concept always reach the avatar.
        let current_text = self.partial.join(" ");
        self.publish_state(&expression, &action, &concept, Some(&current_text))
            .await;

        let verbal = !phrase.is_empty() || intensity >= VERBAL_INTENSITY_MIN;
        if verbal && self.state.allows_backchannel() {
            let phrase = if phrase.is_empty() { None } else { Some(phrase) };
            self.emit_verbal_backchannel(phrase).await;
        }
    }

    /// Speak a short acknowledgment without touching the main draft.
    async fn emit_verbal_backchannel(&mut self, phrase: Option<String>) {
        if !self.state.allows_backchannel() {
            return;
        }
        if self.verbal_backchannels >= self.config.text_vap.max_verbal_backchannel_num {
            debug!("verbal backchannel budget exhausted for this turn");
            return;
        }
        let phrase = match phrase {
            Some(p) => p,
            None => {
                let configured = &self.config.dialogue.backchannels;
                if configured.is_empty() {
                    return;
                }
                let p = configured[self.backchannel_idx % configured.len()].clone();
                self.backchannel_idx += 1;
                p
            }
        };
        if phrase.is_empty() {
            return;
        }
        self.verbal_backchannels += 1;

        let prev = self.state;
        self.set_state(DialogueState::Backchannel);
        info!(%phrase, "verbal backchannel");
        // A backchannel is a single free-standing ADD; it needs no chain
        // terminator and must not look like a finished system turn.
        let add = IncrementalUnit::add(PRODUCER, Payload::Text { text: phrase });
        self.bus.publish(topics::DIALOGUE_TEXT, add).await;
        self.set_state(prev);
    }

    async fn on_tts(&mut self, iu: IncrementalUnit) {
        if iu.update_type != UpdateType::Commit {
            return;
        }
        // system_finished_speaking.
        if matches!(
            self.state,
            DialogueState::Speaking | DialogueState::TimeoutPrompt
        ) {
            self.set_state(DialogueState::Idle);
            self.publish_state("normal", "wait", "", None).await;
            info!(state = %self.state, "system finished speaking");
        }
    }

    // ── Generation lifecycle ────────────────────────────────────────────

    fn start_generation(&mut self, kind: GenerationKind, user_draft: &str, flushing: bool) {
        self.generation_counter += 1;
        let request = LlmRequest::response(
            &self.config.chatgpt,
            &self.prompts,
            &self.history,
            user_draft,
        );
        let generation = Generation::start(
            self.llm.as_ref(),
            request,
            self.generation_counter,
            Duration::from_secs_f64(self.config.dialogue.response_generation_timeout_secs),
        );
        debug!(
            generation_id = self.generation_counter,
            flushing, "starting response generation"
        );
        self.active = Some(ActiveGeneration {
            generation,
            chunker: Chunker::new(&self.config.chatgpt.split_pattern),
            draft: ResponseDraft::new(user_draft.to_owned(), self.generation_counter),
            kind,
            flushing,
            closing_state: None,
        });
    }

    fn start_timeout_generation(&mut self) {
        self.generation_counter += 1;
        let request =
            LlmRequest::timeout_prompt(&self.config.chatgpt, &self.prompts, &self.history);
        let generation = Generation::start(
            self.llm.as_ref(),
            request,
            self.generation_counter,
            Duration::from_secs_f64(self.config.dialogue.response_generation_timeout_secs),
        );
        self.active = Some(ActiveGeneration {
            generation,
            chunker: Chunker::new(&self.config.chatgpt.split_pattern),
            draft: ResponseDraft::new(String::new(), self.generation_counter),
            kind: GenerationKind::TimeoutPrompt,
            flushing: true,
            closing_state: None,
        });
    }

    /// Cancel the in-flight generation, revoking anything it published.
    async fn cancel_active_generation(&mut self, revoke_published: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.generation.cancel();
        if revoke_published {
            if let Some(tail) = &active.draft.chain_tail {
                debug!(
                    generation_id = active.draft.generation_id,
                    chunks = active.draft.chunks_flushed,
                    "revoking published TEXT chain"
                );
                self.bus
                    .publish(topics::DIALOGUE_TEXT, tail.revoke())
                    .await;
            }
        }
    }

    async fn handle_token(&mut self, token: Result<Option<String>>) {
        match token {
            Ok(Some(token)) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                let chunks = active.chunker.push(&token);
                active.draft.pending_chunks.extend(chunks);
                if active.flushing {
                    self.flush_pending().await;
                }
            }
            Ok(None) => {
                let cancelled = self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.generation.is_cancelled());
                if cancelled {
                    self.active = None;
                    return;
                }
                if let Some(active) = self.active.as_mut() {
                    if let Some(fragment) = active.chunker.finish() {
                        match crate::labels::parse_code_pair(&fragment) {
                            Some(pair) => active.closing_state = Some(pair),
                            None => active.draft.pending_chunks.push(fragment),
                        }
                    }
                    active.draft.completed = true;
                }
                self.maybe_finalize().await;
            }
            Err(e) => self.on_generation_failure(e).await,
        }
    }

    /// LLM failure: revoke what was published, recover locally.
    async fn on_generation_failure(&mut self, e: RemdisError) {
        warn!("generation failed: {e}");
        self.cancel_active_generation(true).await;
        if let Some((text, started, ended)) = self.pending_user.take() {
            // The user turn is committed; record it even though the system
            // produced nothing, then go idle.
            self.history.push_user(&text, started, ended);
            self.set_state(DialogueState::Idle);
        } else {
            self.set_state(DialogueState::Listening);
        }
        self.publish_state("normal", "idle", "", None).await;
    }

    /// Publish completed chunks as ADDs on the draft's TEXT chain.
    async fn flush_pending(&mut self) {
        loop {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            if active.draft.pending_chunks.is_empty() {
                return;
            }
            let chunk = active.draft.pending_chunks.remove(0);
            if !active.draft.partial_text.is_empty() {
                active.draft.partial_text.push(' ');
            }
            active.draft.partial_text.push_str(&chunk);
            let iu = match &active.draft.chain_tail {
                None => IncrementalUnit::add(PRODUCER, Payload::Text { text: chunk }),
                Some(tail) => tail.revision(Payload::Text { text: chunk }),
            };
            active.draft.chain_tail = Some(iu.clone());
            active.draft.chunks_flushed += 1;
            self.bus.publish(topics::DIALOGUE_TEXT, iu).await;

            if matches!(
                self.state,
                DialogueState::Thinking | DialogueState::TimeoutPrompt
            ) {
                self.set_state(DialogueState::Speaking);
                info!(state = %self.state, "first chunk flushed");
                self.publish_state("normal", "speaking", "", None).await;
            }
        }
    }

    /// If the turn is taken and the stream is done, seal the chain and
    /// update the history.
    async fn maybe_finalize(&mut self) {
        let ready = self
            .active
            .as_ref()
            .is_some_and(|a| a.draft.completed && a.flushing);
        if !ready {
            return;
        }
        self.flush_pending().await;
        let Some(active) = self.active.take() else {
            return;
        };

        let full_text = active.draft.partial_text.trim().to_owned();
        match active.draft.chain_tail {
            Some(tail) => {
                self.bus
                    .publish(topics::DIALOGUE_TEXT, tail.commit())
                    .await;
                // State stays Speaking until the TTS commit comes back.
            }
            None => {
                // Nothing speakable came out; no chain to seal.
                self.set_state(DialogueState::Idle);
            }
        }

        if let Some((expression, action)) = active.closing_state {
            self.publish_state(expression, action, "", None).await;
        }

        match active.kind {
            GenerationKind::Response => {
                if let Some((text, started, ended)) = self.pending_user.take() {
                    self.history.push_user(&text, started, ended);
                }
                if !full_text.is_empty() {
                    self.history
                        .push_system(&full_text, active.draft.started_at, now_ts(), false);
                }
            }
            GenerationKind::TimeoutPrompt => {
                if !full_text.is_empty() {
                    self.history
                        .push_system(&full_text, active.draft.started_at, now_ts(), false);
                }
            }
        }
        info!(chars = full_text.len(), "system turn generated");
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn note_user_activity(&mut self, ts: f64) {
        self.last_asr_ts = self.last_asr_ts.max(ts);
        self.timeout_count = 0;
        self.cooldown_until = None;
    }

    /// Log once when the VAP stream has gone silent and turn boundaries
    /// fall back to ASR commits alone.
    fn check_vap_fallback(&mut self) {
        let expected = Duration::from_millis(self.config.vap.expected_period_ms * 2);
        let silent = match self.last_vap_at {
            Some(at) => at.elapsed() > expected,
            None => false,
        };
        if silent && !self.vap_fallback_logged {
            warn!("VAP stream silent, treating ASR commits as turn boundaries");
            self.vap_fallback_logged = true;
        } else if !silent {
            self.vap_fallback_logged = false;
        }
    }

    async fn publish_state(
        &self,
        expression: &str,
        action: &str,
        concept: &str,
        current_text: Option<&str>,
    ) {
        let iu = IncrementalUnit::add(PRODUCER, Payload::SystemState {
            expression: expression.to_owned(),
            action: action.to_owned(),
            concept: concept.to_owned(),
            current_text: current_text.unwrap_or("").to_owned(),
            progress: None,
        });
        self.bus.publish(topics::SYSTEM_STATE, iu).await;
    }
}

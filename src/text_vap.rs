//! Text-based turn-taking support: LLM-driven backchannel and concept
//! inference over the user's partial utterance.
//!
//! Every `text_vap_interval` ASR partials the adapter issues one rate-limited
//! LLM call with the BC prompt and parses the labeled response. Malformed
//! responses are discarded silently; invocations while a call is pending are
//! dropped.

use crate::error::Result;
use crate::iu::{ChainTracker, IncrementalUnit, Payload, UpdateType};
use crate::labels;
use crate::llm::{Generation, LlmRequest, TokenSource};
use crate::prompts::PromptSet;
use crate::runtime::{IncrementalModule, ModuleCtx};
use crate::topics;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Structured reaction parsed from the labeled LLM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emotion_code: u8,
    pub emotion: &'static str,
    pub action_code: u8,
    pub action: &'static str,
    pub concept: String,
}

/// Parse the strict `a:/b:/c:/d:` response format.
///
/// `a:` (analysis) is ignored; `b:` (emotion), `c:` (action), and `d:`
/// (concept) must all be present or the whole response is rejected.
pub fn parse_reaction(response: &str) -> Option<Reaction> {
    let mut emotion = None;
    let mut action = None;
    let mut concept = None;

    for line in response.lines() {
        let line = line.trim();
        if let Some(value) = strip_label(line, 'b') {
            emotion = Some(value.to_owned());
        } else if let Some(value) = strip_label(line, 'c') {
            action = Some(value.to_owned());
        } else if let Some(value) = strip_label(line, 'd') {
            concept = Some(value.trim_matches(['"', '\'']).to_owned());
        }
    }

    let emotion = emotion?;
    let action = action?;
    let concept = concept?;
    if concept.is_empty() {
        return None;
    }
    Some(Reaction {
        emotion_code: labels::expression_code(&emotion),
        emotion: labels::resolve_expression(&emotion),
        action_code: labels::action_code(&action),
        action: labels::resolve_action(&action),
        concept,
    })
}

fn strip_label(line: &str, label: char) -> Option<&str> {
    let mut chars = line.chars();
    let head = chars.next()?;
    if head.to_ascii_lowercase() != label {
        return None;
    }
    let rest = chars.as_str().trim_start();
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim())
}

/// The text-VAP module.
pub struct TextVap {
    llm: Arc<dyn TokenSource>,
    prompts: PromptSet,
    tracker: ChainTracker,
    accumulated: Vec<String>,
    partials_since_call: usize,
    /// One in-flight reaction call at a time.
    pending: Arc<AtomicBool>,
    /// Verbal suggestions emitted during the current user turn.
    verbal_count: Arc<AtomicUsize>,
}

impl TextVap {
    pub fn new(llm: Arc<dyn TokenSource>, prompts: PromptSet) -> Self {
        Self {
            llm,
            prompts,
            tracker: ChainTracker::new(),
            accumulated: Vec::new(),
            partials_since_call: 0,
            pending: Arc::new(AtomicBool::new(false)),
            verbal_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fire one rate-limited reaction inference for the current text.
    fn trigger(&self, ctx: &ModuleCtx, utterance: String) {
        if self.pending.swap(true, Ordering::AcqRel) {
            debug!("reaction call already pending, dropping invocation");
            return;
        }
        let llm = Arc::clone(&self.llm);
        let prompts = self.prompts.clone();
        let ctx = ctx.clone();
        let pending = Arc::clone(&self.pending);
        let verbal_count = Arc::clone(&self.verbal_count);

        tokio::spawn(async move {
            let config = ctx.config().clone();
            let request = LlmRequest::reaction(
                &config.chatgpt,
                config.text_vap_model(),
                &prompts,
                &utterance,
            );
            let generation = Generation::start(
                llm.as_ref(),
                request,
                0,
                Duration::from_secs_f64(config.dialogue.response_generation_timeout_secs),
            );
            let outcome = generation.collect().await;
            pending.store(false, Ordering::Release);

            let response = match outcome {
                Ok(r) => r,
                Err(e) => {
                    warn!("reaction inference failed: {e}");
                    return;
                }
            };
            let Some(reaction) = parse_reaction(&response) else {
                debug!("discarding malformed reaction response");
                return;
            };

            // Intensity rides on the emotion code; the verbal budget demotes
            // excess suggestions to state-only updates.
            let mut intensity = reaction.emotion_code.clamp(1, 9);
            let budget = config.text_vap.max_verbal_backchannel_num;
            if intensity >= 5 {
                if verbal_count.load(Ordering::Acquire) >= budget {
                    intensity = 4;
                } else {
                    verbal_count.fetch_add(1, Ordering::AcqRel);
                }
            }

            let iu = IncrementalUnit::add("text_vap", Payload::Backchannel {
                intensity,
                expression: reaction.emotion.to_owned(),
                action: reaction.action.to_owned(),
                concept: reaction.concept.clone(),
                phrase: String::new(),
            });
            ctx.publish(topics::BC_SUGGEST, iu).await;
        });
    }

    fn reset_turn(&mut self) {
        self.accumulated.clear();
        self.partials_since_call = 0;
        self.verbal_count.store(0, Ordering::Release);
    }
}

#[async_trait]
impl IncrementalModule for TextVap {
    fn name(&self) -> &'static str {
        "text_vap"
    }

    async fn on_iu(&mut self, topic: &str, iu: IncrementalUnit, ctx: &ModuleCtx) -> Result<()> {
        if !self.tracker.admit_or_log(&iu) {
            return Ok(());
        }
        match topic {
            topics::ASR_PARTIAL => match (&iu.update_type, &iu.payload) {
                (UpdateType::Add, Payload::AsrToken { text, .. }) => {
                    if iu.previous_id.is_none() {
                        self.accumulated.clear();
                    }
                    if text.is_empty() {
                        return Ok(());
                    }
                    self.accumulated.push(text.clone());
                    self.partials_since_call += 1;
                    if self.partials_since_call >= ctx.config().text_vap.text_vap_interval {
                        self.partials_since_call = 0;
                        self.trigger(ctx, self.accumulated.join(" "));
                    }
                }
                (UpdateType::Revoke, _) => {
                    self.accumulated.clear();
                    self.partials_since_call = 0;
                }
                _ => {}
            },
            topics::ASR_COMMIT => {
                if iu.update_type == UpdateType::Add {
                    self.reset_turn();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

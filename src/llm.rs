//! Streaming LLM adapter: token sources, cancellation, first-token
//! deadline, and punctuation chunking.
//!
//! The adapter owns no dialogue policy. It turns a prompt into a lazy,
//! finite, cancellable sequence of text tokens; the dialogue controller
//! decides what to do with them.

use crate::config::ChatGptConfig;
use crate::dialogue::history::DialogueHistory;
use crate::error::{RemdisError, Result};
use crate::prompts::{self, PromptSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

/// Capacity of the token channel between an HTTP reader and a consumer.
const TOKEN_CHANNEL_SIZE: usize = 64;

/// Cooperative cancellation flag with a wakeup channel.
///
/// Sources poll [`CancelToken::is_cancelled`] between tokens; waiters can
/// also await [`CancelToken::cancelled`]. Honoring the token stops emission
/// within one token of the signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    wakeup: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake any waiters.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Relaxed);
        self.inner.wakeup.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Relaxed)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.wakeup.notified().await;
        }
    }
}

/// One message of a chat-completions request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// A prepared generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
}

impl LlmRequest {
    /// Build the main response request: trimmed history, the RESP template,
    /// an acknowledgment turn, then the user draft.
    pub fn response(
        config: &ChatGptConfig,
        prompt_set: &PromptSet,
        history: &DialogueHistory,
        user_draft: &str,
    ) -> Self {
        let mut messages = history.context_messages(config.max_message_num_in_context);
        messages.push(ChatMessage::user(prompts::render(
            &prompt_set.resp,
            history,
            user_draft,
        )));
        messages.push(ChatMessage::system("OK"));
        messages.push(ChatMessage::user(user_draft.to_owned()));
        Self {
            model: config.response_generation_model.clone(),
            messages,
            max_tokens: config.max_tokens,
        }
    }

    /// Build the self-initiated request used after a user silence timeout.
    pub fn timeout_prompt(
        config: &ChatGptConfig,
        prompt_set: &PromptSet,
        history: &DialogueHistory,
    ) -> Self {
        let mut messages = history.context_messages(config.max_message_num_in_context);
        messages.push(ChatMessage::user(prompts::render(
            &prompt_set.timeout,
            history,
            "",
        )));
        Self {
            model: config.response_generation_model.clone(),
            messages,
            max_tokens: config.max_tokens,
        }
    }

    /// Build the reaction-inference request for the text-VAP adapter.
    pub fn reaction(
        config: &ChatGptConfig,
        model: &str,
        prompt_set: &PromptSet,
        utterance: &str,
    ) -> Self {
        Self {
            model: model.to_owned(),
            messages: vec![
                ChatMessage::user(prompt_set.bc.clone()),
                ChatMessage::system("OK. I will answer in the a:/b:/c:/d: format."),
                ChatMessage::user(utterance.to_owned()),
            ],
            max_tokens: config.max_tokens,
        }
    }
}

/// Token stream handed back by a [`TokenSource`]. Closed channel means the
/// stream ended; an `Err` item reports a mid-stream failure.
pub type TokenRx = mpsc::Receiver<Result<String>>;

/// Anything that can turn a request into a token stream.
///
/// Implementations must produce tokens in model order, never reorder or
/// merge, and stop within one token of `cancel`.
pub trait TokenSource: Send + Sync {
    fn stream(&self, request: LlmRequest, cancel: CancelToken) -> TokenRx;
}

/// An in-flight generation with its first-token deadline.
pub struct Generation {
    rx: TokenRx,
    cancel: CancelToken,
    /// Absolute deadline for the first token, so re-polling `next_token`
    /// from a select loop never restarts the clock.
    first_deadline: tokio::time::Instant,
    first_token_timeout: Duration,
    awaiting_first: bool,
    /// Controller-assigned id, used to match REVOKEs to drafts.
    pub id: u64,
}

impl Generation {
    /// Start a generation against `source`.
    pub fn start(
        source: &dyn TokenSource,
        request: LlmRequest,
        id: u64,
        first_token_timeout: Duration,
    ) -> Self {
        let cancel = CancelToken::new();
        let rx = source.stream(request, cancel.clone());
        Self {
            rx,
            cancel,
            first_deadline: tokio::time::Instant::now() + first_token_timeout,
            first_token_timeout,
            awaiting_first: true,
            id,
        }
    }

    /// Cooperatively stop the source; tokens already in flight are dropped
    /// by the caller.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next token, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// `LlmTimeout` when the first token misses its deadline; any error the
    /// source reported mid-stream.
    pub async fn next_token(&mut self) -> Result<Option<String>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let item = if self.awaiting_first {
            match tokio::time::timeout_at(self.first_deadline, self.rx.recv()).await {
                Ok(item) => item,
                Err(_) => {
                    self.cancel.cancel();
                    return Err(RemdisError::LlmTimeout(
                        self.first_token_timeout.as_secs_f64(),
                    ));
                }
            }
        } else {
            self.rx.recv().await
        };
        match item {
            Some(Ok(token)) => {
                self.awaiting_first = false;
                Ok(Some(token))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Drain the whole stream into one string (non-streaming callers).
    ///
    /// # Errors
    ///
    /// Propagates the first stream error, including the first-token timeout.
    pub async fn collect(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(token) = self.next_token().await? {
            out.push_str(&token);
        }
        Ok(out)
    }
}

/// OpenAI-compatible chat-completions backend streaming over SSE.
///
/// The blocking `ureq` reader runs on the blocking pool and feeds an async
/// channel, checking the cancel token on every line.
pub struct ApiLlm {
    api_url: String,
    api_key: String,
    agent: ureq::Agent,
}

impl ApiLlm {
    pub fn new(config: &ChatGptConfig) -> Self {
        Self {
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            agent: ureq::agent(),
        }
    }

    fn completions_url(&self) -> String {
        let base = self
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.api_url)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

impl TokenSource for ApiLlm {
    fn stream(&self, request: LlmRequest, cancel: CancelToken) -> TokenRx {
        let (token_tx, token_rx) = mpsc::channel::<Result<String>>(TOKEN_CHANNEL_SIZE);

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();
        let body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "max_tokens": request.max_tokens,
        });

        let url = self.completions_url();
        let agent = self.agent.clone();
        let api_key = self.api_key.clone();

        tokio::task::spawn_blocking(move || {
            let body_str = match serde_json::to_string(&body) {
                Ok(s) => s,
                Err(e) => {
                    let _ = token_tx
                        .blocking_send(Err(RemdisError::Llm(format!("request encode: {e}"))));
                    return;
                }
            };

            let mut req = agent.post(&url).set("Content-Type", "application/json");
            if !api_key.is_empty() {
                let auth = format!("Bearer {api_key}");
                req = req.set("Authorization", &auth);
            }

            let response = match req.send_string(&body_str) {
                Ok(r) => r,
                Err(e) => {
                    let _ =
                        token_tx.blocking_send(Err(RemdisError::Llm(format!("request: {e}"))));
                    return;
                }
            };

            let reader = std::io::BufReader::new(response.into_reader());
            for line in std::io::BufRead::lines(reader) {
                if cancel.is_cancelled() {
                    debug!("LLM stream cancelled");
                    break;
                }
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        let _ =
                            token_tx.blocking_send(Err(RemdisError::Llm(format!("read: {e}"))));
                        return;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break;
                }
                let chunk: serde_json::Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = token_tx
                            .blocking_send(Err(RemdisError::Llm(format!("SSE parse: {e}"))));
                        return;
                    }
                };
                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                    if !content.is_empty()
                        && token_tx.blocking_send(Ok(content.to_owned())).is_err()
                    {
                        break;
                    }
                }
                if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break;
                }
            }
        });

        token_rx
    }
}

/// Buffers streamed tokens and flushes a speakable chunk whenever the
/// buffer ends in a split character, the `/` phrase marker arrives, or the
/// stream finishes.
pub struct Chunker {
    buffer: String,
    split_chars: Vec<char>,
}

impl Chunker {
    /// `pattern` is a character class such as `[,.?!]`; brackets optional.
    pub fn new(pattern: &str) -> Self {
        let split_chars = pattern
            .trim_start_matches('[')
            .trim_end_matches(']')
            .chars()
            .collect();
        Self {
            buffer: String::new(),
            split_chars,
        }
    }

    /// Feed one token; returns zero or more completed chunks.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        let force_flush = token.contains('/');
        for c in token.chars() {
            if c != '/' {
                self.buffer.push(c);
            }
        }

        let mut chunks = Vec::new();
        loop {
            let split_at = self
                .buffer
                .char_indices()
                .find(|(_, c)| self.split_chars.contains(c))
                .map(|(i, c)| i + c.len_utf8());
            match split_at {
                Some(end) => {
                    let chunk: String = self.buffer.drain(..end).collect();
                    let chunk = chunk.trim().to_owned();
                    if !chunk.is_empty() {
                        chunks.push(chunk);
                    }
                }
                None => break,
            }
        }

        if force_flush {
            if let Some(rest) = self.take_remainder() {
                chunks.push(rest);
            }
        }
        chunks
    }

    /// Flush whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.take_remainder()
    }

    fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedLlm;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn chunker_flushes_on_split_chars() {
        let mut chunker = Chunker::new("[,.?!]");
        assert!(chunker.push("Hello").is_empty());
        assert_eq!(chunker.push(" there,"), vec!["Hello there,"]);
        assert!(chunker.push(" how are").is_empty());
        assert_eq!(chunker.push(" you?"), vec!["how are you?"]);
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn chunker_honors_phrase_marker() {
        let mut chunker = Chunker::new("[,.?!]");
        assert!(chunker.push("well").is_empty());
        assert_eq!(chunker.push(" then/"), vec!["well then"]);
    }

    #[test]
    fn chunker_flushes_remainder_at_finish() {
        let mut chunker = Chunker::new("[,.?!]");
        chunker.push("trailing words");
        assert_eq!(chunker.finish(), Some("trailing words".to_owned()));
    }

    #[test]
    fn chunker_splits_mid_token() {
        let mut chunker = Chunker::new("[,.?!]");
        assert_eq!(chunker.push("one. two."), vec!["one.", "two."]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_timeout_fails_generation() {
        let source = ScriptedLlm::new(tokens(&["late"])).with_first_delay(Duration::from_secs(10));
        let mut generation =
            Generation::start(&source, request_stub(), 1, Duration::from_secs(3));
        match generation.next_token().await {
            Err(RemdisError::LlmTimeout(secs)) => assert!((secs - 3.0).abs() < f64::EPSILON),
            other => unreachable!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tokens_arrive_in_order() {
        let source = ScriptedLlm::new(tokens(&["a", "b", "c"]));
        let generation = Generation::start(&source, request_stub(), 1, Duration::from_secs(3));
        assert_eq!(generation.collect().await.expect("collect"), "abc");
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let source =
            ScriptedLlm::new(tokens(&["a", "b", "c", "d"])).with_token_delay(Duration::from_millis(20));
        let mut generation =
            Generation::start(&source, request_stub(), 1, Duration::from_secs(3));
        let first = generation.next_token().await.expect("first token");
        assert_eq!(first.as_deref(), Some("a"));
        generation.cancel();
        // Post-cancel the stream yields nothing further to the caller.
        assert_eq!(generation.next_token().await.expect("post cancel"), None);
    }

    fn request_stub() -> LlmRequest {
        LlmRequest {
            model: "stub".to_owned(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 16,
        }
    }
}

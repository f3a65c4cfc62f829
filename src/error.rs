//! Error types for the remdis framework.

/// Top-level error type for the dialogue system.
#[derive(Debug, thiserror::Error)]
pub enum RemdisError {
    /// Configuration load or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Message bus error (publish, subscribe, startup).
    #[error("bus error: {0}")]
    Bus(String),

    /// The LLM did not produce its first token within the deadline.
    #[error("LLM first token timed out after {0:.1}s")]
    LlmTimeout(f64),

    /// Language model request or streaming error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech recognizer adapter error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Speech synthesis adapter error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// An IU referenced an ancestor this consumer has never observed.
    #[error("causality violation: {0}")]
    Causality(String),

    /// An IU violated the revision protocol (e.g. ADD on a committed chain).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl RemdisError {
    /// Process exit code for this error when it escapes `main`.
    ///
    /// 0 is reserved for normal shutdown; 64 configuration error; 69 bus
    /// unavailable after the retry budget; 70 any other internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 64,
            Self::Bus(_) => 69,
            _ => 70,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RemdisError>;

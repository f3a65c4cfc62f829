//! Logical bus topic names.

/// Raw microphone frames.
pub const AUDIO_IN: &str = "audio.in";
/// Incremental ASR tokens (ADD/REVOKE).
pub const ASR_PARTIAL: &str = "asr.partial";
/// Final user utterances (COMMIT).
pub const ASR_COMMIT: &str = "asr.commit";
/// Turn-shift probabilities from the VAP model.
pub const VAP_PROB: &str = "vap.prob";
/// Silence watchdog signals.
pub const INTENT_TIMEOUT: &str = "intent.timeout";
/// System text chunks bound for TTS.
pub const DIALOGUE_TEXT: &str = "dialogue.text";
/// Synthesized audio frames.
pub const TTS_AUDIO: &str = "tts.audio";
/// Speaker output frames.
pub const AUDIO_OUT: &str = "audio.out";
/// Avatar/UI state updates.
pub const SYSTEM_STATE: &str = "system.state";
/// Backchannel suggestions from the text-VAP adapter.
pub const BC_SUGGEST: &str = "bc.suggest";

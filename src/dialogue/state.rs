//! Turn-taking states of the dialogue controller.

use std::fmt;

/// Controller state. Transitions are owned by the controller; this type
/// only names the states and what they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialogueState {
    /// No user activity; waiting.
    #[default]
    Idle,
    /// User ASR partials arriving.
    Listening,
    /// Turn taken; waiting for the first speakable chunk.
    Thinking,
    /// System TEXT chunks being flushed to TTS.
    Speaking,
    /// Short verbal acknowledgment in progress.
    Backchannel,
    /// Generating a filler because user silence exceeded the threshold.
    TimeoutPrompt,
}

impl DialogueState {
    /// Whether a verbal backchannel may start in this state.
    pub fn allows_backchannel(self) -> bool {
        !matches!(self, Self::Speaking)
    }
}

impl fmt::Display for DialogueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Backchannel => "backchannel",
            Self::TimeoutPrompt => "timeout_prompt",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaking_blocks_backchannels() {
        assert!(!DialogueState::Speaking.allows_backchannel());
        assert!(DialogueState::Idle.allows_backchannel());
        assert!(DialogueState::Listening.allows_backchannel());
    }

    #[test]
    fn display_names_are_stable() {
        assert_eq!(DialogueState::TimeoutPrompt.to_string(), "timeout_prompt");
        assert_eq!(DialogueState::Idle.to_string(), "idle");
    }
}

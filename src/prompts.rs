//! Prompt templates for response generation, reaction inference, and
//! timeout prompting.
//!
//! Templates are external text files parameterized by `{history}` and
//! `{user_draft}`. Inline defaults keep the system usable when no files are
//! configured.

use crate::config::PromptPaths;
use crate::dialogue::history::DialogueHistory;
use crate::error::Result;

const DEFAULT_RESP: &str = "You are a spoken dialogue agent. Reply to the user in short \
spoken-style sentences. Mark the end of each speakable phrase with `/` and close the whole \
reply with an expression and action code pair such as `1_joy|2_nod`.";

const DEFAULT_BC: &str = "Analyze the user utterance in progress and answer in exactly four \
labeled lines:\na: <brief analysis>\nb: <emotion id_label>\nc: <action id_label>\nd: <central \
concept phrase>";

const DEFAULT_TIMEOUT: &str = "The user has been silent. Considering the dialogue so far:\n\
{history}\nProduce a short friendly utterance that invites the user to continue. Mark phrase \
ends with `/` and close with an expression and action code pair.";

/// The three loaded prompt templates.
#[derive(Debug, Clone)]
pub struct PromptSet {
    /// Main response generation.
    pub resp: String,
    /// Backchannel / concept extraction.
    pub bc: String,
    /// Timeout (self-initiated) prompting.
    pub timeout: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            resp: DEFAULT_RESP.to_owned(),
            bc: DEFAULT_BC.to_owned(),
            timeout: DEFAULT_TIMEOUT.to_owned(),
        }
    }
}

impl PromptSet {
    /// Load templates from the configured paths, keeping the inline default
    /// for any path that is not set.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when a configured file cannot be read.
    pub fn load(paths: &PromptPaths) -> Result<Self> {
        let mut set = Self::default();
        if let Some(p) = &paths.resp {
            set.resp = std::fs::read_to_string(p)?;
        }
        if let Some(p) = &paths.bc {
            set.bc = std::fs::read_to_string(p)?;
        }
        if let Some(p) = &paths.timeout {
            set.timeout = std::fs::read_to_string(p)?;
        }
        Ok(set)
    }
}

/// Substitute `{history}` and `{user_draft}` placeholders in a template.
pub fn render(template: &str, history: &DialogueHistory, user_draft: &str) -> String {
    template
        .replace("{history}", &history.render())
        .replace("{user_draft}", user_draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_used_without_paths() {
        let set = PromptSet::load(&PromptPaths::default()).expect("load");
        assert!(set.resp.contains("spoken dialogue"));
        assert!(set.bc.contains("a:"));
    }

    #[test]
    fn configured_file_overrides_default() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "custom template {{user_draft}}").expect("write");
        let paths = PromptPaths {
            resp: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let set = PromptSet::load(&paths).expect("load");
        assert!(set.resp.starts_with("custom template"));
    }

    #[test]
    fn render_substitutes_placeholders() {
        let history = DialogueHistory::new(5);
        let out = render("draft={user_draft} hist=[{history}]", &history, "hello");
        assert_eq!(out, "draft=hello hist=[]");
    }

    #[test]
    fn missing_file_is_an_error() {
        let paths = PromptPaths {
            bc: Some("/nonexistent/prompt.txt".into()),
            ..Default::default()
        };
        assert!(PromptSet::load(&paths).is_err());
    }
}

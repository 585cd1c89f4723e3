//! Prompt assembly for text turns.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// One earlier message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
        }
    }

    fn transcript_line(&self) -> String {
        match self.speaker {
            Speaker::User => format!("User: {}", self.text),
            Speaker::Assistant => format!("Assistant: {}", self.text),
        }
    }
}

/// Build the text sent to the engine.
///
/// `history` is in chronological order. Only the `window` most recent turns
/// are kept, rendered oldest first.
pub fn build_prompt(input: &str, history: &[ChatTurn], window: usize) -> String {
    let recent = &history[history.len().saturating_sub(window)..];
    if recent.is_empty() {
        return input.to_string();
    }

    let mut prompt = String::from("Previous conversation:\n");
    for turn in recent {
        prompt.push_str(&turn.transcript_line());
        prompt.push('\n');
    }
    prompt.push_str("\nNow respond to: ");
    prompt.push_str(input);
    prompt
}

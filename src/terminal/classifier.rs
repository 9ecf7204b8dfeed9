use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

/// Only the end of the captured output is inspected.
pub(crate) const TAIL_WINDOW_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionState {
    Unknown,
    Finished,
    Interactive,
}

/// Outcome of inspecting the capture at one poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep waiting.
    Pending,
    /// A prompt pattern matched; resolve after the grace period.
    Prompt(CompletionState),
    /// Output has been silent past the ceiling; resolve immediately.
    Silence,
}

impl Verdict {
    pub fn state(self) -> CompletionState {
        match self {
            Verdict::Pending => CompletionState::Unknown,
            Verdict::Prompt(state) => state,
            Verdict::Silence => CompletionState::Interactive,
        }
    }
}

pub trait CompletionClassifier: Send + Sync {
    fn classify(&self, capture: &str, idle: Duration) -> Verdict;
}

fn unix_prompt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z0-9@._~-]+[:/\\].*?[#$%>])\s*$").expect("unix prompt pattern is valid")
    })
}

fn windows_prompt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-zA-Z]:\\.*>\s*$").expect("windows prompt pattern is valid"))
}

fn interactive_prompt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:[?:]|\[[yY]/[nN]\])\s*$").expect("interactive prompt pattern is valid")
    })
}

/// Recognises shell prompts and question-style prompts at the end of the output.
///
/// Shell prompts win over question prompts, so `host:/tmp$` is never reported
/// as interactive even though it contains a `:`.
#[derive(Debug, Clone)]
pub struct PromptClassifier {
    silence_ceiling: Duration,
}

impl PromptClassifier {
    pub fn new(silence_ceiling: Duration) -> Self {
        Self { silence_ceiling }
    }
}

impl CompletionClassifier for PromptClassifier {
    fn classify(&self, capture: &str, idle: Duration) -> Verdict {
        let tail = tail_window(capture.trim_end());

        if unix_prompt().is_match(tail) || windows_prompt().is_match(tail) {
            return Verdict::Prompt(CompletionState::Finished);
        }
        if interactive_prompt().is_match(tail) {
            return Verdict::Prompt(CompletionState::Interactive);
        }
        if idle > self.silence_ceiling {
            return Verdict::Silence;
        }
        Verdict::Pending
    }
}

fn tail_window(text: &str) -> &str {
    if text.len() <= TAIL_WINDOW_BYTES {
        return text;
    }
    let mut start = text.len() - TAIL_WINDOW_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

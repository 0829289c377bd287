//! Extraction helpers for LLM completions.
//!
//! Models are prompted to wrap their output in tags (`<CODE>`, `<ANSWER>`,
//! `<DATA>`) or fenced blocks; these functions pull the payload back out.
//! All matching is non-greedy and spans newlines.

use std::sync::LazyLock;

use regex::Regex;

static THINKING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<thinking>.*?</thinking>\s*").unwrap());
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s).*```(?:json|python)\s*(.*?)```").unwrap());
static CODE_RE: LazyLock<Regex> = LazyLock::new(|| tag_regex("CODE"));
static ANSWER_RE: LazyLock<Regex> = LazyLock::new(|| tag_regex("ANSWER"));
static DATA_RE: LazyLock<Regex> = LazyLock::new(|| tag_regex("DATA"));

/// Returned by [`tag_answer`] when the completion carries no answer.
pub const NO_ANSWER: &str = "I don't know";

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).unwrap()
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Strip every `<thinking>…</thinking>` block and the whitespace after it.
pub fn remove_thinking(text: &str) -> String {
    THINKING_RE.replace_all(text, "").into_owned()
}

/// Body of the last fenced `json` or `python` block, or `text` unchanged.
pub fn remove_markdown(text: &str) -> String {
    first_capture(&FENCE_RE, text).unwrap_or_else(|| text.to_string())
}

/// Content of the first `<CODE>` tag, or an empty string.
pub fn tag_code(text: &str) -> String {
    first_capture(&CODE_RE, text).unwrap_or_default()
}

/// Content of the first `<ANSWER>` tag, or [`NO_ANSWER`].
pub fn tag_answer(text: &str) -> String {
    first_capture(&ANSWER_RE, text).unwrap_or_else(|| NO_ANSWER.to_string())
}

/// Content of the first `<DATA>` tag, or an empty string.
pub fn tag_data(text: &str) -> String {
    first_capture(&DATA_RE, text).unwrap_or_default()
}

/// Loose boolean parsing for flags read from the environment.
///
/// Case-insensitive, and surrounding whitespace is ignored so a value
/// like `"yes\n"` from a shell file still counts.
pub fn parse_flag(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "true" | "1" | "t" | "y" | "yes"
    )
}

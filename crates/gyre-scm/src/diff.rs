use regex::Regex;
use std::sync::OnceLock;

fn fenced_diff_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?ms)^[ \t]*```(?:diff|patch)[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*$")
            .expect("fenced diff pattern compiles")
    })
}

/// Extract a unified diff from implementation text.
///
/// Accepted forms, in order of preference:
/// 1. a fenced block labeled `diff` (or `patch`); the inner bytes are
///    returned exactly as written;
/// 2. an inline body starting at the first line that begins with
///    `diff --git `, running to the end of the text (or to a closing fence).
pub fn extract_unified_diff(text: &str) -> Option<String> {
    if let Some(captures) = fenced_diff_pattern().captures(text) {
        let inner = captures.get(1)?.as_str();
        if inner.contains("diff --git ") {
            return Some(inner.to_string());
        }
    }

    let start = if text.starts_with("diff --git ") {
        Some(0)
    } else {
        text.find("\ndiff --git ").map(|index| index + 1)
    };
    let start = start?;
    let body = &text[start..];
    let end = body.find("\n```").map(|index| index + 1).unwrap_or(body.len());
    let diff = &body[..end];
    if diff.trim().is_empty() {
        None
    } else {
        Some(diff.to_string())
    }
}

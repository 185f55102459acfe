use regex::Regex;
use std::sync::OnceLock;

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // API keys
            (r"sk-[a-zA-Z0-9_\-]{20,}", "[MASKED]"),
            (r"pk-[a-zA-Z0-9]{20,}", "[MASKED]"),
            // GitHub tokens
            (r"\b(?:ghp|gho|ghu|ghs|ghr)_[A-Za-z0-9]{20,}", "[MASKED]"),
            (r"\bgithub_pat_[A-Za-z0-9_]{20,}", "[MASKED]"),
            // AWS access key ids
            (r"\bAKIA[0-9A-Z]{16}\b", "[MASKED]"),
            // Bearer tokens
            (r"Bearer\s+[a-zA-Z0-9._\-]+", "Bearer [MASKED]"),
            // key=value patterns
            (
                r"(?i)(password|secret|token|key|api_key|apikey)=[^\s&]+",
                "$1=[MASKED]",
            ),
        ]
        .into_iter()
        .filter_map(|(p, r)| Regex::new(p).ok().map(|re| (re, r)))
        .collect()
    })
}

/// Replace credentials that commonly leak into CI output.
pub fn mask_secrets(text: &str) -> String {
    let mut result = text.to_string();
    for (re, replacement) in patterns() {
        result = re.replace_all(&result, *replacement).into_owned();
    }
    result
}

/// Keep the last `max_chars` characters, the end of a log being where the
/// failure usually is.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max_chars).collect();
    format!("[... {} earlier characters omitted ...]\n{kept}", count - max_chars)
}

/// Mask, then truncate, user-supplied log text.
pub fn sanitize_logs(text: &str, max_chars: usize) -> String {
    truncate_tail(&mask_secrets(text), max_chars)
}

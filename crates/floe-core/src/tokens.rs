use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// Get or initialize the cl100k_base tokenizer. `None` if it failed to load,
/// in which case estimates fall back to a chars/4 heuristic.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "cl100k_base tokenizer unavailable, using char estimate");
                None
            }
        })
        .as_ref()
}

/// Token count using BPE tokenization (cl100k_base).
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Token count of a JSON value in its compact serialized form.
pub fn estimate_json_tokens(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 0,
        serde_json::Value::String(s) => estimate_tokens(s),
        other => estimate_tokens(&other.to_string()),
    }
}

/// Truncate text to at most `max_chars` characters, preferring a newline
/// boundary. Appends `[truncated]` if shortened.
pub fn compact_text(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut = content
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    let truncated = &content[..cut];
    match truncated.rfind('\n') {
        Some(nl) if nl > 0 => format!("{}\n[truncated]", &content[..nl]),
        _ => format!("{}\n[truncated]", truncated),
    }
}

/// Keep the tail of `text` so that it fits in roughly `max_tokens` tokens.
/// Used to shrink rolling summaries, where recent content matters most.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    if max_tokens == 0 {
        return String::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut keep = (max_tokens * 4).min(chars.len());
    loop {
        let tail: String = chars[chars.len() - keep..].iter().collect();
        if estimate_tokens(&tail) <= max_tokens || keep <= 1 {
            return tail;
        }
        keep = keep * 3 / 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_longer() {
        let text = "The quick brown fox jumps over the lazy dog.";
        let tokens = estimate_tokens(text);
        assert!(tokens > 0 && tokens < text.len());
    }

    #[test]
    fn test_estimate_json_tokens() {
        assert_eq!(estimate_json_tokens(&serde_json::Value::Null), 0);
        assert!(estimate_json_tokens(&serde_json::json!({"docs": ["a", "b"]})) > 0);
    }

    #[test]
    fn test_compact_text_short() {
        assert_eq!(compact_text("short output", 100), "short output");
    }

    #[test]
    fn test_compact_text_truncates_at_newline() {
        let result = compact_text("line1\nline2\nline3", 8);
        assert_eq!(result, "line1\n[truncated]");
    }

    #[test]
    fn test_truncate_to_tokens_keeps_tail() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let out = truncate_to_tokens(text, 3);
        assert!(estimate_tokens(&out) <= 3);
        assert!(text.ends_with(&out));
    }
}

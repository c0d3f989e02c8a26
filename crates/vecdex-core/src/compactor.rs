//! The document compactor interface (§6): a budget-enforcing transformer
//! from over-budget text to under-budget text, LLM-backed with a
//! deterministic hard-trim fallback the batch indexer always applies on top.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub text: String,
    pub was_compacted: bool,
}

#[async_trait]
pub trait Compactor: Send + Sync {
    /// Attempt to bring `text` under `target_bytes` UTF-8 bytes. Callers
    /// must not assume the result actually fits — a hard trim fallback is
    /// always applied afterwards (§4.5 step 2).
    async fn compact(
        &self,
        id: &str,
        text: &str,
        record_type: Option<&str>,
        target_bytes: usize,
    ) -> anyhow::Result<CompactionOutcome>;
}

/// Truncate `text` to the last complete UTF-8 scalar value boundary at or
/// before `target_bytes`. This is the deterministic fallback applied when a
/// [`Compactor`] either fails or still returns oversize text.
pub fn hard_trim(text: &str, target_bytes: usize) -> String {
    if text.len() <= target_bytes {
        return text.to_string();
    }
    let mut end = target_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_trim_is_noop_under_budget() {
        assert_eq!(hard_trim("hello", 16), "hello");
    }

    #[test]
    fn hard_trim_respects_utf8_boundaries() {
        let text = "a\u{1F600}b"; // emoji is 4 bytes
        // budget lands inside the emoji's byte sequence
        let trimmed = hard_trim(text, 2);
        assert!(trimmed.is_char_boundary(trimmed.len()));
        assert!(trimmed.len() <= 2);
    }
}

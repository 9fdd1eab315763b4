//! Utility functions and helpers

/// Truncate a string to at most `max_chars` characters, marking the cut with "..."
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let head: String = s.chars().take(keep).collect();
    format!("{}...", head)
}

/// One-line preview of message text for listings
pub fn preview(text: &str, max_chars: usize) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&flattened, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("test", 3), "...");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("你好世界你好", 5), "你好...");
    }

    #[test]
    fn test_preview_flattens_whitespace() {
        assert_eq!(preview("line one\n\n  line two", 40), "line one line two");
    }
}

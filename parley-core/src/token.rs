//! Lightweight token estimation.
//!
//! Runs on every context-window build, so it is a single pass over the
//! characters with no tokenizer tables: ASCII letters cost a quarter token,
//! other ASCII half a token, and anything wider (CJK, emoji, accented text)
//! one and a half tokens.

/// Estimates model-input size of a text
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Character-class weighted estimator
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        estimate_token_length(text)
    }
}

/// Estimate the token count of `text`
pub fn estimate_token_length(text: &str) -> usize {
    // quarter-token units keep the sum exact
    let quarters: usize = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphabetic() {
                1
            } else if c.is_ascii() {
                2
            } else {
                6
            }
        })
        .sum();
    quarters.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_free() {
        assert_eq!(estimate_token_length(""), 0);
    }

    #[test]
    fn test_ascii_letters_are_cheap() {
        assert_eq!(estimate_token_length("abcd"), 1);
        assert_eq!(estimate_token_length("abcdefgh"), 2);
        assert_eq!(estimate_token_length("abcde"), 2);
    }

    #[test]
    fn test_wide_characters_cost_more() {
        assert_eq!(estimate_token_length("你好"), 3);
        assert!(estimate_token_length("你好世界") > estimate_token_length("helloworld"));
    }

    #[test]
    fn test_monotonic_in_length() {
        let mut previous = 0;
        let mut text = String::new();
        for c in "mixed 文本 with ümlauts!".chars() {
            text.push(c);
            let current = estimate_token_length(&text);
            assert!(current >= previous);
            previous = current;
        }
    }
}

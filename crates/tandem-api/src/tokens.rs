//! Cheap local token accounting.
//!
//! `cl100k_base` is used as a lower-bound estimator whenever the model's own
//! encoding is unknown (always the case on the Google path).

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

fn cl100k() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base is bundled"))
}

/// Estimate the token count of `text` for `model`. Falls back to
/// `cl100k_base` when the model has no known encoding.
pub fn estimate_tokens(text: &str, model: &str) -> i64 {
    match tiktoken_rs::get_bpe_from_model(model) {
        Ok(bpe) => bpe.encode_ordinary(text).len() as i64,
        Err(_) => {
            if !model.is_empty() {
                warn!(model, "no declared encoding, estimating with cl100k_base");
            }
            cl100k().encode_ordinary(text).len() as i64
        }
    }
}

/// Lower-bound estimate with the default encoding.
pub fn estimate_tokens_default(text: &str) -> i64 {
    cl100k().encode_ordinary(text).len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_tokens_default(""), 0);
    }

    #[test]
    fn longer_text_costs_more_tokens() {
        let short = estimate_tokens_default("hello");
        let long = estimate_tokens_default("hello there, how are you doing today?");
        assert!(long > short);
        assert!(short >= 1);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let text = "the quick brown fox";
        assert_eq!(
            estimate_tokens(text, "gemini-1.5-pro-latest"),
            estimate_tokens_default(text)
        );
    }

    #[test]
    fn known_model_encodes() {
        assert!(estimate_tokens("hello world", "gpt-4o") >= 1);
    }
}

//! Reply delivery with parse-mode fallback and chunking.
//!
//! Telegram rejects messages whose formatting fails to parse. The delivery
//! ladder: preferred parse mode → the other mode → (for long bodies) chunked
//! sends with the same two-mode fallback → a plain apology notice.

use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode, ReplyParameters};
use tracing::warn;

use tandem_core::config::{CHUNK_MAX, CHUNK_THRESHOLD, GROUNDING_SEPARATOR};

/// Shown when every delivery attempt was rejected.
const REJECTED_NOTICE: &str = "❌ The bot's reply was not accepted by Telegram.";

/// Send `text` as a reply to `reply_to`, trying `process_markdown`'s
/// preferred parse mode first. Returns the id of the first delivered
/// message, or `None` when nothing could be delivered.
pub async fn deliver(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    text: &str,
    process_markdown: bool,
) -> Option<MessageId> {
    let (primary, secondary) = if process_markdown {
        (ParseMode::Markdown, ParseMode::Html)
    } else {
        (ParseMode::Html, ParseMode::Markdown)
    };

    if let Some(id) = send_two_modes(bot, chat_id, reply_to, text, primary, secondary).await {
        return Some(id);
    }

    if text.len() > CHUNK_THRESHOLD {
        let mut first: Option<MessageId> = None;
        for chunk in chunk_text(text, CHUNK_MAX) {
            let sent = send_two_modes(bot, chat_id, reply_to, &chunk, primary, secondary).await;
            match sent {
                Some(id) => {
                    first.get_or_insert(id);
                }
                None => warn!(chat_id = chat_id.0, "chunk rejected in both parse modes"),
            }
        }
        if first.is_some() {
            return first;
        }
    }

    warn!(chat_id = chat_id.0, "reply rejected in every mode, sending notice");
    bot.send_message(chat_id, REJECTED_NOTICE)
        .reply_parameters(ReplyParameters::new(reply_to))
        .await
        .ok();
    None
}

async fn send_two_modes(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    text: &str,
    primary: ParseMode,
    secondary: ParseMode,
) -> Option<MessageId> {
    for mode in [primary, secondary] {
        match bot
            .send_message(chat_id, text)
            .parse_mode(mode)
            .reply_parameters(ReplyParameters::new(reply_to))
            .await
        {
            Ok(sent) => return Some(sent.id),
            Err(e) => warn!(chat_id = chat_id.0, mode = ?mode, error = %e, "send rejected"),
        }
    }
    None
}

/// Split on line boundaries into chunks of at most `max` characters,
/// force-splitting single lines that exceed the limit on their own.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };
        if !current.is_empty() && current.len() + cost > max {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // A single line can still exceed the limit; hard-split on char
    // boundaries as a last resort.
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= max {
            result.push(chunk);
            continue;
        }
        let mut rest = chunk.as_str();
        while rest.len() > max {
            let mut cut = max;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            let split_at = rest[..cut].rfind(' ').unwrap_or(cut);
            result.push(rest[..split_at].to_string());
            rest = rest[split_at..].trim_start();
        }
        if !rest.is_empty() {
            result.push(rest.to_string());
        }
    }
    result
}

/// What gets persisted as the assistant turn: the reply without its
/// grounding appendix and without error lines. Error lines are shown to the
/// user but never re-enter the model's context.
pub fn strip_for_memory(text: &str) -> String {
    let body = match text.find(GROUNDING_SEPARATOR) {
        Some(at) => &text[..at],
        None => text,
    };
    body.lines()
        .filter(|line| !line.trim_start().starts_with('❌'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 1900), vec!["hello"]);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let line = "a".repeat(1000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = chunk_text(&text, 1900);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= 1900, "chunk too large: {}", c.len());
        }
    }

    #[test]
    fn force_splits_oversized_single_line() {
        let text = "x".repeat(5000);
        let chunks = chunk_text(&text, 1900);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.len() <= 1900);
        }
        assert_eq!(chunks.concat().len(), 5000);
    }

    #[test]
    fn force_split_respects_char_boundaries() {
        let text = "ы".repeat(2000);
        for c in chunk_text(&text, 1900) {
            assert!(c.len() <= 1900);
        }
    }

    #[test]
    fn strip_removes_grounding_appendix() {
        let text = format!("Answer.\n\n{GROUNDING_SEPARATOR}\nSearch queries: x");
        assert_eq!(strip_for_memory(&text), "Answer.");
    }

    #[test]
    fn strip_removes_error_lines() {
        let text = "Partial answer\n❌ The endpoint failed.\nmore";
        assert_eq!(strip_for_memory(text), "Partial answer\nmore");
    }

    #[test]
    fn strip_plain_text_is_unchanged() {
        assert_eq!(strip_for_memory("hello\nworld"), "hello\nworld");
    }
}

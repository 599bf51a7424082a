//! Append-only chat history with soft-delete, reply-chain media lookup and
//! retention pruning.

use chrono::NaiveDateTime;
use sqlx::{FromRow, PgPool};
use tracing::info;

use tandem_core::config::{ASSISTANT_SENDER_ID, SYSTEM_SENDER_ID};

use crate::error::StoreError;

/// Reply previews stored alongside a message are trimmed to this length.
const REPLY_PREVIEW_MAX: usize = 50;

/// Media classes tracked per message. Photos are attached inline; everything
/// else goes through the upload service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Other,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Other => "other",
        }
    }
}

/// One row of the `messages` table.
#[derive(Debug, Clone, FromRow)]
pub struct StoredMessage {
    pub umid: i32,
    pub chat_id: i64,
    pub message_id: i64,
    pub timestamp: NaiveDateTime,
    pub sender_id: i64,
    pub sender_username: Option<String>,
    pub sender_name: Option<String>,
    pub text: Option<String>,
    pub reply_to_message_id: Option<i64>,
    pub reply_to_message_trimmed_text: Option<String>,
    pub media_file_id: Option<String>,
    pub media_type: Option<String>,
    pub deleted: bool,
}

impl StoredMessage {
    pub fn is_assistant(&self) -> bool {
        self.sender_id == ASSISTANT_SENDER_ID
    }

    pub fn is_system(&self) -> bool {
        self.sender_id == SYSTEM_SENDER_ID
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self.media_type.as_deref() {
            Some("photo") => Some(MediaKind::Photo),
            Some("other") => Some(MediaKind::Other),
            _ => None,
        }
    }
}

/// Insert payload for a platform message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender_id: i64,
    pub sender_username: Option<String>,
    pub sender_name: Option<String>,
    pub text: String,
    pub reply_to_message_id: Option<i64>,
    pub reply_to_text: Option<String>,
    pub media_file_id: Option<String>,
    pub media_kind: Option<MediaKind>,
}

/// Outcome of a retention prune.
#[derive(Debug, Clone)]
pub struct PruneReport {
    pub deleted_count: u64,
    pub initial_size: String,
    pub final_size: String,
    pub freed_space: String,
}

pub struct MessageStore {
    pool: PgPool,
}

impl MessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a platform message. Duplicate `(chat_id, message_id)` pairs are
    /// ignored so redelivered updates stay idempotent.
    pub async fn save(&self, msg: NewMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (chat_id, message_id, timestamp, sender_id, sender_username,
             sender_name, text, reply_to_message_id, reply_to_message_trimmed_text,
             media_file_id, media_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (chat_id, message_id) DO NOTHING",
        )
        .bind(msg.chat_id)
        .bind(msg.message_id)
        .bind(chrono::Utc::now().naive_utc())
        .bind(msg.sender_id)
        .bind(msg.sender_username)
        .bind(msg.sender_name)
        .bind(msg.text)
        .bind(msg.reply_to_message_id)
        .bind(msg.reply_to_text.as_deref().map(truncate_preview))
        .bind(msg.media_file_id)
        .bind(msg.media_kind.map(MediaKind::as_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist one of the bot's own replies as an assistant turn.
    pub async fn save_bot_reply(
        &self,
        chat_id: i64,
        message_id: i64,
        trigger_message_id: i64,
        trigger_text: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        self.save(NewMessage {
            chat_id,
            message_id,
            sender_id: ASSISTANT_SENDER_ID,
            sender_username: Some("You".to_string()),
            sender_name: Some("You".to_string()),
            text: text.to_string(),
            reply_to_message_id: Some(trigger_message_id),
            reply_to_text: Some(trigger_text.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Persist a synthetic system row (sender 727). System rows have no
    /// platform id; they take descending negative ids to keep
    /// `(chat_id, message_id)` unique.
    pub async fn save_system(&self, chat_id: i64, text: &str) -> Result<(), StoreError> {
        let min_id: Option<i64> =
            sqlx::query_scalar("SELECT MIN(message_id) FROM messages WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_one(&self.pool)
                .await?;
        let message_id = min_id.map(|m| m.min(0) - 1).unwrap_or(-1);

        self.save(NewMessage {
            chat_id,
            message_id,
            sender_id: SYSTEM_SENDER_ID,
            sender_username: Some("SYSTEM".to_string()),
            sender_name: Some("SYSTEM".to_string()),
            text: text.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Newest `limit` non-deleted rows, returned oldest-first.
    pub async fn messages(
        &self,
        chat_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows: Vec<StoredMessage> = sqlx::query_as(
            "SELECT * FROM messages WHERE chat_id = $1 AND deleted = false
             ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(chat_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn specific(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let row = sqlx::query_as(
            "SELECT * FROM messages WHERE chat_id = $1 AND message_id = $2 AND deleted = false",
        )
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Bulk soft-delete (`/reset`). Idempotent.
    pub async fn reset(&self, chat_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET deleted = true WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-delete one message by id (`/forget`). Returns whether a row was hit.
    pub async fn forget(&self, chat_id: i64, message_id: i64) -> Result<bool, StoreError> {
        self.set_deleted(chat_id, message_id, true).await
    }

    /// Explicit admin-side toggle; the only path that may undelete.
    pub async fn set_deleted(
        &self,
        chat_id: i64,
        message_id: i64,
        deleted: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET deleted = $3 WHERE chat_id = $1 AND message_id = $2",
        )
        .bind(chat_id)
        .bind(message_id)
        .bind(deleted)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrite the stored text of one message (`/replace`, message edits).
    pub async fn replace(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE messages SET text = $3 WHERE chat_id = $1 AND message_id = $2")
                .bind(chat_id)
                .bind(message_id)
                .bind(text)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Walk the reply chain from `trigger_id` and return the nearest file id
    /// of the wanted kind within `max_depth` hops.
    pub async fn file_from_chain(
        &self,
        chat_id: i64,
        trigger_id: i64,
        wanted: MediaKind,
        max_depth: i64,
        window: i64,
    ) -> Result<Option<String>, StoreError> {
        let messages = self.messages(chat_id, window).await?;
        Ok(file_id_from_chain(&messages, trigger_id, wanted, max_depth))
    }

    /// Physically delete rows older than `days` (optionally one chat), then
    /// vacuum and report reclaimed space.
    pub async fn prune(
        &self,
        days: i64,
        target_chat: Option<i64>,
    ) -> Result<PruneReport, StoreError> {
        let initial_size: i64 =
            sqlx::query_scalar("SELECT pg_total_relation_size('messages')")
                .fetch_one(&self.pool)
                .await?;

        let cutoff = chrono::Utc::now().naive_utc() - chrono::Duration::days(days);
        let deleted = match target_chat {
            Some(chat_id) => {
                sqlx::query("DELETE FROM messages WHERE timestamp < $1 AND chat_id = $2")
                    .bind(cutoff)
                    .bind(chat_id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM messages WHERE timestamp < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?
            }
        };

        sqlx::query("VACUUM FULL messages").execute(&self.pool).await?;

        let final_size: i64 =
            sqlx::query_scalar("SELECT pg_total_relation_size('messages')")
                .fetch_one(&self.pool)
                .await?;

        let report = PruneReport {
            deleted_count: deleted.rows_affected(),
            initial_size: prettify_size(initial_size),
            final_size: prettify_size(final_size),
            freed_space: prettify_size(initial_size - final_size),
        };
        info!(
            deleted = report.deleted_count,
            freed = %report.freed_space,
            "prune complete"
        );
        Ok(report)
    }
}

/// Iterative reply-chain walk over a fetched window. At most `max_depth`
/// messages are inspected, the trigger included; the walk stops early when
/// an ancestor is missing from the window.
pub fn file_id_from_chain(
    messages: &[StoredMessage],
    trigger_id: i64,
    wanted: MediaKind,
    max_depth: i64,
) -> Option<String> {
    let by_id = |id: i64| messages.iter().find(|m| m.message_id == id);

    let mut current = by_id(trigger_id)?;
    let mut inspected = 0_i64;
    loop {
        inspected += 1;
        if current.media_kind() == Some(wanted) {
            if let Some(file_id) = &current.media_file_id {
                return Some(file_id.clone());
            }
        }
        if inspected >= max_depth {
            return None;
        }
        current = by_id(current.reply_to_message_id?)?;
    }
}

/// Shorten a reply preview to `REPLY_PREVIEW_MAX` characters with a
/// mid-ellipsis, collapsing newlines.
pub fn truncate_preview(text: &str) -> String {
    let text = text.replace('\n', " ");
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= REPLY_PREVIEW_MAX {
        return text;
    }
    let part = REPLY_PREVIEW_MAX / 2 - " ... ".len() / 2;
    let start: String = chars[..part].iter().collect();
    let end: String = chars[chars.len() - part..].iter().collect();
    let start = match start.rfind(' ') {
        Some(i) => &start[..i],
        None => start.as_str(),
    };
    let end = match end.find(' ') {
        Some(i) => &end[i + 1..],
        None => end.as_str(),
    };
    format!("{start} ... {end}")
}

fn prettify_size(bytes: i64) -> String {
    let mut size = bytes as f64;
    for unit in ["bytes", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, reply_to: Option<i64>, media: Option<(&str, MediaKind)>) -> StoredMessage {
        StoredMessage {
            umid: id as i32,
            chat_id: 1,
            message_id: id,
            timestamp: chrono::NaiveDateTime::default(),
            sender_id: 10,
            sender_username: None,
            sender_name: None,
            text: Some("hi".to_string()),
            reply_to_message_id: reply_to,
            reply_to_message_trimmed_text: None,
            media_file_id: media.map(|(f, _)| f.to_string()),
            media_type: media.map(|(_, k)| k.as_str().to_string()),
            deleted: false,
        }
    }

    #[test]
    fn chain_walk_finds_ancestor_photo() {
        // 100 → 90 → 80; only 80 carries a photo.
        let messages = vec![
            msg(80, None, Some(("file80", MediaKind::Photo))),
            msg(90, Some(80), None),
            msg(100, Some(90), None),
        ];
        assert_eq!(
            file_id_from_chain(&messages, 100, MediaKind::Photo, 3),
            Some("file80".to_string())
        );
    }

    #[test]
    fn chain_walk_respects_max_depth() {
        let messages = vec![
            msg(80, None, Some(("file80", MediaKind::Photo))),
            msg(90, Some(80), None),
            msg(100, Some(90), None),
        ];
        assert_eq!(file_id_from_chain(&messages, 100, MediaKind::Photo, 2), None);
    }

    #[test]
    fn chain_walk_trigger_itself_matches() {
        let messages = vec![msg(100, None, Some(("f", MediaKind::Photo)))];
        assert_eq!(
            file_id_from_chain(&messages, 100, MediaKind::Photo, 1),
            Some("f".to_string())
        );
    }

    #[test]
    fn chain_walk_skips_wrong_kind() {
        let messages = vec![
            msg(80, None, Some(("doc", MediaKind::Other))),
            msg(100, Some(80), None),
        ];
        assert_eq!(file_id_from_chain(&messages, 100, MediaKind::Photo, 5), None);
        assert_eq!(
            file_id_from_chain(&messages, 100, MediaKind::Other, 5),
            Some("doc".to_string())
        );
    }

    #[test]
    fn chain_walk_handles_missing_ancestor() {
        let messages = vec![msg(100, Some(90), None)];
        assert_eq!(file_id_from_chain(&messages, 100, MediaKind::Photo, 5), None);
    }

    #[test]
    fn chain_walk_unknown_trigger_is_none() {
        assert_eq!(file_id_from_chain(&[], 100, MediaKind::Photo, 5), None);
    }

    #[test]
    fn preview_short_text_untouched() {
        assert_eq!(truncate_preview("hello"), "hello");
    }

    #[test]
    fn preview_collapses_newlines() {
        assert_eq!(truncate_preview("a\nb"), "a b");
    }

    #[test]
    fn preview_long_text_gets_mid_ellipsis() {
        let text = "The quick brown fox jumped over the lazy dog and kept on running far away";
        let preview = truncate_preview(text);
        assert!(preview.contains(" ... "), "got: {preview}");
        assert!(preview.len() < text.len());
        assert!(preview.starts_with("The quick"));
    }

    #[test]
    fn size_prettifier_scales_units() {
        assert_eq!(prettify_size(512), "512.00 bytes");
        assert_eq!(prettify_size(2048), "2.00 KB");
        assert_eq!(prettify_size(5 * 1024 * 1024), "5.00 MB");
    }
}

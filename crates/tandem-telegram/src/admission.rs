//! Admission predicates: endpoint payload requirements, the should-generate
//! rule, the forced-answer sentinel and memory-alter permissions.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatMemberStatus;
use tracing::debug;

use tandem_core::config::FORCE_ANSWER_SENTINEL;

use crate::context::AppContext;

/// Typographic variant produced by mobile keyboards auto-converting `--`.
const FORCE_ANSWER_SENTINEL_DASH: &str = " —force-answer ";

/// What kinds of payload an update carries. Captions count as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadFlags {
    pub text: bool,
    pub photo: bool,
    pub video: bool,
    pub audio: bool,
    pub voice: bool,
    pub document: bool,
    pub sticker: bool,
    pub video_note: bool,
}

impl PayloadFlags {
    pub fn of(msg: &Message) -> Self {
        Self {
            text: msg.text().is_some() || msg.caption().is_some(),
            photo: msg.photo().is_some(),
            video: msg.video().is_some(),
            audio: msg.audio().is_some(),
            voice: msg.voice().is_some(),
            document: msg.document().is_some(),
            sticker: msg.sticker().is_some(),
            video_note: msg.video_note().is_some(),
        }
    }
}

/// Reject updates carrying no payload the configured endpoint can use.
pub fn meets_endpoint_requirements(endpoint: &str, payload: &PayloadFlags) -> bool {
    match endpoint {
        "openai" => payload.text || payload.photo,
        _ => {
            payload.text
                || payload.photo
                || payload.video
                || payload.audio
                || payload.voice
                || payload.document
                || payload.sticker
                || payload.video_note
        }
    }
}

/// A message triggers a generation iff it replies to the bot, mentions the
/// bot's username, or arrives over DM.
pub fn should_generate(
    replies_to_bot: bool,
    text: &str,
    bot_username: &str,
    is_dm: bool,
) -> bool {
    replies_to_bot || is_dm || text.contains(&format!("@{bot_username}"))
}

/// Split a message on the forced-answer sentinel into (prefix, remainder).
pub fn split_forced_answer(text: &str) -> Option<(&str, &str)> {
    for sentinel in [FORCE_ANSWER_SENTINEL, FORCE_ANSWER_SENTINEL_DASH] {
        if let Some((before, after)) = text.split_once(sentinel) {
            return Some((before, after));
        }
    }
    None
}

/// Whether `user_id` may alter the bot's memory in this chat (`/reset`,
/// `/forget`, `/replace`, `/system`, forced answers).
///
/// DMs and global administrators always pass; otherwise the chat's
/// `memory_alter_permission` decides which member statuses qualify.
pub async fn allowed_to_alter_memory(
    bot: &Bot,
    ctx: &Arc<AppContext>,
    chat_id: i64,
    user_id: i64,
) -> bool {
    if chat_id == user_id || ctx.config.is_admin(user_id) {
        return true;
    }

    let mode = ctx
        .chat_config
        .get_text(chat_id, "memory_alter_permission")
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "all".to_string());

    let member = bot
        .get_chat_member(ChatId(chat_id), UserId(user_id as u64))
        .await;
    let status = match member {
        Ok(m) => m.status(),
        Err(e) => {
            debug!(chat_id, user_id, error = %e, "cannot check member status");
            // Without admin rights the bot cannot verify membership; only
            // the permissive default lets the action through.
            return mode == "all";
        }
    };

    match mode.as_str() {
        "owner" => matches!(status, ChatMemberStatus::Owner),
        "admins" => matches!(
            status,
            ChatMemberStatus::Owner | ChatMemberStatus::Administrator
        ),
        _ => !matches!(
            status,
            ChatMemberStatus::Left | ChatMemberStatus::Banned
        ),
    }
}

/// Whether `user_id` may change settings in this chat: DMs always, groups
/// require chat admin status (global admins bypass).
pub async fn allowed_to_change_settings(
    bot: &Bot,
    ctx: &Arc<AppContext>,
    chat_id: i64,
    user_id: i64,
) -> bool {
    if chat_id == user_id || ctx.config.is_admin(user_id) {
        return true;
    }
    match bot
        .get_chat_member(ChatId(chat_id), UserId(user_id as u64))
        .await
    {
        Ok(m) => matches!(
            m.status(),
            ChatMemberStatus::Owner | ChatMemberStatus::Administrator
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_accepts_any_media_payload() {
        let payload = PayloadFlags {
            voice: true,
            ..Default::default()
        };
        assert!(meets_endpoint_requirements("google", &payload));
        assert!(!meets_endpoint_requirements("openai", &payload));
    }

    #[test]
    fn openai_accepts_text_and_photo_only() {
        let photo = PayloadFlags {
            photo: true,
            ..Default::default()
        };
        assert!(meets_endpoint_requirements("openai", &photo));
        let sticker = PayloadFlags {
            sticker: true,
            ..Default::default()
        };
        assert!(!meets_endpoint_requirements("openai", &sticker));
    }

    #[test]
    fn empty_payload_never_qualifies() {
        let none = PayloadFlags::default();
        assert!(!meets_endpoint_requirements("google", &none));
        assert!(!meets_endpoint_requirements("openai", &none));
    }

    #[test]
    fn generates_on_mention_reply_or_dm() {
        assert!(should_generate(true, "anything", "bot", false));
        assert!(should_generate(false, "hey @bot look", "bot", false));
        assert!(should_generate(false, "hello", "bot", true));
        assert!(!should_generate(false, "hello", "bot", false));
    }

    #[test]
    fn forced_answer_splits_on_sentinel() {
        let (before, after) =
            split_forced_answer("say this --force-answer I am a teapot").unwrap();
        assert_eq!(before, "say this");
        assert_eq!(after, "I am a teapot");
    }

    #[test]
    fn forced_answer_accepts_em_dash_variant() {
        let (_, after) = split_forced_answer("x —force-answer y").unwrap();
        assert_eq!(after, "y");
    }

    #[test]
    fn no_sentinel_no_split() {
        assert!(split_forced_answer("just a message").is_none());
        assert!(split_forced_answer("--force-answer leading").is_none());
    }
}

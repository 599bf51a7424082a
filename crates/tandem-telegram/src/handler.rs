//! Message handlers registered in the teloxide Dispatcher.
//!
//! Every qualifying message is persisted before any generation decision;
//! command messages short-circuit to the command surface.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::{debug, warn};

use tandem_store::{MediaKind, NewMessage};

use crate::admission::{self, PayloadFlags};
use crate::commands;
use crate::context::AppContext;
use crate::orchestrate;

/// Files above this size are not tracked or carried through the pipeline.
const MAX_MEDIA_BYTES: u32 = 10_000_000;

pub async fn handle_message(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    let user_id = from.id.0 as i64;
    let chat_id = msg.chat.id.0;

    // Blacklisted chats and users are dropped silently.
    let chat_blocked = ctx.blacklist.is_blacklisted(chat_id).await.unwrap_or(false);
    let user_blocked = ctx.blacklist.is_blacklisted(user_id).await.unwrap_or(false);
    if chat_blocked || user_blocked {
        return Ok(());
    }

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    // A private parameter set in progress consumes the next DM text.
    if msg.chat.is_private() && !text.starts_with('/') {
        if let Some((_, pending)) = ctx.pending_private_sets.remove(&user_id) {
            commands::complete_private_set(&bot, &msg, &ctx, pending, &text).await;
            return Ok(());
        }
    }

    if text.starts_with('/') {
        debug!(user_id, chat_id, command = %text, "command received");
        commands::dispatch(&bot, &msg, &ctx, &text).await;
        return Ok(());
    }

    // Drop updates carrying nothing the configured endpoint can use.
    let endpoint = ctx
        .chat_config
        .get_text(chat_id, "endpoint")
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "google".to_string());
    let payload = PayloadFlags::of(&msg);
    if !admission::meets_endpoint_requirements(&endpoint, &payload) {
        return Ok(());
    }

    let forced = admission::split_forced_answer(&text).map(|(p, r)| (p.to_string(), r.to_string()));
    let stored_text = match &forced {
        Some((prefix, _)) => prefix.clone(),
        None => text.clone(),
    };

    // Persist before any further decision.
    let (media_file_id, media_kind) = extract_media_meta(&msg);
    let record = NewMessage {
        chat_id,
        message_id: msg.id.0 as i64,
        sender_id: user_id,
        sender_username: from.username.clone(),
        sender_name: Some(from.first_name.clone()),
        text: stored_text,
        reply_to_message_id: msg.reply_to_message().map(|r| r.id.0 as i64),
        reply_to_text: msg
            .reply_to_message()
            .and_then(|r| r.text().or(r.caption()))
            .map(String::from),
        media_file_id,
        media_kind,
    };
    if let Err(e) = ctx.messages.save(record).await {
        warn!(chat_id, error = %e, "failed to persist message");
    }

    // Forced-answer splice: echo the remainder as the bot's reply without
    // touching a backend, and persist it as an assistant turn.
    if let Some((prefix, remainder)) = forced {
        if admission::allowed_to_alter_memory(&bot, &ctx, chat_id, user_id).await {
            let sent = bot
                .send_message(msg.chat.id, &remainder)
                .reply_parameters(ReplyParameters::new(msg.id))
                .await;
            if let Ok(sent) = sent {
                if let Err(e) = ctx
                    .messages
                    .save_bot_reply(chat_id, sent.id.0 as i64, msg.id.0 as i64, &prefix, &remainder)
                    .await
                {
                    warn!(chat_id, error = %e, "failed to persist forced answer");
                }
            }
        }
        return Ok(());
    }

    let replies_to_bot = msg
        .reply_to_message()
        .and_then(|r| r.from.as_ref())
        .map(|u| u.id.0 as i64 == ctx.config.bot_id())
        .unwrap_or(false);
    let is_dm = msg.chat.is_private();

    if admission::should_generate(replies_to_bot, &text, &ctx.config.bot_username, is_dm) {
        orchestrate::run_generation(&bot, &ctx, &msg).await;
    }

    Ok(())
}

/// Edited messages overwrite the stored text; they never re-trigger a
/// generation.
pub async fn handle_edited_message(
    _bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(text) = msg.text().or(msg.caption()) else {
        return Ok(());
    };

    let chat_blocked = ctx.blacklist.is_blacklisted(chat_id).await.unwrap_or(false);
    if chat_blocked {
        return Ok(());
    }

    match ctx.messages.replace(chat_id, msg.id.0 as i64, text).await {
        Ok(true) => debug!(chat_id, message_id = msg.id.0, "stored text updated after edit"),
        Ok(false) => {}
        Err(e) => warn!(chat_id, error = %e, "failed to apply message edit"),
    }
    Ok(())
}

/// File id and class of the message's media, photos preferred. Oversized
/// files are ignored.
fn extract_media_meta(msg: &Message) -> (Option<String>, Option<MediaKind>) {
    if let Some(photo) = msg.photo().and_then(|p| p.last()) {
        if photo.file.size < MAX_MEDIA_BYTES {
            return (Some(photo.file.id.clone()), Some(MediaKind::Photo));
        }
    }

    let other: Option<(&String, u32)> = if let Some(audio) = msg.audio() {
        Some((&audio.file.id, audio.file.size))
    } else if let Some(video) = msg.video() {
        Some((&video.file.id, video.file.size))
    } else if let Some(voice) = msg.voice() {
        Some((&voice.file.id, voice.file.size))
    } else if let Some(doc) = msg.document() {
        Some((&doc.file.id, doc.file.size))
    } else if let Some(note) = msg.video_note() {
        Some((&note.file.id, note.file.size))
    } else if let Some(sticker) = msg.sticker() {
        Some((&sticker.file.id, sticker.file.size))
    } else {
        None
    };

    match other {
        Some((file_id, size)) if size < MAX_MEDIA_BYTES => {
            (Some(file_id.clone()), Some(MediaKind::Other))
        }
        _ => (None, None),
    }
}

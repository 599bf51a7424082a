//! User-facing commands.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use tandem_api::tokens::estimate_tokens_default;

use crate::admission::allowed_to_alter_memory;
use crate::commands::reply;
use crate::context::AppContext;

pub async fn start(bot: &Bot, msg: &Message) {
    reply(
        bot,
        msg,
        "👋 <b>Hi!</b> I reply when you mention me, answer my messages, or write \
         to me directly.\n\nSee /help for commands and /settings for tuning.",
    )
    .await;
}

pub async fn help(bot: &Bot, msg: &Message) {
    reply(
        bot,
        msg,
        "<b>Commands</b>\n\
         /status — memory usage, model and chat info\n\
         /settings [param] — list or inspect parameters\n\
         /set [param] [value] — change a parameter\n\
         /preset [name] — apply a parameter preset\n\
         /reset — clear the bot's memory of this chat\n\
         /forget — reply-targeted: remove one message from memory\n\
         /replace [text] — reply-targeted: rewrite a remembered message\n\
         /system [text] — add a standing instruction (OpenAI endpoints)\n\
         /hide — reply-targeted: delete a bot message from the chat\n\
         /feedback [text] — message the operators",
    )
    .await;
}

pub async fn status(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>) {
    let chat_id = msg.chat.id.0;

    let limit = ctx
        .chat_config
        .get_i64(chat_id, "message_limit")
        .await
        .unwrap_or(50);
    let history = ctx.messages.messages(chat_id, limit).await.unwrap_or_default();

    let endpoint = ctx
        .chat_config
        .get_text(chat_id, "endpoint")
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "google".to_string());
    let model_param = if endpoint == "openai" { "o_model" } else { "g_model" };
    let model = ctx
        .chat_config
        .get_text(chat_id, model_param)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    let text = format!(
        "✅ <b>The bot is running.</b>\n\
         💬 <b>Memory:</b> {}/{} messages <i>(⏱ counting…)</i>\n\
         ✨ <b>Model:</b> <i>{}</i> ({})\n\
         🆔 <b>Chat id:</b> <code>{}</code>\n\
         🤖 <b>Version:</b> <code>{}</code>",
        history.len(),
        limit,
        model,
        endpoint,
        chat_id,
        env!("CARGO_PKG_VERSION"),
    );

    let sent = bot
        .send_message(msg.chat.id, &text)
        .parse_mode(teloxide::types::ParseMode::Html)
        .reply_parameters(teloxide::types::ReplyParameters::new(msg.id))
        .await;

    // Fill the token estimate in by editing the reply once counted.
    if let Ok(sent) = sent {
        let rendered: String = history
            .iter()
            .map(|m| tandem_api::prompt::render_message(m, false))
            .collect::<Vec<_>>()
            .join("\n");
        let tokens = estimate_tokens_default(&rendered);
        let edited = text.replace("⏱ counting…", &format!("~{tokens} tokens"));
        let _ = bot
            .edit_message_text(msg.chat.id, sent.id, edited)
            .parse_mode(teloxide::types::ParseMode::Html)
            .await;
    }
}

/// `/stats [id]` — usage for this chat, or for any entity when a global
/// administrator passes its id. Admins also get the global block.
pub async fn stats(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let is_admin = ctx.config.is_admin(user_id);
    const DAYS: i64 = 7;

    let target = match args.parse::<i64>() {
        Ok(id) if is_admin => id,
        Ok(_) => {
            reply(bot, msg, "❌ <b>Only bot administrators can inspect other chats.</b>").await;
            return;
        }
        Err(_) => msg.chat.id.0,
    };

    let generations = ctx
        .statistics
        .chat_generations(target, DAYS)
        .await
        .unwrap_or(0);
    let totals = ctx
        .statistics
        .chat_token_totals(target, DAYS)
        .await
        .unwrap_or_default();

    let mut text = format!(
        "📊 <b>Chat <code>{target}</code>, last {DAYS} days</b>\n\
         Generations: {generations}\n\
         Tokens: {} in / {} out / {} total\n",
        totals.prompt, totals.completion, totals.total
    );

    if is_admin {
        let global = ctx.statistics.generation_count(DAYS).await.unwrap_or(0);
        let (active_count, _) = ctx
            .statistics
            .active_users(DAYS)
            .await
            .unwrap_or((0, vec![]));
        let top_users = ctx.statistics.top_users(DAYS, 5).await.unwrap_or_default();
        let top_chats = ctx
            .statistics
            .top_chats_by_tokens(5)
            .await
            .unwrap_or_default();
        let all_totals = ctx
            .statistics
            .token_totals(Some(DAYS))
            .await
            .unwrap_or_default();
        let keys = ctx.keys.statuses();

        text.push_str(&format!(
            "\n<b>Global:</b> {global} generations, {active_count} active users, \
             {} tokens\n",
            all_totals.total
        ));
        if !top_users.is_empty() {
            text.push_str("\n<b>Top users:</b>\n");
            for (uid, count) in &top_users {
                text.push_str(&format!("<code>{uid}</code> — {count}\n"));
            }
        }
        if !top_chats.is_empty() {
            text.push_str("\n<b>Top chats by tokens:</b>\n");
            for (chat_id, tokens) in &top_chats {
                let title = ctx.entity_title(bot, *chat_id).await;
                text.push_str(&format!("{title} — {tokens}\n"));
            }
        }
        text.push_str(&format!(
            "\n🔑 <b>Keys:</b> {}/{} active ({} exhausted), billing {}/{} ({} exhausted)\n\
             ⏳ <b>Up since:</b> {}",
            keys.active,
            keys.total,
            keys.exhausted,
            keys.active_billing,
            keys.total_billing,
            keys.exhausted_billing,
            ctx.start_time.format("%Y-%m-%d %H:%M UTC"),
        ));
    }

    reply(bot, msg, &text).await;
}

pub async fn reset(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>) {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    if !allowed_to_alter_memory(bot, ctx, chat_id, user_id).await {
        reply(bot, msg, "❌ <b>You are not allowed to alter the bot's memory here.</b>").await;
        return;
    }
    match ctx.messages.reset(chat_id).await {
        Ok(()) => reply(bot, msg, "✅ <b>Memory cleared.</b>").await,
        Err(e) => {
            warn!(chat_id, error = %e, "reset failed");
            reply(bot, msg, "❌ <b>Failed to clear memory.</b>").await;
        }
    }
}

pub async fn forget(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>) {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    if !allowed_to_alter_memory(bot, ctx, chat_id, user_id).await {
        return;
    }
    let Some(target) = msg.reply_to_message() else {
        reply(
            bot,
            msg,
            "❌ <b>Reply to the message you want removed from memory.</b>",
        )
        .await;
        return;
    };

    match ctx.messages.forget(chat_id, target.id.0 as i64).await {
        Ok(true) => reply(bot, msg, "✅ <b>Message removed from memory.</b>").await,
        Ok(false) => reply(bot, msg, "❌ <b>That message is not in memory.</b>").await,
        Err(e) => {
            warn!(chat_id, error = %e, "forget failed");
            reply(bot, msg, "❌ <b>Failed to remove the message.</b>").await;
        }
    }
}

pub async fn replace(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    if !allowed_to_alter_memory(bot, ctx, chat_id, user_id).await {
        return;
    }
    let Some(target) = msg.reply_to_message() else {
        reply(bot, msg, "❌ <b>Reply to the message you want rewritten.</b>").await;
        return;
    };
    if args.is_empty() {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/replace [new text]</i>").await;
        return;
    }

    match ctx.messages.replace(chat_id, target.id.0 as i64, args).await {
        Ok(true) => reply(bot, msg, "✅ <b>Message rewritten.</b>").await,
        Ok(false) => reply(bot, msg, "❌ <b>That message is not in memory.</b>").await,
        Err(e) => {
            warn!(chat_id, error = %e, "replace failed");
            reply(bot, msg, "❌ <b>Failed to rewrite the message.</b>").await;
        }
    }
}

pub async fn system(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    if !allowed_to_alter_memory(bot, ctx, chat_id, user_id).await {
        reply(bot, msg, "❌ <b>You are not allowed to use this command here.</b>").await;
        return;
    }

    let endpoint = ctx
        .chat_config
        .get_text(chat_id, "endpoint")
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "google".to_string());
    if endpoint != "openai" {
        reply(
            bot,
            msg,
            "❌ <b>This command is only available on OpenAI endpoints.</b>",
        )
        .await;
        return;
    }

    if args.is_empty() {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/system [text]</i>").await;
        return;
    }

    match ctx.messages.save_system(chat_id, args).await {
        Ok(()) => reply(bot, msg, "✅ <b>Instruction added.</b>").await,
        Err(e) => {
            warn!(chat_id, error = %e, "system message failed");
            reply(bot, msg, "❌ <b>Failed to add the instruction.</b>").await;
        }
    }
}

pub async fn hide(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>) {
    let Some(target) = msg.reply_to_message() else {
        reply(bot, msg, "❌ <b>Reply to the bot message you want removed.</b>").await;
        return;
    };

    let from_bot = target
        .from
        .as_ref()
        .map(|u| u.id.0 as i64 == ctx.config.bot_id())
        .unwrap_or(false);
    if from_bot {
        let _ = bot.delete_message(msg.chat.id, target.id).await;
    }
    // Removing the invoking command keeps the chat tidy; ignore failures in
    // chats where the bot cannot delete others' messages.
    let _ = bot.delete_message(msg.chat.id, msg.id).await;
}

pub async fn feedback(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    if args.is_empty() {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/feedback [text]</i>").await;
        return;
    }
    let from = msg.from.as_ref();
    let username = from
        .and_then(|u| u.username.as_deref())
        .unwrap_or("no username");
    let user_id = from.map(|u| u.id.0 as i64).unwrap_or(0);

    let report = format!(
        "💬 <b>Feedback</b> from <code>{}</code> (@{}), chat <code>{}</code>:\n\n{}",
        user_id, username, msg.chat.id.0, args
    );
    let sent = bot
        .send_message(ChatId(ctx.config.feedback_target_id), report)
        .parse_mode(teloxide::types::ParseMode::Html)
        .await;
    match sent {
        Ok(_) => reply(bot, msg, "✅ <b>Feedback sent. Thank you!</b>").await,
        Err(e) => {
            warn!(error = %e, "feedback delivery failed");
            reply(bot, msg, "❌ <b>Failed to deliver feedback.</b>").await;
        }
    }
}

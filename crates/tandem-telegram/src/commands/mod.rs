//! Flat command surface. Each command is a thin adapter over the stores and
//! dispatchers; admin commands silently ignore non-admin callers.

mod admin;
mod general;
mod settings;

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ParseMode, ReplyParameters};

use crate::context::{AppContext, PendingPrivateSet};

pub use settings::complete_private_set;

/// Route a `/command` message. Unknown commands are ignored so other bots'
/// commands in the same group don't trigger noise.
pub async fn dispatch(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, text: &str) {
    let mut parts = text.splitn(2, char::is_whitespace);
    let raw = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    // `/cmd@other_bot` is addressed elsewhere.
    let cmd = match raw.split_once('@') {
        Some((cmd, suffix)) => {
            if !suffix.eq_ignore_ascii_case(&ctx.config.bot_username) {
                return;
            }
            cmd
        }
        None => raw,
    };

    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let is_admin = ctx.config.is_admin(user_id);

    match cmd {
        "/start" => general::start(bot, msg).await,
        "/help" => general::help(bot, msg).await,
        "/status" => general::status(bot, msg, ctx).await,
        "/stats" => general::stats(bot, msg, ctx, args).await,
        "/reset" | "/clear" => general::reset(bot, msg, ctx).await,
        "/forget" => general::forget(bot, msg, ctx).await,
        "/replace" => general::replace(bot, msg, ctx, args).await,
        "/system" => general::system(bot, msg, ctx, args).await,
        "/hide" => general::hide(bot, msg, ctx).await,
        "/feedback" => general::feedback(bot, msg, ctx, args).await,
        "/settings" => settings::settings(bot, msg, ctx, args).await,
        "/set" => settings::set(bot, msg, ctx, args, false).await,
        "/preset" => settings::preset(bot, msg, ctx, args).await,

        "/sql" if is_admin => admin::sql(bot, msg, ctx, args).await,
        "/directsend" if is_admin => admin::directsend(bot, msg, args).await,
        "/blacklist" if is_admin => admin::blacklist(bot, msg, ctx, args).await,
        "/unblacklist" if is_admin => admin::unblacklist(bot, msg, ctx, args).await,
        "/prune" if is_admin => admin::prune(bot, msg, ctx, args).await,
        "/restart" if is_admin => admin::restart(bot, msg).await,
        "/dropcaches" if is_admin => admin::dropcaches(bot, msg, ctx).await,
        "/fset" if is_admin => settings::set(bot, msg, ctx, args, true).await,
        _ => {}
    }
}

/// Reply helper: HTML parse mode, quoting the command message.
pub(crate) async fn reply(bot: &Bot, msg: &Message, text: &str) {
    let _ = bot
        .send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await;
}

pub(crate) fn pending_set(chat_id: i64, param: &'static str) -> PendingPrivateSet {
    PendingPrivateSet { chat_id, param }
}

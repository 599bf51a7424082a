//! Administrator commands. Dispatch already verified the caller.

use std::sync::Arc;

use sqlx::Row;
use teloxide::prelude::*;
use tracing::{info, warn};

use crate::commands::reply;
use crate::context::AppContext;

/// Exit code asking the supervisor to restart the process.
const RESTART_EXIT_CODE: i32 = 42;

/// `/sql [-fetch] <query>` — raw access to the store. With `-fetch`, rows
/// come back JSON-encoded via `row_to_json`.
pub async fn sql(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    if args.is_empty() {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/sql [-fetch] [query]</i>").await;
        return;
    }

    let (fetch, query) = match args.strip_prefix("-fetch ") {
        Some(rest) => (true, rest.trim()),
        None => (false, args),
    };

    info!(query, fetch, "running admin SQL");

    if fetch {
        let wrapped = format!("SELECT row_to_json(q)::text AS row FROM ({query}) AS q");
        match sqlx::query(&wrapped).fetch_all(&ctx.db).await {
            Ok(rows) => {
                let mut lines: Vec<String> = Vec::new();
                for row in rows.iter().take(50) {
                    match row.try_get::<String, _>("row") {
                        Ok(line) => lines.push(line),
                        Err(e) => lines.push(format!("<decode error: {e}>")),
                    }
                }
                let body = if lines.is_empty() {
                    "(no rows)".to_string()
                } else {
                    lines.join("\n")
                };
                reply(bot, msg, &format!("<pre>{body}</pre>")).await;
            }
            Err(e) => reply(bot, msg, &format!("❌ <b>Query failed:</b> {e}")).await,
        }
    } else {
        match sqlx::query(query).execute(&ctx.db).await {
            Ok(result) => {
                reply(
                    bot,
                    msg,
                    &format!("✅ <b>Done.</b> Rows affected: {}", result.rows_affected()),
                )
                .await
            }
            Err(e) => reply(bot, msg, &format!("❌ <b>Query failed:</b> {e}")).await,
        }
    }
}

/// `/directsend <id> <content>` — speak as the bot into any chat.
pub async fn directsend(bot: &Bot, msg: &Message, args: &str) {
    let mut parts = args.splitn(2, char::is_whitespace);
    let target: Option<i64> = parts.next().and_then(|t| t.parse().ok());
    let content = parts.next().unwrap_or("").trim();

    let (Some(target), false) = (target, content.is_empty()) else {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/directsend [chat_id] [text]</i>").await;
        return;
    };

    match bot.send_message(ChatId(target), content).await {
        Ok(_) => reply(bot, msg, "✅ <b>Sent.</b>").await,
        Err(e) => reply(bot, msg, &format!("❌ <b>Failed:</b> {e}")).await,
    }
}

pub async fn blacklist(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let Ok(target) = args.parse::<i64>() else {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/blacklist [entity_id]</i>").await;
        return;
    };
    match ctx.blacklist.add(target).await {
        Ok(()) => reply(bot, msg, &format!("✅ <b>Blacklisted</b> <code>{target}</code>")).await,
        Err(e) => {
            warn!(target, error = %e, "blacklist add failed");
            reply(bot, msg, "❌ <b>Failed to update the blacklist.</b>").await;
        }
    }
}

pub async fn unblacklist(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let Ok(target) = args.parse::<i64>() else {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/unblacklist [entity_id]</i>").await;
        return;
    };
    match ctx.blacklist.remove(target).await {
        Ok(()) => {
            reply(bot, msg, &format!("✅ <b>Unblacklisted</b> <code>{target}</code>")).await
        }
        Err(e) => {
            warn!(target, error = %e, "blacklist remove failed");
            reply(bot, msg, "❌ <b>Failed to update the blacklist.</b>").await;
        }
    }
}

/// `/prune <chat_id|*> <days>` — physically delete old rows and vacuum.
pub async fn prune(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() != 2 {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/prune [chat_id|*] [days]</i>").await;
        return;
    }
    let target = match parts[0] {
        "*" => None,
        raw => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                reply(bot, msg, "❌ <b>Bad chat id.</b>").await;
                return;
            }
        },
    };
    let Ok(days) = parts[1].parse::<i64>() else {
        reply(bot, msg, "❌ <b>Bad day count.</b>").await;
        return;
    };

    match ctx.messages.prune(days, target).await {
        Ok(report) => {
            reply(
                bot,
                msg,
                &format!(
                    "✅ <b>Pruned {} messages.</b>\n{} → {} ({} reclaimed)",
                    report.deleted_count,
                    report.initial_size,
                    report.final_size,
                    report.freed_space
                ),
            )
            .await
        }
        Err(e) => {
            warn!(error = %e, "prune failed");
            reply(bot, msg, "❌ <b>Prune failed.</b>").await;
        }
    }
}

/// `/restart` — exit non-zero so the supervisor brings up a fresh process.
pub async fn restart(bot: &Bot, msg: &Message) {
    reply(bot, msg, "🔄 <b>Restarting…</b>").await;
    info!("restart requested, exiting");
    std::process::exit(RESTART_EXIT_CODE);
}

pub async fn dropcaches(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>) {
    ctx.drop_caches();
    reply(bot, msg, "✅ <b>Caches dropped.</b>").await;
}

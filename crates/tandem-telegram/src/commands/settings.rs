//! `/settings`, `/set` (with the private-parameter DM detour), `/fset` and
//! `/preset`.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use tandem_store::schema::{self, Accepted, ParamKind, ParamValue, SetRejection};

use crate::admission::allowed_to_change_settings;
use crate::commands::{pending_set, reply};
use crate::context::{AppContext, PendingPrivateSet};

/// List parameters, or show one parameter in detail.
pub async fn settings(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let chat_id = msg.chat.id.0;

    if args.is_empty() {
        let show_advanced = ctx
            .chat_config
            .get_bool(chat_id, "show_advanced_settings")
            .await
            .unwrap_or(false);

        let mut text = String::from("<b>Bot parameters:</b>\n");
        for spec in schema::chat_config_schema() {
            if spec.advanced && !show_advanced {
                continue;
            }
            let shown = if spec.private {
                "•••".to_string()
            } else {
                ctx.chat_config
                    .get(chat_id, spec.name)
                    .await
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "?".to_string())
            };
            text.push_str(&format!("\n<code>{}</code> — {}", spec.name, shown));
        }
        text.push_str(
            "\n\n<b>Details:</b> /settings [param]\n<b>Change:</b> /set [param] [value]",
        );
        reply(bot, msg, &text).await;
        return;
    }

    let name = args.to_lowercase();
    let Some(spec) = schema::param(&name) else {
        reply(bot, msg, "❌ <b>Unknown parameter.</b>").await;
        return;
    };

    let current = if spec.private {
        "•••".to_string()
    } else {
        ctx.chat_config
            .get(chat_id, spec.name)
            .await
            .map(|v| v.to_string())
            .unwrap_or_else(|_| "?".to_string())
    };

    let accepted = match spec.accepted {
        Accepted::Free => "free-form".to_string(),
        Accepted::Enum(options) => options.join(", "),
        Accepted::IntRange(start, stop) => format!("{start}–{}", stop - 1),
        Accepted::DecRange(min, max) => format!("{min}–{max}"),
    };

    let text = format!(
        "<b>Parameter</b> <code>{}</code>:\n<i>{}</i>\n\n\
         Current: {} | Default: {} | Accepted: {}",
        spec.name, spec.description, current, spec.default, accepted
    );
    reply(bot, msg, &text).await;
}

/// `/set [chat_id] <param> <value>` — `forced` marks the `/fset` variant,
/// which skips the caller checks entirely.
pub async fn set(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str, forced: bool) {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let is_admin = ctx.config.is_admin(user_id);

    let mut parts: Vec<&str> = args.split_whitespace().collect();

    // A leading numeric argument addresses another chat (admins only).
    let mut target_chat = msg.chat.id.0;
    if parts.len() >= 3 {
        if let Ok(explicit) = parts[0].parse::<i64>() {
            if !is_admin {
                reply(bot, msg, "❌ <b>Only bot administrators can target other chats.</b>").await;
                return;
            }
            target_chat = explicit;
            parts.remove(0);
        }
    }

    if parts.len() < 2 {
        reply(bot, msg, "❌ <b>Usage:</b> <i>/set [param] [value]</i>").await;
        return;
    }
    let name = parts[0].to_lowercase();
    let raw_value = parts[1..].join(" ");

    let Some(spec) = schema::param(&name) else {
        reply(bot, msg, "❌ <b>Unknown parameter.</b>").await;
        return;
    };

    if !forced {
        if spec.protected && !is_admin {
            reply(
                bot,
                msg,
                "❌ <b>This parameter can only be changed by bot administrators.</b>",
            )
            .await;
            return;
        }
        if !allowed_to_change_settings(bot, ctx, target_chat, user_id).await {
            reply(bot, msg, "❌ <b>Only chat administrators can change parameters.</b>").await;
            return;
        }

        // Private parameters never transit a group chat: park the set and
        // collect the value over DM.
        if spec.private && !msg.chat.is_private() {
            let prompt = format!(
                "🔒 Send the value for <code>{}</code> (chat <code>{}</code>) here.",
                spec.name, target_chat
            );
            match bot
                .send_message(ChatId(user_id), prompt)
                .parse_mode(teloxide::types::ParseMode::Html)
                .await
            {
                Ok(_) => {
                    ctx.pending_private_sets
                        .insert(user_id, pending_set(target_chat, spec.name));
                    reply(bot, msg, "🔒 <b>Check your DMs to set this privately.</b>").await;
                }
                Err(_) => {
                    reply(
                        bot,
                        msg,
                        "❌ <b>I can't DM you. Start a private chat with me first.</b>",
                    )
                    .await;
                }
            }
            return;
        }
    }

    apply_set(bot, msg, ctx, target_chat, spec.name, &raw_value, is_admin || forced).await;
}

/// Value arriving over DM for a parked private set.
pub async fn complete_private_set(
    bot: &Bot,
    msg: &Message,
    ctx: &Arc<AppContext>,
    pending: PendingPrivateSet,
    value: &str,
) {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let is_admin = ctx.config.is_admin(user_id);
    apply_set(bot, msg, ctx, pending.chat_id, pending.param, value, is_admin).await;
}

/// Validate and persist one parameter. Global administrators bypass the
/// accepted-values check but still need a type-correct value.
async fn apply_set(
    bot: &Bot,
    msg: &Message,
    ctx: &Arc<AppContext>,
    chat_id: i64,
    name: &str,
    raw: &str,
    bypass_accepted: bool,
) {
    let Some(spec) = schema::param(name) else {
        reply(bot, msg, "❌ <b>Unknown parameter.</b>").await;
        return;
    };

    let value = if bypass_accepted {
        match parse_lenient(spec.kind, raw) {
            Some(v) => v,
            None => {
                reply(bot, msg, "❌ <b>The value does not match the parameter's type.</b>").await;
                return;
            }
        }
    } else {
        match schema::validate(spec, raw) {
            Ok(v) => v,
            Err(SetRejection::WrongType) => {
                reply(bot, msg, "❌ <b>The value does not match the parameter's type.</b>").await;
                return;
            }
            Err(SetRejection::OutOfRange) => {
                reply(bot, msg, "❌ <b>The value is outside the accepted range.</b>").await;
                return;
            }
            Err(SetRejection::NoMatch(suggestion)) => {
                let text = match suggestion {
                    Some(s) => format!(
                        "❌ <b>No accepted value matches.</b> Did you mean <code>{s}</code>?"
                    ),
                    None => "❌ <b>No accepted value matches.</b>".to_string(),
                };
                reply(bot, msg, &text).await;
                return;
            }
            Err(SetRejection::Ambiguous(options)) => {
                reply(
                    bot,
                    msg,
                    &format!(
                        "❌ <b>Ambiguous value; matches:</b> {}",
                        options.join(", ")
                    ),
                )
                .await;
                return;
            }
        }
    };

    let shown = if spec.private {
        "•••".to_string()
    } else {
        value.to_string()
    };
    match ctx.chat_config.set(chat_id, spec.name, value).await {
        Ok(()) => {
            reply(
                bot,
                msg,
                &format!("✅ <b>Set</b> <code>{}</code> = <i>{}</i>", spec.name, shown),
            )
            .await
        }
        Err(e) => {
            warn!(chat_id, param = spec.name, error = %e, "set failed");
            reply(bot, msg, "❌ <b>Unexpected failure while setting the parameter.</b>").await;
        }
    }
}

/// Type-only parsing for administrator sets.
fn parse_lenient(kind: ParamKind, raw: &str) -> Option<ParamValue> {
    let raw = raw.trim();
    match kind {
        ParamKind::Text => Some(ParamValue::Text(raw.to_string())),
        ParamKind::Integer => raw.parse().ok().map(ParamValue::Integer),
        ParamKind::Decimal => raw.parse().ok().map(ParamValue::Decimal),
        ParamKind::Boolean => match raw.to_lowercase().as_str() {
            "true" => Some(ParamValue::Boolean(true)),
            "false" => Some(ParamValue::Boolean(false)),
            _ => None,
        },
    }
}

/// Apply a named preset, skipping parameters of the inactive endpoint.
pub async fn preset(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>, args: &str) {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let is_admin = ctx.config.is_admin(user_id);

    if !allowed_to_change_settings(bot, ctx, chat_id, user_id).await {
        reply(bot, msg, "❌ <b>Only chat administrators can change parameters.</b>").await;
        return;
    }

    let available: Vec<&str> = schema::presets().iter().map(|(name, _)| *name).collect();
    if args.is_empty() {
        reply(
            bot,
            msg,
            &format!(
                "❌ <b>Usage:</b> <i>/preset [name]</i>\nAvailable: {}",
                available.join(", ")
            ),
        )
        .await;
        return;
    }

    let wanted = args.to_lowercase();
    let Some((_, pairs)) = schema::presets().iter().find(|(name, _)| *name == wanted) else {
        reply(bot, msg, "❌ <b>Unknown preset.</b>").await;
        return;
    };

    let endpoint = ctx
        .chat_config
        .get_text(chat_id, "endpoint")
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "google".to_string());
    let skipped_prefix = if endpoint == "openai" { "g_" } else { "o_" };

    let mut changed: Vec<(&str, String)> = Vec::new();
    for (name, raw) in *pairs {
        if name.starts_with(skipped_prefix) {
            continue;
        }
        // Switching endpoints is an administrative decision.
        if *name == "endpoint" && !is_admin {
            continue;
        }
        let Some(spec) = schema::param(name) else {
            continue;
        };
        let Ok(value) = schema::validate(spec, raw) else {
            continue;
        };

        let current = ctx.chat_config.get(chat_id, name).await.ok();
        if current.as_ref() == Some(&value) {
            continue;
        }
        if ctx.chat_config.set(chat_id, name, value.clone()).await.is_ok() {
            changed.push((name, value.to_string()));
        }
    }

    let mut text = format!("✅ <b>Updated {} parameters:</b>\n", changed.len());
    for (name, value) in &changed {
        text.push_str(&format!("<code>{name}</code> — <i>{value}</i>\n"));
    }
    reply(bot, msg, &text).await;
}

//! Generation orchestration: admission, prompt assembly, dispatch with
//! cross-backend fallback, reply delivery and persistence.
//!
//! This is the only place outcomes become user-visible strings.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::{info, warn};

use tandem_api::tokens::estimate_tokens_default;
use tandem_api::{Backend, GenConfig, MediaPart, Outcome, Prompt, PromptOptions, Usage};
use tandem_store::{MediaKind, StoredMessage};

use crate::context::AppContext;
use crate::files::TelegramFiles;
use crate::send;
use crate::typing::TypingHandle;

/// Synthetic row persisted after an unexplained failure so the model knows a
/// reply never landed.
const FAILURE_NUDGE: &str =
    "Your response was supposed to be here, but you failed to reply for some reason. \
     Be better next time.";

/// Run the full pipeline for a qualifying, already-persisted message.
pub async fn run_generation(bot: &Bot, ctx: &Arc<AppContext>, msg: &Message) {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let request_id: u32 = rand::random_range(100_000..1_000_000);

    info!(
        request_id,
        chat_id,
        user_id,
        message_id = msg.id.0,
        "generation requested"
    );

    let mut endpoint = ctx
        .chat_config
        .get_text(chat_id, "endpoint")
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "google".to_string());
    if endpoint == "openai" && !ctx.config.oai_enabled {
        endpoint = "google".to_string();
    }

    let message_limit = ctx
        .chat_config
        .get_i64(chat_id, "message_limit")
        .await
        .unwrap_or(50);
    let history = match ctx.messages.messages(chat_id, message_limit).await {
        Ok(h) => h,
        Err(e) => {
            warn!(request_id, error = %e, "failed to load history");
            return;
        }
    };

    // Token limit: local lower-bound estimate over the rendered window.
    let mut token_warning = None;
    let token_limit = ctx.chat_config.get_i64(chat_id, "token_limit").await.unwrap_or(0);
    if token_limit > 0 {
        let rendered: String = history
            .iter()
            .map(|m| tandem_api::prompt::render_message(m, false))
            .collect::<Vec<_>>()
            .join("\n");
        let tokens = estimate_tokens_default(&rendered);
        if tokens > token_limit {
            let action = ctx
                .chat_config
                .get_text(chat_id, "token_limit_action")
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "warn".to_string());
            if action == "block" {
                reply_text(
                    bot,
                    msg,
                    &format!(
                        "❌ The conversation exceeds the token limit ({tokens}/{token_limit}). \
                         Use /reset or raise token_limit."
                    ),
                )
                .await;
                return;
            }
            token_warning = Some(format!(
                "⚠️ The conversation exceeds the token limit ({tokens}/{token_limit})."
            ));
        }
    }

    // Hourly rate limit, counted over logged generations.
    let hourly_cap = ctx
        .chat_config
        .get_i64(chat_id, "max_requests_per_hour")
        .await
        .unwrap_or(0);
    if hourly_cap > 0 {
        match ctx.statistics.requests_last_hour(chat_id).await {
            Ok(used) if used >= hourly_cap => {
                info!(request_id, chat_id, used, hourly_cap, "hourly limit hit");
                reply_text(
                    bot,
                    msg,
                    &format!(
                        "❌ This chat reached its hourly request limit ({hourly_cap}). \
                         Try again later."
                    ),
                )
                .await;
                return;
            }
            Err(e) => warn!(request_id, error = %e, "rate limit check failed"),
            _ => {}
        }
    }

    // Per-chat fan-out bound. Holding the permit across the model call and
    // delivery is what serialises heavy work inside one chat.
    let semaphore = ctx.chat_semaphore(chat_id);
    let _permit = match semaphore.acquire().await {
        Ok(p) => p,
        Err(_) => return,
    };

    let cfg = match GenConfig::load(&ctx.chat_config, chat_id).await {
        Ok(c) => c,
        Err(e) => {
            warn!(request_id, error = %e, "failed to load generation config");
            return;
        }
    };
    let show_errors = ctx
        .chat_config
        .get_bool(chat_id, "show_error_messages")
        .await
        .unwrap_or(true);
    let process_markdown = ctx
        .chat_config
        .get_bool(chat_id, "process_markdown")
        .await
        .unwrap_or(true);

    let typing = TypingHandle::start(bot.clone(), msg.chat.id);

    let prompt = assemble_prompt(bot, ctx, msg, &endpoint, &cfg, &history, request_id).await;

    let backend = ctx.backend_for(&endpoint);
    let mut outcome = backend.generate(&prompt, &cfg, request_id).await;
    let mut endpoint_used = endpoint.clone();
    let mut model_used = backend.model(&cfg).to_string();

    // Cross-backend fallback: any OpenAI failure reroutes to Google once,
    // behind a transient notice that is deleted afterwards.
    if endpoint == "openai" && outcome.is_failure() {
        let fallback_on = ctx
            .chat_config
            .get_bool(chat_id, "o_auto_fallback")
            .await
            .unwrap_or(true);
        if fallback_on {
            info!(request_id, "openai failed, falling back to google");
            let notice = bot
                .send_message(
                    msg.chat.id,
                    "⚠️ The OpenAI endpoint failed; rerouting to the Gemini API.",
                )
                .reply_parameters(ReplyParameters::new(msg.id))
                .await;
            outcome = ctx.google.generate(&prompt, &cfg, request_id).await;
            endpoint_used = "google".to_string();
            model_used = cfg.g_model.clone();
            if let Ok(n) = notice {
                let _ = bot.delete_message(msg.chat.id, n.id).await;
            }
        }
    }

    typing.stop().await;
    info!(request_id, "generation complete");

    let (mut reply, usage) = format_outcome(&outcome, &endpoint_used, &cfg, show_errors);
    if let Some(warning) = token_warning {
        reply = format!("{reply}\n\n{warning}");
    }

    if let Some(usage) = usage {
        ctx.statistics
            .log_generation(
                chat_id,
                user_id,
                &endpoint_used,
                &model_used,
                usage.prompt_tokens,
                usage.completion_tokens,
            )
            .await;
    }

    let delivered = send::deliver(bot, msg.chat.id, msg.id, &reply, process_markdown).await;

    match &outcome {
        Outcome::Text { text, .. } => {
            if let Some(sent_id) = delivered {
                let memory_text = send::strip_for_memory(text);
                if !memory_text.is_empty() {
                    let trigger_text = msg.text().or(msg.caption()).unwrap_or("");
                    if let Err(e) = ctx
                        .messages
                        .save_bot_reply(
                            chat_id,
                            sent_id.0 as i64,
                            msg.id.0 as i64,
                            trigger_text,
                            &memory_text,
                        )
                        .await
                    {
                        warn!(request_id, error = %e, "failed to persist reply");
                    }
                }
            }
        }
        Outcome::Unknown { .. } => {
            // Leave a trace in memory so the model knows its reply never
            // landed; censored and quota outcomes persist nothing.
            if let Err(e) = ctx.messages.save_system(chat_id, FAILURE_NUDGE).await {
                warn!(request_id, error = %e, "failed to persist failure nudge");
            }
        }
        _ => {}
    }
}

/// Assemble the provider-neutral prompt: turns, system slot, media parts and
/// the pinned upload key.
async fn assemble_prompt(
    bot: &Bot,
    ctx: &Arc<AppContext>,
    msg: &Message,
    endpoint: &str,
    cfg: &GenConfig,
    history: &[StoredMessage],
    request_id: u32,
) -> Prompt {
    let chat_id = msg.chat.id.0;
    let is_openai = endpoint == "openai";

    let add_reply_to = ctx
        .chat_config
        .get_bool(chat_id, "add_reply_to")
        .await
        .unwrap_or(false);
    let add_system_messages = ctx
        .chat_config
        .get_bool(chat_id, "o_add_system_messages")
        .await
        .unwrap_or(true);
    let add_system_prompt = if is_openai {
        ctx.chat_config
            .get_bool(chat_id, "o_add_system_prompt")
            .await
            .unwrap_or(true)
            && add_system_messages
    } else {
        true
    };
    let clarify = is_openai
        && ctx
            .chat_config
            .get_bool(chat_id, "o_clarify_target_message")
            .await
            .unwrap_or(true);

    let opts = PromptOptions {
        add_reply_to,
        // On the Google shape, 727 rows fold into the system instruction
        // instead of appearing as inline turns.
        add_system_messages: is_openai && add_system_messages,
        clarify_target_message: clarify,
    };

    let mut turns = tandem_api::prompt::group_turns(history, &opts);
    if clarify {
        if let Some(trigger) = history.iter().find(|m| m.message_id == msg.id.0 as i64) {
            tandem_api::prompt::append_clarification(&mut turns, trigger, add_reply_to);
        }
    }

    let mut system = None;
    if add_system_prompt {
        if let Some(template) = &ctx.system_prompt_template {
            let (chat_type, chat_title) = chat_descriptor(msg);
            system = Some(tandem_api::prompt::render_system_prompt(
                template, &chat_type, &chat_title,
            ));
        }
    }
    if !is_openai && add_system_messages {
        if let Some(rules) = tandem_api::prompt::behaviour_rules(history) {
            system = Some(match system {
                Some(base) => format!("{base}\n\n{rules}"),
                None => rules,
            });
        }
    }

    let mut prompt = Prompt {
        system,
        turns,
        media: None,
        pinned_key: None,
    };

    // Media: the nearest photo wins; other media only exists on the Google
    // shape and pins the uploading key for every subsequent attempt.
    let depth = ctx
        .chat_config
        .get_i64(chat_id, "media_context_max_depth")
        .await
        .unwrap_or(5);
    let message_limit = ctx
        .chat_config
        .get_i64(chat_id, "message_limit")
        .await
        .unwrap_or(50);
    let files = TelegramFiles::new(bot.clone());
    let trigger_id = msg.id.0 as i64;

    let vision_allowed = !is_openai || cfg.o_vision;
    let photo_id = match ctx
        .messages
        .file_from_chain(chat_id, trigger_id, MediaKind::Photo, depth, message_limit)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(request_id, error = %e, "photo chain walk failed");
            None
        }
    };

    if let (true, Some(file_id)) = (vision_allowed, photo_id) {
        match ctx.media.photo_base64(&files, &file_id).await {
            Ok(data) => prompt.media = Some(MediaPart::InlinePhoto { data }),
            Err(e) => warn!(request_id, file_id = %file_id, error = %e, "photo fetch failed"),
        }
    } else if !is_openai {
        let other_id = match ctx
            .messages
            .file_from_chain(chat_id, trigger_id, MediaKind::Other, depth, message_limit)
            .await
        {
            Ok(id) => id,
            Err(_) => None,
        };
        if let Some(file_id) = other_id {
            // The upload binds the handle to this key; the dispatcher must
            // reuse it on every attempt.
            match ctx.keys.acquire(cfg.g_web_search) {
                Ok(key) => match ctx.media.upload_other(&files, &file_id, &key).await {
                    Ok(handle) => {
                        prompt.media = Some(MediaPart::FileHandle {
                            mime_type: handle.mime_type,
                            uri: handle.uri,
                        });
                        prompt.pinned_key = Some(key);
                    }
                    Err(e) => {
                        warn!(request_id, file_id = %file_id, error = %e, "media upload failed")
                    }
                },
                Err(e) => warn!(request_id, error = %e, "no key available for media upload"),
            }
        }
    }

    prompt
}

/// `{chat_type}` / `{chat_title}` substitutions for the system prompt.
fn chat_descriptor(msg: &Message) -> (String, String) {
    let is_dm = msg.chat.is_private();
    if is_dm {
        let first_name = msg
            .from
            .as_ref()
            .map(|u| u.first_name.clone())
            .unwrap_or_default();
        ("direct message (DM)".to_string(), format!(" with {first_name}"))
    } else {
        let title = msg.chat.title().unwrap_or_default();
        ("group".to_string(), format!(" called {title}"))
    }
}

/// Turn an outcome into the user-visible reply. Returns the text and, for
/// successful generations, the usage to log.
pub fn format_outcome(
    outcome: &Outcome,
    endpoint: &str,
    cfg: &GenConfig,
    show_errors: bool,
) -> (String, Option<Usage>) {
    match outcome {
        Outcome::Text { text, usage } => (text.clone(), Some(*usage)),
        Outcome::Censored { reason, details } => {
            let mut out = "❌ The request was blocked by the Gemini API censor.".to_string();
            if show_errors {
                out.push_str(&format!("\n\n{reason}"));
                if !details.is_empty() {
                    out.push_str(&format!("\n{}", details.join("\n")));
                }
            }
            (out, None)
        }
        Outcome::QuotaExhausted => (
            "❌ The bot has exhausted its API quota for today. Try again tomorrow.".to_string(),
            None,
        ),
        Outcome::BillingExhausted => (
            "❌ No billing-enabled API keys are available. Disable g_web_search or try later."
                .to_string(),
            None,
        ),
        Outcome::Unavailable => (
            "❌ The Gemini API is temporarily unavailable. Try again later.".to_string(),
            None,
        ),
        Outcome::Internal => (
            "❌ The Gemini API reported an internal failure. Try again later.".to_string(),
            None,
        ),
        Outcome::InvalidArgument { message } => {
            let mut out = "❌ The API rejected the request as invalid.".to_string();
            if cfg.g_web_search {
                out.push_str(
                    "\nGrounding may not be supported by the selected model; \
                     try disabling g_web_search or reverting g_model.",
                );
            }
            if show_errors && !message.is_empty() {
                out.push_str(&format!("\n\n{message}"));
            }
            (out, None)
        }
        Outcome::UnsupportedMedia => (
            "❌ This file type is not supported by the API.".to_string(),
            None,
        ),
        Outcome::Unknown { message, timeout } => {
            let mut out = if *timeout && endpoint == "openai" {
                format!(
                    "❌ The OpenAI endpoint timed out after {}s.",
                    cfg.o_timeout_secs
                )
            } else if endpoint == "openai" {
                "❌ The OpenAI endpoint failed.".to_string()
            } else {
                "❌ The Gemini API failed.".to_string()
            };
            if show_errors && !message.is_empty() {
                out.push_str(&format!("\n\n{message}"));
            }
            (out, None)
        }
    }
}

async fn reply_text(bot: &Bot, msg: &Message, text: &str) {
    let _ = bot
        .send_message(msg.chat.id, text)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GenConfig {
        GenConfig {
            max_output_tokens: 1024,
            g_model: "gemini-1.5-pro-latest".to_string(),
            g_safety_threshold: "none".to_string(),
            g_temperature: 1.0,
            g_top_p: 0.95,
            g_top_k: 40,
            g_code_execution: false,
            g_web_search: false,
            g_web_threshold: 0.73,
            g_web_show_queries: true,
            g_web_show_sources: true,
            g_show_thinking: false,
            o_model: "gpt-4o".to_string(),
            o_url: None,
            o_key: None,
            o_temperature: 1.0,
            o_top_p: 1.0,
            o_frequency_penalty: 0.0,
            o_presence_penalty: 0.0,
            o_timeout_secs: 60,
            o_vision: true,
            o_log_prompt: false,
        }
    }

    #[test]
    fn text_outcome_passes_through_with_usage() {
        let outcome = Outcome::Text {
            text: "hello".to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
            },
        };
        let (reply, usage) = format_outcome(&outcome, "google", &cfg(), true);
        assert_eq!(reply, "hello");
        assert_eq!(usage.unwrap().total_tokens, 12);
    }

    #[test]
    fn failures_are_error_prefixed_without_usage() {
        for outcome in [
            Outcome::QuotaExhausted,
            Outcome::BillingExhausted,
            Outcome::Unavailable,
            Outcome::Internal,
            Outcome::UnsupportedMedia,
        ] {
            let (reply, usage) = format_outcome(&outcome, "google", &cfg(), true);
            assert!(reply.starts_with('❌'), "got: {reply}");
            assert!(usage.is_none());
        }
    }

    #[test]
    fn censored_details_respect_show_errors() {
        let outcome = Outcome::Censored {
            reason: "finish reason SAFETY".to_string(),
            details: vec!["HARM_CATEGORY_HARASSMENT: HIGH".to_string()],
        };
        let (with, _) = format_outcome(&outcome, "google", &cfg(), true);
        assert!(with.contains("HARASSMENT"));
        let (without, _) = format_outcome(&outcome, "google", &cfg(), false);
        assert!(!without.contains("HARASSMENT"));
    }

    #[test]
    fn openai_timeout_mentions_configured_timeout() {
        let outcome = Outcome::Unknown {
            message: "deadline".to_string(),
            timeout: true,
        };
        let (reply, _) = format_outcome(&outcome, "openai", &cfg(), false);
        assert!(reply.contains("60s"), "got: {reply}");
    }

    #[test]
    fn invalid_argument_suggests_reverting_grounding() {
        let mut c = cfg();
        c.g_web_search = true;
        let outcome = Outcome::InvalidArgument {
            message: "bad tool".to_string(),
        };
        let (reply, _) = format_outcome(&outcome, "google", &c, false);
        assert!(reply.contains("g_web_search"));
    }
}

//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event
//! loop until the process exits.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tandem_core::BotConfig;
use tandem_keys::KeyEvent;

use crate::context::AppContext;
use crate::handler::{handle_edited_message, handle_message};

pub struct TelegramAdapter {
    ctx: Arc<AppContext>,
    bot: Bot,
}

impl TelegramAdapter {
    /// Build the bot, honouring `PROXY_URL` for all Telegram traffic.
    pub fn new(config: &BotConfig, ctx: Arc<AppContext>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let bot = Bot::with_client(&config.telegram_token, builder.build()?);
        Ok(Self { ctx, bot })
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Drive the long-polling loop. Never returns.
    ///
    /// `key_events` delivers key pool evictions to the feedback chat.
    pub async fn run(self, key_events: Option<mpsc::UnboundedReceiver<KeyEvent>>) {
        if let Some(rx) = key_events {
            let bot = self.bot.clone();
            let target = self.ctx.config.feedback_target_id;
            tokio::spawn(run_key_event_delivery(bot, target, rx));
        }

        info!("starting long-polling dispatcher");

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_edited_message().endpoint(handle_edited_message));

        Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![self.ctx])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
    }
}

/// Background task forwarding key pool notifications to the admin channel.
async fn run_key_event_delivery(
    bot: Bot,
    target_id: i64,
    mut rx: mpsc::UnboundedReceiver<KeyEvent>,
) {
    while let Some(event) = rx.recv().await {
        let text = format!(
            "⚠️ <b>Key <code>{}</code> left rotation:</b> {}",
            event.key_tail, event.reason
        );
        if let Err(e) = bot
            .send_message(ChatId(target_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            warn!(error = %e, "failed to deliver key event");
        }
    }
    warn!("key event delivery task ended (channel closed)");
}

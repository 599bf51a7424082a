//! Typing indicator — refreshes `sendChatAction` while a generation runs.
//!
//! Telegram's typing status expires after ~5 seconds, so the loop fires
//! every 4. `stop()` awaits the aborted task so no orphan outlives the
//! generation.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;

use tandem_core::config::TYPING_INTERVAL_SECS;

/// Handle to a background typing indicator task.
pub struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    /// Send `ChatAction::Typing` immediately, then every 4 seconds.
    pub fn start(bot: Bot, chat_id: ChatId) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
                tokio::time::sleep(Duration::from_secs(TYPING_INTERVAL_SECS)).await;
            }
        });
        TypingHandle(handle)
    }

    /// Abort the loop and wait for the cancellation to land.
    pub async fn stop(self) {
        self.0.abort();
        let _ = self.0.await;
    }
}

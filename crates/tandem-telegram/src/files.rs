//! Platform file downloads for the media resolver.

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;

use tandem_api::{MediaError, PlatformFiles};

/// `PlatformFiles` over the Telegram Bot API (`get_file` + `download_file`).
pub struct TelegramFiles {
    bot: Bot,
}

impl TelegramFiles {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl PlatformFiles for TelegramFiles {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, MediaError> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| MediaError::Download(format!("get_file: {e}")))?;

        let mut buf: Vec<u8> = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .map_err(|e| MediaError::Download(format!("download_file: {e}")))?;
        Ok(buf)
    }
}

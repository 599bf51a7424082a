//! Injected services shared by every handler. `main()` constructs this once
//! before the dispatcher accepts events.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use lru::LruCache;
use teloxide::prelude::*;
use tokio::sync::Semaphore;

use tandem_api::{Backend, GoogleDispatcher, MediaResolver, OpenAiDispatcher};
use tandem_core::config::CHAT_PERMITS;
use tandem_core::BotConfig;
use tandem_keys::KeyPool;
use tandem_store::{Blacklist, ConfigStore, MessageStore, Statistics};

const TITLE_CACHE_ENTRIES: usize = 1024;

/// A `/set` of a private parameter from a group chat, waiting for the value
/// to arrive over DM. Keyed by user id.
#[derive(Debug, Clone)]
pub struct PendingPrivateSet {
    pub chat_id: i64,
    pub param: &'static str,
}

pub struct AppContext {
    pub config: BotConfig,
    /// Raw pool handle, used only by the admin `/sql` command.
    pub db: sqlx::PgPool,
    pub keys: Arc<KeyPool>,
    pub messages: MessageStore,
    pub chat_config: ConfigStore,
    pub blacklist: Blacklist,
    pub statistics: Statistics,
    pub media: MediaResolver,
    pub google: GoogleDispatcher,
    pub openai: OpenAiDispatcher,

    /// Per-chat generation permits, created lazily.
    chat_semaphores: DashMap<i64, Arc<Semaphore>>,
    /// Private-parameter sets detoured through DM.
    pub pending_private_sets: DashMap<i64, PendingPrivateSet>,
    entity_titles: Mutex<LruCache<i64, String>>,

    pub start_time: chrono::DateTime<chrono::Utc>,
    /// System prompt template with `{chat_type}` / `{chat_title}` slots.
    pub system_prompt_template: Option<String>,
}

impl AppContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        db: sqlx::PgPool,
        keys: Arc<KeyPool>,
        messages: MessageStore,
        chat_config: ConfigStore,
        blacklist: Blacklist,
        statistics: Statistics,
        media: MediaResolver,
        google: GoogleDispatcher,
        openai: OpenAiDispatcher,
        system_prompt_template: Option<String>,
    ) -> Self {
        Self {
            config,
            db,
            keys,
            messages,
            chat_config,
            blacklist,
            statistics,
            media,
            google,
            openai,
            chat_semaphores: DashMap::new(),
            pending_private_sets: DashMap::new(),
            entity_titles: Mutex::new(LruCache::new(
                NonZeroUsize::new(TITLE_CACHE_ENTRIES).unwrap(),
            )),
            start_time: chrono::Utc::now(),
            system_prompt_template,
        }
    }

    /// The dispatcher behind an endpoint tag.
    pub fn backend_for(&self, endpoint: &str) -> &dyn Backend {
        match endpoint {
            "openai" => &self.openai,
            _ => &self.google,
        }
    }

    /// Lazily-created semaphore bounding concurrent generations in a chat.
    pub fn chat_semaphore(&self, chat_id: i64) -> Arc<Semaphore> {
        self.chat_semaphores
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Semaphore::new(CHAT_PERMITS)))
            .clone()
    }

    /// Resolve a chat or user id to a display title, cached.
    pub async fn entity_title(&self, bot: &Bot, target_id: i64) -> String {
        if let Some(hit) = self.entity_titles.lock().unwrap().get(&target_id) {
            return hit.clone();
        }
        let title = match bot.get_chat(ChatId(target_id)).await {
            Ok(chat) => chat
                .title()
                .map(String::from)
                .or_else(|| {
                    let first = chat.first_name().unwrap_or_default();
                    let last = chat.last_name().unwrap_or_default();
                    let full = format!("{first} {last}").trim().to_string();
                    (!full.is_empty()).then_some(full)
                })
                .unwrap_or_else(|| target_id.to_string()),
            Err(_) => target_id.to_string(),
        };
        self.entity_titles
            .lock()
            .unwrap()
            .put(target_id, title.clone());
        title
    }

    /// Drop the caches behind `/dropcaches`.
    pub fn drop_caches(&self) {
        self.chat_config.clear_cache();
        self.blacklist.clear_cache();
        self.entity_titles.lock().unwrap().clear();
    }
}

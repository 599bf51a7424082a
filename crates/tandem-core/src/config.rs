use figment::{providers::Env, Figment};
use serde::Deserialize;

// Shared constants used across the request pipeline.

/// Lines in the key file must start with this prefix to count as keys.
pub const KEY_PREFIX: &str = "AIzaSy";
/// Sender id reserved for the bot's own messages ("assistant" role).
pub const ASSISTANT_SENDER_ID: i64 = 0;
/// Sender id reserved for synthetic system messages.
pub const SYSTEM_SENDER_ID: i64 = 727;
/// In-message sentinel that splices a forced answer (space-delimited).
pub const FORCE_ANSWER_SENTINEL: &str = " --force-answer ";
/// Separator between the model's reply and appended grounding metadata.
/// Everything after it is stripped before the reply is persisted.
pub const GROUNDING_SEPARATOR: &str = "⎯⎯⎯⎯⎯";
/// Typing indicator refresh cadence — Telegram's status expires after ~5s.
pub const TYPING_INTERVAL_SECS: u64 = 4;
/// Per-chat concurrent generation permits.
pub const CHAT_PERMITS: usize = 2;
/// Bodies longer than this are chunked when both parse modes are rejected.
pub const CHUNK_THRESHOLD: usize = 2000;
/// Maximum characters per chunk when splitting a rejected reply.
pub const CHUNK_MAX: usize = 1900;

/// Process environment deserialized into a typed config (no config file —
/// the deployment contract is environment-only).
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub telegram_token: String,
    pub bot_username: String,
    pub data_path: String,
    pub cache_path: String,
    pub logs_path: String,

    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_host: String,
    pub postgres_pool_min_connections: u32,
    pub postgres_pool_max_connections: u32,

    /// Comma-separated global administrator user ids.
    pub admin_ids: String,
    /// Chat that receives feedback and key-pool notifications.
    pub feedback_target_id: i64,

    /// Whether the OpenAI-compatible endpoint may be selected at all.
    pub oai_enabled: bool,
    #[serde(default)]
    pub oai_api_url: Option<String>,
    #[serde(default)]
    pub oai_api_key: Option<String>,

    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Proxy override for grounding-enabled Google requests.
    #[serde(default)]
    pub grounding_proxy_url: Option<String>,
}

impl BotConfig {
    /// Load from process environment. Every §6 required variable must be set.
    pub fn load() -> crate::error::Result<Self> {
        Figment::new()
            .merge(Env::raw())
            .extract()
            .map_err(|e| crate::error::TandemError::Config(e.to_string()))
    }

    /// The bot's own user id — the numeric prefix of the Telegram token.
    pub fn bot_id(&self) -> i64 {
        self.telegram_token
            .split(':')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn admin_ids(&self) -> Vec<i64> {
        self.admin_ids
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids().contains(&user_id)
    }

    /// Connection URL for the Postgres pool. The database name defaults to
    /// the role name, matching the deployment contract.
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}/{}",
            self.postgres_user, self.postgres_password, self.postgres_host, self.postgres_user
        )
    }

    pub fn keys_file_path(&self) -> String {
        format!("{}gemini_api_keys.txt", self.data_path)
    }

    pub fn system_prompt_path(&self) -> String {
        format!("{}system_prompt.txt", self.data_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BotConfig {
        BotConfig {
            telegram_token: "123456:AAE-abcdef".to_string(),
            bot_username: "tandem_bot".to_string(),
            data_path: "/data/".to_string(),
            cache_path: "/cache/".to_string(),
            logs_path: "/logs/".to_string(),
            postgres_user: "tandem".to_string(),
            postgres_password: "hunter2".to_string(),
            postgres_host: "db".to_string(),
            postgres_pool_min_connections: 1,
            postgres_pool_max_connections: 10,
            admin_ids: "111, 222,333".to_string(),
            feedback_target_id: -100_500,
            oai_enabled: true,
            oai_api_url: None,
            oai_api_key: None,
            proxy_url: None,
            grounding_proxy_url: None,
        }
    }

    #[test]
    fn bot_id_is_token_prefix() {
        assert_eq!(sample().bot_id(), 123456);
    }

    #[test]
    fn admin_ids_parse_with_whitespace() {
        assert_eq!(sample().admin_ids(), vec![111, 222, 333]);
    }

    #[test]
    fn postgres_url_defaults_db_to_role() {
        assert_eq!(sample().postgres_url(), "postgres://tandem:hunter2@db/tandem");
    }

    #[test]
    fn key_file_under_data_path() {
        assert_eq!(sample().keys_file_path(), "/data/gemini_api_keys.txt");
    }
}

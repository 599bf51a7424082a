//! Backend capability: the orchestrator depends on this trait, not on an
//! endpoint tag.

use async_trait::async_trait;

use tandem_store::{ConfigStore, StoreError};

use crate::outcome::Outcome;
use crate::prompt::Prompt;

/// Per-chat generation settings, snapshotted from the config store before a
/// dispatch. Carries both backend groups; each dispatcher reads its own.
#[derive(Debug, Clone)]
pub struct GenConfig {
    pub max_output_tokens: i64,

    // Google group
    pub g_model: String,
    pub g_safety_threshold: String,
    pub g_temperature: f64,
    pub g_top_p: f64,
    pub g_top_k: i64,
    pub g_code_execution: bool,
    pub g_web_search: bool,
    pub g_web_threshold: f64,
    pub g_web_show_queries: bool,
    pub g_web_show_sources: bool,
    pub g_show_thinking: bool,

    // OpenAI-compatible group
    pub o_model: String,
    pub o_url: Option<String>,
    pub o_key: Option<String>,
    pub o_temperature: f64,
    pub o_top_p: f64,
    pub o_frequency_penalty: f64,
    pub o_presence_penalty: f64,
    pub o_timeout_secs: i64,
    pub o_vision: bool,
    pub o_log_prompt: bool,
}

impl GenConfig {
    /// Snapshot the generation parameters for one chat.
    pub async fn load(config: &ConfigStore, chat_id: i64) -> Result<Self, StoreError> {
        Ok(Self {
            max_output_tokens: config.get_i64(chat_id, "max_output_tokens").await?,
            g_model: config
                .get_text(chat_id, "g_model")
                .await?
                .unwrap_or_else(|| "gemini-1.5-pro-latest".to_string()),
            g_safety_threshold: config
                .get_text(chat_id, "g_safety_threshold")
                .await?
                .unwrap_or_else(|| "none".to_string()),
            g_temperature: config.get_f64(chat_id, "g_temperature").await?,
            g_top_p: config.get_f64(chat_id, "g_top_p").await?,
            g_top_k: config.get_i64(chat_id, "g_top_k").await?,
            g_code_execution: config.get_bool(chat_id, "g_code_execution").await?,
            g_web_search: config.get_bool(chat_id, "g_web_search").await?,
            g_web_threshold: config.get_f64(chat_id, "g_web_threshold").await?,
            g_web_show_queries: config.get_bool(chat_id, "g_web_show_queries").await?,
            g_web_show_sources: config.get_bool(chat_id, "g_web_show_sources").await?,
            g_show_thinking: config.get_bool(chat_id, "g_show_thinking").await?,
            o_model: config
                .get_text(chat_id, "o_model")
                .await?
                .unwrap_or_else(|| "gpt-4o".to_string()),
            o_url: config.get_text(chat_id, "o_url").await?,
            o_key: config.get_text(chat_id, "o_key").await?,
            o_temperature: config.get_f64(chat_id, "o_temperature").await?,
            o_top_p: config.get_f64(chat_id, "o_top_p").await?,
            o_frequency_penalty: config.get_f64(chat_id, "o_frequency_penalty").await?,
            o_presence_penalty: config.get_f64(chat_id, "o_presence_penalty").await?,
            o_timeout_secs: config.get_i64(chat_id, "o_timeout").await?,
            o_vision: config.get_bool(chat_id, "o_vision").await?,
            o_log_prompt: config.get_bool(chat_id, "o_log_prompt").await?,
        })
    }
}

/// Common contract of the two dispatchers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Endpoint tag stored in statistics rows.
    fn name(&self) -> &'static str;

    /// The model this config selects on this backend.
    fn model<'a>(&self, cfg: &'a GenConfig) -> &'a str;

    /// Dispatch one generation. Every failure folds into an `Outcome`
    /// variant; this never returns a raw error.
    async fn generate(&self, prompt: &Prompt, cfg: &GenConfig, request_id: u32) -> Outcome;

    /// Count (or estimate) the tokens the assembled prompt occupies.
    async fn count_tokens(&self, prompt: &Prompt, cfg: &GenConfig) -> Option<i64>;

    /// Models selectable on this backend.
    async fn list_models(&self) -> Vec<String>;
}

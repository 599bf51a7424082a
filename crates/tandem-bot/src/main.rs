use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tandem_api::{GoogleDispatcher, MediaResolver, OpenAiDispatcher};
use tandem_core::BotConfig;
use tandem_keys::KeyPool;
use tandem_store::{db, Blacklist, ConfigStore, MessageStore, Statistics};
use tandem_telegram::{AppContext, TelegramAdapter};

const DEFAULT_DIRECTIVES: &str =
    "tandem_bot=info,tandem_telegram=info,tandem_api=info,tandem_store=info,tandem_keys=info";

/// Stderr + daily rolling file under `LOGS_PATH`. Returns the writer guard,
/// which must stay alive for the process lifetime.
fn init_tracing(logs_path: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_DIRECTIVES.into())
    };

    if let Err(e) = std::fs::create_dir_all(logs_path) {
        eprintln!("cannot create log directory {logs_path}: {e}; logging to stderr only");
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(logs_path, "tandem.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::load()?;
    let _log_guard = init_tracing(&config.logs_path);

    info!("initializing the database");
    let pool = db::connect(&config).await?;
    db::init_schema(&pool).await?;

    info!("loading API keys");
    let (key_events_tx, key_events_rx) = mpsc::unbounded_channel();
    let keys = Arc::new(KeyPool::from_file(
        &config.keys_file_path(),
        Some(key_events_tx),
    )?);

    let system_prompt_template = match std::fs::read_to_string(config.system_prompt_path()) {
        Ok(template) => Some(template),
        Err(e) => {
            warn!(path = %config.system_prompt_path(), error = %e,
                "system prompt file missing, replies get no system prompt");
            None
        }
    };

    let mut media_client = reqwest::Client::builder();
    if let Some(proxy) = &config.proxy_url {
        media_client = media_client.proxy(reqwest::Proxy::all(proxy)?);
    }

    let google = GoogleDispatcher::new(
        Arc::clone(&keys),
        config.proxy_url.as_deref(),
        config.grounding_proxy_url.as_deref(),
    )?;
    let openai = OpenAiDispatcher::new(config.oai_api_url.clone(), config.oai_api_key.clone());
    let media = MediaResolver::new(media_client.build()?, config.cache_path.clone());

    let ctx = Arc::new(AppContext::new(
        config.clone(),
        pool.clone(),
        keys,
        MessageStore::new(pool.clone()),
        ConfigStore::new(pool.clone()),
        Blacklist::new(pool.clone()),
        Statistics::new(pool),
        media,
        google,
        openai,
        system_prompt_template,
    ));

    let adapter = TelegramAdapter::new(&config, ctx)?;
    info!("starting to receive messages");
    adapter.run(Some(key_events_rx)).await;

    Ok(())
}

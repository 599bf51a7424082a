//! Pool construction and startup schema management.
//!
//! Runs on every boot and is idempotent: create missing tables, add missing
//! columns, realign drifted defaults, sweep orphan config columns.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use tandem_core::BotConfig;

use crate::error::StoreError;

/// Connect the shared Postgres pool using the §6 environment contract.
pub async fn connect(config: &BotConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .min_connections(config.postgres_pool_min_connections)
        .max_connections(config.postgres_pool_max_connections)
        .connect(&config.postgres_url())
        .await?;
    Ok(pool)
}

/// Create all tables and run migrations. Called once from `main` before any
/// event is accepted.
pub async fn init_schema(pool: &PgPool) -> Result<(), StoreError> {
    create_messages_table(pool).await?;
    crate::config_store::migrate_config_table(pool).await?;
    create_blacklist_table(pool).await?;
    crate::statistics::migrate_statistics_table(pool).await?;
    info!("database schema ready");
    Ok(())
}

async fn create_messages_table(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            umid serial PRIMARY KEY,
            chat_id bigint NOT NULL,
            message_id bigint NOT NULL,
            timestamp timestamp NOT NULL,
            sender_id bigint NOT NULL,
            sender_username text,
            sender_name text,
            text text,
            reply_to_message_id bigint DEFAULT NULL,
            reply_to_message_trimmed_text text DEFAULT NULL,
            media_file_id text DEFAULT NULL,
            media_type text DEFAULT NULL,
            deleted boolean NOT NULL DEFAULT false,
            UNIQUE (chat_id, message_id)
        )",
    )
    .execute(pool)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_messages_chat_id_timestamp ON messages (chat_id, timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_messages_chat_id_message_id ON messages (chat_id, message_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_chat_id_deleted ON messages (chat_id, deleted)",
        "CREATE INDEX IF NOT EXISTS idx_messages_chat_id_sender_id ON messages (chat_id, sender_id)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

async fn create_blacklist_table(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS blacklist (
            internal_id serial PRIMARY KEY,
            entity_id bigint NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

//! Per-chat typed parameters with defaults, validation and an LRU read cache.
//!
//! Reads are total: a missing row is materialised with defaults before the
//! first read. Writes invalidate exactly the touched cache entry.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::schema::{chat_config_schema, param, ParamKind, ParamValue};

/// Cached `(chat, param)` reads. 4096 entries covers every hot chat.
const CACHE_ENTRIES: usize = 4096;

pub struct ConfigStore {
    pool: PgPool,
    cache: Mutex<LruCache<(i64, &'static str), ParamValue>>,
}

impl ConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_ENTRIES).unwrap())),
        }
    }

    /// Read one parameter, auto-creating the chat's row on first touch.
    pub async fn get(&self, chat_id: i64, name: &str) -> Result<ParamValue, StoreError> {
        let spec = param(name).ok_or_else(|| StoreError::UnknownParameter(name.to_string()))?;

        if let Some(hit) = self.cache.lock().unwrap().get(&(chat_id, spec.name)) {
            return Ok(hit.clone());
        }

        sqlx::query("INSERT INTO chat_config (chat_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;

        let sql = format!("SELECT {} FROM chat_config WHERE chat_id = $1", spec.name);
        let row = sqlx::query(&sql).bind(chat_id).fetch_one(&self.pool).await?;

        let value = match spec.kind {
            ParamKind::Text => row
                .try_get::<Option<String>, _>(0)?
                .map(ParamValue::Text)
                .unwrap_or(ParamValue::Null),
            ParamKind::Integer => row
                .try_get::<Option<i32>, _>(0)?
                .map(|v| ParamValue::Integer(v as i64))
                .unwrap_or(ParamValue::Null),
            ParamKind::Decimal => row
                .try_get::<Option<f64>, _>(0)?
                .map(ParamValue::Decimal)
                .unwrap_or(ParamValue::Null),
            ParamKind::Boolean => row
                .try_get::<Option<bool>, _>(0)?
                .map(ParamValue::Boolean)
                .unwrap_or(ParamValue::Null),
        };

        self.cache
            .lock()
            .unwrap()
            .put((chat_id, spec.name), value.clone());
        Ok(value)
    }

    /// Write one validated parameter and invalidate its cache entry.
    pub async fn set(
        &self,
        chat_id: i64,
        name: &str,
        value: ParamValue,
    ) -> Result<(), StoreError> {
        let spec = param(name).ok_or_else(|| StoreError::UnknownParameter(name.to_string()))?;

        sqlx::query("INSERT INTO chat_config (chat_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;

        let sql = format!("UPDATE chat_config SET {} = $2 WHERE chat_id = $1", spec.name);
        let query = sqlx::query(&sql).bind(chat_id);
        let query = match &value {
            ParamValue::Text(s) => query.bind(s.clone()),
            ParamValue::Integer(i) => query.bind(*i as i32),
            ParamValue::Decimal(d) => query.bind(*d),
            ParamValue::Boolean(b) => query.bind(*b),
            ParamValue::Null => query.bind(Option::<String>::None),
        };
        query.execute(&self.pool).await?;

        self.cache.lock().unwrap().pop(&(chat_id, spec.name));
        Ok(())
    }

    // Typed convenience accessors. A NULL or mistyped column falls back to
    // the schema default, so callers never branch on ParamValue.

    pub async fn get_text(&self, chat_id: i64, name: &str) -> Result<Option<String>, StoreError> {
        match self.get(chat_id, name).await? {
            ParamValue::Text(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    pub async fn get_i64(&self, chat_id: i64, name: &str) -> Result<i64, StoreError> {
        match self.get(chat_id, name).await? {
            ParamValue::Integer(v) => Ok(v),
            _ => match param(name).map(|s| &s.default) {
                Some(ParamValue::Integer(v)) => Ok(*v),
                _ => Ok(0),
            },
        }
    }

    pub async fn get_f64(&self, chat_id: i64, name: &str) -> Result<f64, StoreError> {
        match self.get(chat_id, name).await? {
            ParamValue::Decimal(v) => Ok(v),
            _ => match param(name).map(|s| &s.default) {
                Some(ParamValue::Decimal(v)) => Ok(*v),
                _ => Ok(0.0),
            },
        }
    }

    pub async fn get_bool(&self, chat_id: i64, name: &str) -> Result<bool, StoreError> {
        match self.get(chat_id, name).await? {
            ParamValue::Boolean(v) => Ok(v),
            _ => match param(name).map(|s| &s.default) {
                Some(ParamValue::Boolean(v)) => Ok(*v),
                _ => Ok(false),
            },
        }
    }

    /// Drop every cached read (`/dropcaches`).
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

/// Startup migration: the table gains a column per schema parameter, drifted
/// defaults are realigned (rows still holding the old default are rewritten),
/// and columns no longer in the schema are dropped.
pub async fn migrate_config_table(pool: &PgPool) -> Result<(), StoreError> {
    let mut ddl = String::from(
        "CREATE TABLE IF NOT EXISTS chat_config (chat_id bigint NOT NULL PRIMARY KEY",
    );
    for spec in chat_config_schema() {
        ddl.push_str(&format!(
            ", {} {} DEFAULT {}",
            spec.name,
            spec.kind.sql_type(),
            spec.default.sql_literal()
        ));
    }
    ddl.push(')');
    sqlx::query(&ddl).execute(pool).await?;

    // Add columns introduced after the table was first created.
    for spec in chat_config_schema() {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns
             WHERE table_name = 'chat_config' AND column_name = $1)",
        )
        .bind(spec.name)
        .fetch_one(pool)
        .await?;

        if !exists {
            warn!(param = spec.name, "config column missing, adding");
            let sql = format!(
                "ALTER TABLE chat_config ADD COLUMN IF NOT EXISTS {} {} DEFAULT {}",
                spec.name,
                spec.kind.sql_type(),
                spec.default.sql_literal()
            );
            sqlx::query(&sql).execute(pool).await?;
        }
    }

    // Realign drifted defaults. Rows that still hold the old default are
    // rewritten to the new one so existing chats pick the change up.
    for spec in chat_config_schema() {
        let current: Option<String> = sqlx::query_scalar(
            "SELECT column_default FROM information_schema.columns
             WHERE table_name = 'chat_config' AND column_name = $1",
        )
        .bind(spec.name)
        .fetch_one(pool)
        .await?;

        let current = match current {
            Some(c) => normalize_default(&c),
            None => "null".to_string(),
        };
        let declared = normalize_default(&spec.default.sql_literal());

        if current != declared {
            warn!(
                param = spec.name,
                db = %current,
                schema = %declared,
                "default value drift, realigning"
            );
            let alter = format!(
                "ALTER TABLE chat_config ALTER COLUMN {} SET DEFAULT {}",
                spec.name,
                spec.default.sql_literal()
            );
            sqlx::query(&alter).execute(pool).await?;

            let old_literal = if current == "null" {
                "NULL".to_string()
            } else if matches!(spec.kind, ParamKind::Text) {
                format!("'{}'", current.replace('\'', "''"))
            } else {
                current.clone()
            };
            let rewrite = format!(
                "UPDATE chat_config SET {} = {} WHERE {} IS NOT DISTINCT FROM {}",
                spec.name,
                spec.default.sql_literal(),
                spec.name,
                old_literal
            );
            let result = sqlx::query(&rewrite).execute(pool).await?;
            info!(
                param = spec.name,
                rows = result.rows_affected(),
                "rewrote rows holding the old default"
            );
        }
    }

    drop_orphan_columns(pool).await?;
    Ok(())
}

/// Drop chat_config columns the schema no longer references.
async fn drop_orphan_columns(pool: &PgPool) -> Result<(), StoreError> {
    let existing: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns WHERE table_name = 'chat_config'",
    )
    .fetch_all(pool)
    .await?;

    for column in existing {
        if column == "chat_id" || param(&column).is_some() {
            continue;
        }
        warn!(column = %column, "dropping orphan config column");
        let sql = format!("ALTER TABLE chat_config DROP COLUMN {column}");
        if let Err(e) = sqlx::query(&sql).execute(pool).await {
            warn!(column = %column, error = %e, "failed to drop orphan column");
        }
    }
    Ok(())
}

/// Strip the `::type` cast and outer quotes Postgres adds to
/// `information_schema.columns.column_default`, lowercasing booleans.
fn normalize_default(raw: &str) -> String {
    let stripped = raw.split("::").next().unwrap_or(raw).trim();
    let unquoted = stripped
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(stripped);
    match unquoted.to_lowercase().as_str() {
        "true" => "true".to_string(),
        "false" => "false".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_cast_and_quotes() {
        assert_eq!(normalize_default("'google'::text"), "google");
        assert_eq!(normalize_default("50"), "50");
        assert_eq!(normalize_default("TRUE"), "true");
        assert_eq!(normalize_default("0.95"), "0.95");
    }

    #[test]
    fn declared_defaults_normalize_to_themselves() {
        for spec in chat_config_schema() {
            let lit = spec.default.sql_literal();
            let normalized = normalize_default(&lit);
            match &spec.default {
                ParamValue::Text(s) => assert_eq!(&normalized, s),
                ParamValue::Null => assert_eq!(normalized, "null"),
                other => assert_eq!(normalized, other.to_string()),
            }
        }
    }
}

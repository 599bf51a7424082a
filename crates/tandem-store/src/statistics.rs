//! Monotone-append generation log and the aggregation queries behind
//! `/stats` and the hourly rate limit.

use chrono::{NaiveDateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::error;

use crate::error::StoreError;

/// Aggregated token usage. Legacy rows that only carry `tokens_consumed`
/// are split 95% prompt / 5% completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTotals {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

pub struct Statistics {
    pool: PgPool,
}

impl Statistics {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one completed generation. Failures are logged, never surfaced:
    /// statistics must not break the reply path.
    pub async fn log_generation(
        &self,
        chat_id: i64,
        user_id: i64,
        endpoint: &str,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) {
        let result = sqlx::query(
            "INSERT INTO statistics_generations
             (timestamp, chat_id, user_id, endpoint, model, context_tokens,
              completion_tokens, tokens_consumed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(Utc::now().naive_utc())
        .bind(chat_id)
        .bind(user_id)
        .bind(endpoint)
        .bind(model)
        .bind(prompt_tokens as i32)
        .bind(completion_tokens as i32)
        .bind((prompt_tokens + completion_tokens) as i32)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, chat_id, "failed to log generation stats");
        }
    }

    /// Requests logged for `chat_id` within the last hour.
    pub async fn requests_last_hour(&self, chat_id: i64) -> Result<i64, StoreError> {
        let cutoff = Utc::now().naive_utc() - chrono::Duration::hours(1);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM statistics_generations
             WHERE chat_id = $1 AND timestamp > $2",
        )
        .bind(chat_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Count and list of distinct users active within the last `days` days.
    pub async fn active_users(&self, days: i64) -> Result<(i64, Vec<i64>), StoreError> {
        let users: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM statistics_generations WHERE timestamp > $1",
        )
        .bind(cutoff_days(days))
        .fetch_all(&self.pool)
        .await?;
        Ok((users.len() as i64, users))
    }

    /// Top users by generation count within the last `days` days.
    pub async fn top_users(
        &self,
        days: i64,
        limit: i64,
    ) -> Result<Vec<(i64, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, COUNT(*) AS generations FROM statistics_generations
             WHERE timestamp > $1
             GROUP BY user_id ORDER BY generations DESC LIMIT $2",
        )
        .bind(cutoff_days(days))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("user_id")?, r.try_get("generations")?)))
            .collect()
    }

    /// Top chats by total token consumption, all time.
    pub async fn top_chats_by_tokens(&self, limit: i64) -> Result<Vec<(i64, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT chat_id, COALESCE(SUM(tokens_consumed), 0)::bigint AS tokens
             FROM statistics_generations
             GROUP BY chat_id ORDER BY tokens DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("chat_id")?, r.try_get("tokens")?)))
            .collect()
    }

    /// Token totals, optionally restricted to the last `days` days.
    ///
    /// Rows written before the two-column form carry only `tokens_consumed`;
    /// those aggregate as 95/5 prompt/completion.
    pub async fn token_totals(&self, days: Option<i64>) -> Result<TokenTotals, StoreError> {
        let mut sql = String::from(
            "SELECT
               COALESCE(SUM(CASE WHEN context_tokens + completion_tokens > 0
                                 THEN context_tokens
                                 ELSE (tokens_consumed * 95) / 100 END), 0)::bigint AS prompt,
               COALESCE(SUM(CASE WHEN context_tokens + completion_tokens > 0
                                 THEN completion_tokens
                                 ELSE tokens_consumed - (tokens_consumed * 95) / 100 END), 0)::bigint AS completion,
               COALESCE(SUM(tokens_consumed), 0)::bigint AS total
             FROM statistics_generations",
        );
        if days.is_some() {
            sql.push_str(" WHERE timestamp > $1");
        }
        let query = sqlx::query(&sql);
        let query = match days {
            Some(d) => query.bind(cutoff_days(d)),
            None => query,
        };
        let row = query.fetch_one(&self.pool).await?;
        Ok(TokenTotals {
            prompt: row.try_get("prompt")?,
            completion: row.try_get("completion")?,
            total: row.try_get("total")?,
        })
    }

    /// Generations within the last `days` days.
    pub async fn generation_count(&self, days: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM statistics_generations WHERE timestamp > $1",
        )
        .bind(cutoff_days(days))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Generations logged for one chat within the last `days` days.
    pub async fn chat_generations(&self, chat_id: i64, days: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM statistics_generations
             WHERE chat_id = $1 AND timestamp > $2",
        )
        .bind(chat_id)
        .bind(cutoff_days(days))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Token totals for one chat within the last `days` days, with the same
    /// legacy 95/5 split as `token_totals`.
    pub async fn chat_token_totals(
        &self,
        chat_id: i64,
        days: i64,
    ) -> Result<TokenTotals, StoreError> {
        let row = sqlx::query(
            "SELECT
               COALESCE(SUM(CASE WHEN context_tokens + completion_tokens > 0
                                 THEN context_tokens
                                 ELSE (tokens_consumed * 95) / 100 END), 0)::bigint AS prompt,
               COALESCE(SUM(CASE WHEN context_tokens + completion_tokens > 0
                                 THEN completion_tokens
                                 ELSE tokens_consumed - (tokens_consumed * 95) / 100 END), 0)::bigint AS completion,
               COALESCE(SUM(tokens_consumed), 0)::bigint AS total
             FROM statistics_generations
             WHERE chat_id = $1 AND timestamp > $2",
        )
        .bind(chat_id)
        .bind(cutoff_days(days))
        .fetch_one(&self.pool)
        .await?;
        Ok(TokenTotals {
            prompt: row.try_get("prompt")?,
            completion: row.try_get("completion")?,
            total: row.try_get("total")?,
        })
    }
}

fn cutoff_days(days: i64) -> NaiveDateTime {
    Utc::now().naive_utc() - chrono::Duration::days(days)
}

/// Create the statistics table and bring legacy single-column deployments up
/// to the two-column form.
pub async fn migrate_statistics_table(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS statistics_generations (
            id serial PRIMARY KEY,
            timestamp timestamp NOT NULL,
            chat_id bigint NOT NULL,
            user_id bigint NOT NULL,
            endpoint text NOT NULL,
            model text,
            context_tokens integer DEFAULT 0,
            completion_tokens integer DEFAULT 0,
            tokens_consumed integer DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    // Legacy tables predate the model and per-direction token columns.
    for ddl in [
        "ALTER TABLE statistics_generations ADD COLUMN IF NOT EXISTS model text",
        "ALTER TABLE statistics_generations ADD COLUMN IF NOT EXISTS context_tokens integer DEFAULT 0",
        "ALTER TABLE statistics_generations ADD COLUMN IF NOT EXISTS completion_tokens integer DEFAULT 0",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_statistics_generations_timestamp
         ON statistics_generations (timestamp DESC)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

//! Deny set over chat and user ids. Both namespaces share one table; reads
//! go through a bounded LRU invalidated on the write path.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sqlx::PgPool;

use crate::error::StoreError;

const CACHE_ENTRIES: usize = 1024;

pub struct Blacklist {
    pool: PgPool,
    cache: Mutex<LruCache<i64, bool>>,
}

impl Blacklist {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_ENTRIES).unwrap())),
        }
    }

    pub async fn is_blacklisted(&self, entity_id: i64) -> Result<bool, StoreError> {
        if let Some(hit) = self.cache.lock().unwrap().get(&entity_id) {
            return Ok(*hit);
        }
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM blacklist WHERE entity_id = $1)",
        )
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;
        self.cache.lock().unwrap().put(entity_id, found);
        Ok(found)
    }

    pub async fn add(&self, entity_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO blacklist (entity_id) VALUES ($1)")
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        self.cache.lock().unwrap().pop(&entity_id);
        Ok(())
    }

    pub async fn remove(&self, entity_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM blacklist WHERE entity_id = $1")
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        self.cache.lock().unwrap().pop(&entity_id);
        Ok(())
    }

    /// Drop every cached verdict (`/dropcaches`).
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::storage;

/// Cached cluster state for one (category, normalized_key) within a run.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub cluster_id: i64,
    pub card_updated_at: Option<DateTime<Utc>>,
}

/// Resolves normalized keys to persistent cluster ids for one pipeline run.
///
/// State machine per (category, key): absent -> insert active; active and
/// fresh -> reuse; active but past the staleness window -> archive (status
/// flip + key mutation frees the slot) and insert a fresh active cluster.
/// The in-memory cache avoids re-reading the same key within a run, and the
/// touched set bounds last_seen_at/title writes to once per cluster per run.
pub struct ClusterResolver {
    stale_after: Duration,
    cache: HashMap<(String, String), ClusterHandle>,
    touched: HashSet<i64>,
}

impl ClusterResolver {
    pub fn new(stale_hours: i64) -> Self {
        Self {
            stale_after: Duration::hours(stale_hours),
            cache: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    /// Resolve (category, key) to an active cluster id, creating or
    /// archiving rows as the staleness window dictates.
    pub async fn resolve(
        &mut self,
        pool: &SqlitePool,
        category: &str,
        normalized_key: &str,
        title: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let cache_key = (category.to_string(), normalized_key.to_string());
        if let Some(handle) = self.cache.get(&cache_key) {
            return Ok(handle.cluster_id);
        }

        let cluster_id = match storage::get_active_cluster(pool, category, normalized_key).await? {
            Some(existing) if now - existing.last_seen_at > self.stale_after => {
                let archived_key = format!(
                    "{}-archived-{}",
                    normalized_key,
                    now.format("%Y%m%d%H%M")
                );
                // Conditional on status so two overlapping runs cannot both
                // archive; the insert below converges either way.
                let archived =
                    storage::archive_cluster(pool, existing.id, &archived_key).await?;
                if archived {
                    info!(
                        cluster_id = existing.id,
                        category, key = normalized_key, "cluster_archived_stale"
                    );
                }
                storage::insert_active_cluster(pool, category, title, normalized_key, now).await?
            }
            Some(existing) => existing.id,
            None => {
                storage::insert_active_cluster(pool, category, title, normalized_key, now).await?
            }
        };

        let card_updated_at = storage::get_card_updated_at(pool, cluster_id).await?;
        self.cache.insert(
            cache_key,
            ClusterHandle {
                cluster_id,
                card_updated_at,
            },
        );
        Ok(cluster_id)
    }

    /// Bump last_seen_at and title, at most once per cluster per run.
    /// Returns whether this call was the one that touched the cluster.
    pub async fn touch(
        &mut self,
        pool: &SqlitePool,
        cluster_id: i64,
        title: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.touched.insert(cluster_id) {
            return Ok(false);
        }
        storage::touch_cluster(pool, cluster_id, title, now).await?;
        Ok(true)
    }

    pub fn card_updated_at(&self, category: &str, normalized_key: &str) -> Option<DateTime<Utc>> {
        self.cache
            .get(&(category.to_string(), normalized_key.to_string()))
            .and_then(|h| h.card_updated_at)
    }

    /// Record a fresh card write so later entries in the same run see the
    /// cooldown start now.
    pub fn record_card_published(
        &mut self,
        category: &str,
        normalized_key: &str,
        at: DateTime<Utc>,
    ) {
        if let Some(handle) = self
            .cache
            .get_mut(&(category.to_string(), normalized_key.to_string()))
        {
            handle.card_updated_at = Some(at);
        }
    }
}

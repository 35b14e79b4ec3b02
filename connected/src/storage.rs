use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::cards::Card;

/// A configured feed source. Owned by the admin surface; read-only to the
/// pipeline and immutable during a run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub source_type: String,
    pub url: String,
    pub category: String,
    pub enabled: bool,
}

/// Seed payload for the admin source-seeding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSeed {
    pub name: String,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    pub url: String,
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_source_type() -> String {
    "rss".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A persistent story cluster row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoryCluster {
    pub id: i64,
    pub category: String,
    pub title: String,
    pub normalized_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: String,
}

/// A published card row as served to readers and the brief generator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedCardRow {
    pub cluster_id: i64,
    pub category: String,
    pub card: String,
    pub updated_at: DateTime<Utc>,
}

impl FeedCardRow {
    pub fn card_value(&self) -> Value {
        serde_json::from_str(&self.card).unwrap_or(Value::Null)
    }
}

/// A card about to be written: one per cluster, overwritten in place.
#[derive(Debug, Clone)]
pub struct FeedCardRecord {
    pub cluster_id: i64,
    pub category: String,
    pub card: Card,
    pub qa: Value,
    pub model: Option<String>,
    pub prompt_version: String,
    pub updated_at: DateTime<Utc>,
    pub published: bool,
}

impl FeedCardRecord {
    /// A card without sources is never persisted; the synthesizer guarantees
    /// the originating URL is present, and this constructor enforces it.
    pub fn new(
        cluster_id: i64,
        category: String,
        card: Card,
        qa: Value,
        model: Option<String>,
        prompt_version: String,
        updated_at: DateTime<Utc>,
    ) -> Result<Self> {
        if card.sources.is_empty() {
            anyhow::bail!("refusing to build a feed card with empty sources");
        }
        Ok(Self {
            cluster_id,
            category,
            card,
            qa,
            model,
            prompt_version,
            updated_at,
            published: true,
        })
    }
}

/// The per-(brief_date, audience) container of brief editions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BriefDayRow {
    pub brief_date: String,
    pub audience: String,
    pub editions: String,
    pub latest_edition: Option<String>,
}

impl BriefDayRow {
    pub fn editions_value(&self) -> Value {
        serde_json::from_str(&self.editions).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Create the tables and indexes this pipeline relies on. Idempotent; the
/// uniqueness constraints here are what make concurrent runs converge.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS news_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            source_type TEXT NOT NULL DEFAULT 'rss',
            url TEXT NOT NULL UNIQUE,
            category TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        )"#,
        r#"CREATE TABLE IF NOT EXISTS news_articles_raw (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES news_sources(id),
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            published_at TEXT,
            summary TEXT,
            fetched_at TEXT NOT NULL,
            raw_payload TEXT NOT NULL,
            UNIQUE (source_id, url)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS news_story_clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            title TEXT NOT NULL,
            normalized_key TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            UNIQUE (category, normalized_key)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS news_cluster_articles (
            cluster_id INTEGER NOT NULL REFERENCES news_story_clusters(id),
            article_id INTEGER NOT NULL REFERENCES news_articles_raw(id),
            PRIMARY KEY (cluster_id, article_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS news_feed_cards (
            cluster_id INTEGER PRIMARY KEY REFERENCES news_story_clusters(id),
            category TEXT NOT NULL,
            card TEXT NOT NULL,
            qa TEXT,
            model TEXT,
            prompt_version TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            published INTEGER NOT NULL DEFAULT 1
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_feed_cards_category_updated
            ON news_feed_cards (category, updated_at)"#,
        r#"CREATE TABLE IF NOT EXISTS news_daily_briefs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            brief_date TEXT NOT NULL,
            audience TEXT NOT NULL,
            editions TEXT NOT NULL,
            latest_edition TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (brief_date, audience)
        )"#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to ensure schema")?;
    }

    Ok(())
}

/// Enabled RSS sources, category-then-name ordered for stable iteration.
pub async fn list_enabled_sources(pool: &SqlitePool) -> Result<Vec<Source>> {
    let sources = sqlx::query_as::<_, Source>(
        "SELECT id, name, source_type, url, category, enabled \
         FROM news_sources WHERE enabled = 1 AND source_type = 'rss' \
         ORDER BY category, name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list enabled sources")?;
    Ok(sources)
}

/// Upsert sources by URL. Returns the number of rows written.
pub async fn seed_sources(pool: &SqlitePool, sources: &[SourceSeed]) -> Result<usize> {
    let mut written = 0usize;
    for s in sources {
        sqlx::query(
            "INSERT INTO news_sources (name, source_type, url, category, enabled) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (url) DO UPDATE SET \
               name = excluded.name, \
               source_type = excluded.source_type, \
               category = excluded.category, \
               enabled = excluded.enabled",
        )
        .bind(&s.name)
        .bind(&s.source_type)
        .bind(&s.url)
        .bind(&s.category)
        .bind(s.enabled)
        .execute(pool)
        .await
        .with_context(|| format!("failed to seed source {}", s.url))?;
        written += 1;
    }
    Ok(written)
}

/// Upsert a raw article sighting keyed on (source_id, url); every sighting
/// refreshes the payload. Returns the article id.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_raw_article(
    pool: &SqlitePool,
    source_id: i64,
    url: &str,
    title: &str,
    published_at: Option<DateTime<Utc>>,
    summary: Option<&str>,
    fetched_at: DateTime<Utc>,
    raw_payload: &Value,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO news_articles_raw \
           (source_id, url, title, published_at, summary, fetched_at, raw_payload) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (source_id, url) DO UPDATE SET \
           title = excluded.title, \
           published_at = excluded.published_at, \
           summary = excluded.summary, \
           fetched_at = excluded.fetched_at, \
           raw_payload = excluded.raw_payload \
         RETURNING id",
    )
    .bind(source_id)
    .bind(url)
    .bind(title)
    .bind(published_at)
    .bind(summary)
    .bind(fetched_at)
    .bind(raw_payload.to_string())
    .fetch_one(pool)
    .await
    .context("failed to upsert raw article")?;
    Ok(id)
}

/// The active cluster for (category, key), if any. Archived rows have a
/// mutated key and never match.
pub async fn get_active_cluster(
    pool: &SqlitePool,
    category: &str,
    normalized_key: &str,
) -> Result<Option<StoryCluster>> {
    let cluster = sqlx::query_as::<_, StoryCluster>(
        "SELECT id, category, title, normalized_key, first_seen_at, last_seen_at, status \
         FROM news_story_clusters \
         WHERE category = ? AND normalized_key = ? AND status = 'active' \
         LIMIT 1",
    )
    .bind(category)
    .bind(normalized_key)
    .fetch_optional(pool)
    .await
    .context("failed to read active cluster")?;
    Ok(cluster)
}

/// Flip a stale cluster to archived and mutate its key to free the
/// (category, normalized_key) slot. Conditional on the row still being
/// active so overlapping runs cannot double-archive.
pub async fn archive_cluster(pool: &SqlitePool, cluster_id: i64, archived_key: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE news_story_clusters SET status = 'archived', normalized_key = ? \
         WHERE id = ? AND status = 'active'",
    )
    .bind(archived_key)
    .bind(cluster_id)
    .execute(pool)
    .await
    .context("failed to archive cluster")?;
    Ok(result.rows_affected() > 0)
}

/// Insert an active cluster for (category, key), converging with concurrent
/// runs via ON CONFLICT DO NOTHING + re-read. Returns the winning row id.
pub async fn insert_active_cluster(
    pool: &SqlitePool,
    category: &str,
    title: &str,
    normalized_key: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    sqlx::query(
        "INSERT INTO news_story_clusters \
           (category, title, normalized_key, first_seen_at, last_seen_at, status) \
         VALUES (?, ?, ?, ?, ?, 'active') \
         ON CONFLICT (category, normalized_key) DO NOTHING",
    )
    .bind(category)
    .bind(title)
    .bind(normalized_key)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert active cluster")?;

    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM news_story_clusters WHERE category = ? AND normalized_key = ? LIMIT 1",
    )
    .bind(category)
    .bind(normalized_key)
    .fetch_one(pool)
    .await
    .context("failed to re-read cluster after insert")?;
    Ok(id)
}

/// Advance last_seen_at and refresh the display title.
pub async fn touch_cluster(
    pool: &SqlitePool,
    cluster_id: i64,
    title: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE news_story_clusters SET last_seen_at = ?, title = ? WHERE id = ?")
        .bind(now)
        .bind(title)
        .bind(cluster_id)
        .execute(pool)
        .await
        .context("failed to touch cluster")?;
    Ok(())
}

/// Idempotent cluster<->article linkage; replaying an article is a no-op.
pub async fn link_article(pool: &SqlitePool, cluster_id: i64, article_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO news_cluster_articles (cluster_id, article_id) VALUES (?, ?)",
    )
    .bind(cluster_id)
    .bind(article_id)
    .execute(pool)
    .await
    .context("failed to link article to cluster")?;
    Ok(())
}

pub async fn get_card_updated_at(
    pool: &SqlitePool,
    cluster_id: i64,
) -> Result<Option<DateTime<Utc>>> {
    let updated_at = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT updated_at FROM news_feed_cards WHERE cluster_id = ? LIMIT 1",
    )
    .bind(cluster_id)
    .fetch_optional(pool)
    .await
    .context("failed to read card updated_at")?;
    Ok(updated_at)
}

/// Write the one card a cluster owns, overwriting in place.
pub async fn upsert_feed_card(pool: &SqlitePool, record: &FeedCardRecord) -> Result<()> {
    let card_json = serde_json::to_string(&record.card).context("failed to serialize card")?;
    let qa_json = record.qa.to_string();

    sqlx::query(
        "INSERT INTO news_feed_cards \
           (cluster_id, category, card, qa, model, prompt_version, updated_at, published) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (cluster_id) DO UPDATE SET \
           category = excluded.category, \
           card = excluded.card, \
           qa = excluded.qa, \
           model = excluded.model, \
           prompt_version = excluded.prompt_version, \
           updated_at = excluded.updated_at, \
           published = excluded.published",
    )
    .bind(record.cluster_id)
    .bind(&record.category)
    .bind(card_json)
    .bind(qa_json)
    .bind(record.model.as_deref())
    .bind(&record.prompt_version)
    .bind(record.updated_at)
    .bind(record.published)
    .execute(pool)
    .await
    .context("failed to upsert feed card")?;
    Ok(())
}

/// Published cards for one category updated since `since`, newest first.
pub async fn recent_cards_for_category(
    pool: &SqlitePool,
    category: &str,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<FeedCardRow>> {
    let rows = sqlx::query_as::<_, FeedCardRow>(
        "SELECT cluster_id, category, card, updated_at FROM news_feed_cards \
         WHERE published = 1 AND category = ? AND updated_at > ? \
         ORDER BY updated_at DESC LIMIT ?",
    )
    .bind(category)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to select recent cards")?;
    Ok(rows)
}

/// Latest published cards across categories, for the read surface.
pub async fn latest_feed_cards(pool: &SqlitePool, limit: i64) -> Result<Vec<FeedCardRow>> {
    let rows = sqlx::query_as::<_, FeedCardRow>(
        "SELECT cluster_id, category, card, updated_at FROM news_feed_cards \
         WHERE published = 1 ORDER BY updated_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list feed cards")?;
    Ok(rows)
}

pub async fn get_brief_day(
    pool: &SqlitePool,
    brief_date: &str,
    audience: &str,
) -> Result<Option<BriefDayRow>> {
    let row = sqlx::query_as::<_, BriefDayRow>(
        "SELECT brief_date, audience, editions, latest_edition FROM news_daily_briefs \
         WHERE brief_date = ? AND audience = ? LIMIT 1",
    )
    .bind(brief_date)
    .bind(audience)
    .fetch_optional(pool)
    .await
    .context("failed to read daily brief")?;
    Ok(row)
}

/// Upsert the (brief_date, audience) container with its editions map and
/// latest_edition pointer.
pub async fn upsert_brief_day(
    pool: &SqlitePool,
    brief_date: &str,
    audience: &str,
    editions: &Value,
    latest_edition: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO news_daily_briefs \
           (brief_date, audience, editions, latest_edition, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (brief_date, audience) DO UPDATE SET \
           editions = excluded.editions, \
           latest_edition = excluded.latest_edition, \
           updated_at = excluded.updated_at",
    )
    .bind(brief_date)
    .bind(audience)
    .bind(editions.to_string())
    .bind(latest_edition)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to upsert daily brief")?;
    Ok(())
}

/// Count of articles linked to a cluster (used by tests and stats).
pub async fn cluster_article_count(pool: &SqlitePool, cluster_id: i64) -> Result<i64> {
    let count = sqlx::query(
        "SELECT COUNT(*) AS n FROM news_cluster_articles WHERE cluster_id = ?",
    )
    .bind(cluster_id)
    .fetch_one(pool)
    .await
    .context("failed to count cluster articles")?
    .get::<i64, _>("n");
    Ok(count)
}

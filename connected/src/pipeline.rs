use anyhow::Result;
use chrono::{Duration, Utc};
use common::{Config, NewsConfig};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

use crate::cards::{self, strip_html};
use crate::cluster::ClusterResolver;
use crate::feedparse::{self, FeedEntry};
use crate::fetcher::FeedFetcher;
use crate::llm::Router;
use crate::normalize;
use crate::storage::{self, FeedCardRecord, Source};

/// Aggregated counters for one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub sources: usize,
    pub articles_fetched: usize,
    pub articles_upserted: usize,
    pub clusters_touched: usize,
    pub cards_published: usize,
}

/// One full ingestion run: fetch -> parse -> cluster -> publish across all
/// enabled sources, grouped by category in sorted order, bounded by the
/// per-source, per-category and total entry caps.
///
/// Per-item failures are logged and skipped; a bad source or entry never
/// aborts the run. Re-running against the same feed state converges on the
/// same cluster/card state, modulo cooldown-gated skips.
pub async fn run_news_pipeline(
    pool: &SqlitePool,
    config: &Config,
    router: Option<&Router>,
) -> Result<PipelineStats> {
    info!("news_pipeline_start");

    let news = &config.news;
    let sources = storage::list_enabled_sources(pool).await?;
    if sources.is_empty() {
        info!("news_pipeline_no_sources");
        return Ok(PipelineStats::default());
    }

    let mut by_category: BTreeMap<String, Vec<Source>> = BTreeMap::new();
    for source in sources {
        by_category
            .entry(source.category.clone())
            .or_default()
            .push(source);
    }

    let total_cap = news
        .max_total_entries
        .unwrap_or(news.max_entries_per_category * by_category.len());
    let cooldown = Duration::minutes(news.card_cooldown_minutes);

    let fetcher = FeedFetcher::new(&config.http)?;
    let mut resolver = ClusterResolver::new(news.cluster_stale_hours);
    let mut stats = PipelineStats {
        sources: by_category.values().map(Vec::len).sum(),
        ..Default::default()
    };
    let mut total_seen = 0usize;

    'categories: for (category, category_sources) in &by_category {
        let mut category_seen = 0usize;

        for source in category_sources {
            if total_seen >= total_cap {
                break 'categories;
            }
            if category_seen >= news.max_entries_per_category {
                break;
            }

            let Some(body) = fetcher.fetch(&source.name, &source.url).await else {
                continue;
            };
            let parsed = match feedparse::parse_feed(&body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    info!(source = %source.name, url = %source.url, error = %e,
                          "news_source_parse_error");
                    continue;
                }
            };

            let mut seen_links: HashSet<String> = HashSet::new();
            for entry in parsed.entries.iter().take(news.max_entries_per_source) {
                if total_seen >= total_cap || category_seen >= news.max_entries_per_category {
                    break;
                }
                stats.articles_fetched += 1;
                total_seen += 1;
                category_seen += 1;

                if let Err(e) = process_entry(
                    pool,
                    router,
                    news,
                    &mut resolver,
                    cooldown,
                    source,
                    parsed.title.as_deref(),
                    entry,
                    &mut seen_links,
                    &mut stats,
                )
                .await
                {
                    warn!(source = %source.name, category = %category,
                          link = entry.link.as_deref().unwrap_or(""),
                          error = %e, "news_entry_skipped");
                }
            }
        }
    }

    info!(
        sources = stats.sources,
        articles_fetched = stats.articles_fetched,
        articles_upserted = stats.articles_upserted,
        clusters_touched = stats.clusters_touched,
        cards_published = stats.cards_published,
        "news_pipeline_done"
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
async fn process_entry(
    pool: &SqlitePool,
    router: Option<&Router>,
    news: &NewsConfig,
    resolver: &mut ClusterResolver,
    cooldown: Duration,
    source: &Source,
    feed_title: Option<&str>,
    entry: &FeedEntry,
    seen_links: &mut HashSet<String>,
    stats: &mut PipelineStats,
) -> Result<()> {
    let Some(link) = entry.link.as_deref().filter(|l| !l.is_empty()) else {
        return Ok(());
    };
    let Some(title) = entry.title.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    // Dedup by link within this source's batch.
    if !seen_links.insert(link.to_string()) {
        return Ok(());
    }

    let now = Utc::now();
    let summary = entry.summary.as_deref();
    let raw_payload = json!({
        "feed_title": feed_title,
        "entry": {
            "title": entry.title,
            "link": entry.link,
            "summary": entry.summary,
            "published": entry.published,
        },
    });

    let article_id = storage::upsert_raw_article(
        pool,
        source.id,
        link,
        title,
        entry.published,
        summary,
        now,
        &raw_payload,
    )
    .await?;
    stats.articles_upserted += 1;

    let extra = if news.key_include_summary {
        summary.and_then(first_sentence)
    } else {
        None
    };
    let key_input = normalize::key_text(title, extra.as_deref());
    let normalized_key = normalize::normalize_story_key(&key_input);

    let cluster_id = resolver
        .resolve(pool, &source.category, &normalized_key, title, now)
        .await?;
    if resolver.touch(pool, cluster_id, title, now).await? {
        stats.clusters_touched += 1;
    }
    storage::link_article(pool, cluster_id, article_id).await?;

    // Publish gate: an unchanged cluster is not re-synthesized inside the
    // cooldown window; linkage and last_seen_at above still happened.
    if let Some(updated_at) = resolver.card_updated_at(&source.category, &normalized_key) {
        if now - updated_at < cooldown {
            return Ok(());
        }
    }

    let synthesized = cards::synthesize_card(router, &source.category, title, link, summary).await;
    let record = FeedCardRecord::new(
        cluster_id,
        source.category.clone(),
        synthesized.card,
        synthesized.qa,
        synthesized.model,
        synthesized.prompt_version.to_string(),
        now,
    )?;
    storage::upsert_feed_card(pool, &record).await?;
    resolver.record_card_published(&source.category, &normalized_key, now);
    stats.cards_published += 1;

    Ok(())
}

fn first_sentence(summary: &str) -> Option<String> {
    let cleaned = strip_html(summary);
    cleaned
        .split(['.', '!', '?'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

use anyhow::Result;
use chrono::{Duration, Utc};
use common::{BriefConfig, Config};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::llm::{CompletionRequest, Router};
use crate::storage::{self, FeedCardRow};

/// Named time-of-day slot for a daily brief; each is an independent
/// regeneration unit sharing the calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edition {
    Morning,
    Midday,
    Evening,
}

impl Edition {
    pub const ALL: [Edition; 3] = [Edition::Morning, Edition::Midday, Edition::Evening];

    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Morning => "morning",
            Edition::Midday => "midday",
            Edition::Evening => "evening",
        }
    }
}

impl FromStr for Edition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "morning" => Ok(Edition::Morning),
            "midday" => Ok(Edition::Midday),
            "evening" => Ok(Edition::Evening),
            other => anyhow::bail!("unknown edition '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BriefStats {
    pub audience: String,
    pub brief_date: String,
    pub edition: String,
    pub items_selected: usize,
    pub stored: bool,
    pub skipped_existing: bool,
}

/// Generate one edition of the daily brief for an audience.
///
/// Selects the most recently updated published cards per topic, asks the
/// router for per-topic overviews and one cross-topic overview, and writes
/// the edition into the (brief_date, audience) container. An edition already
/// generated today is not regenerated unless forced.
pub async fn run_daily_brief(
    pool: &SqlitePool,
    config: &Config,
    router: Option<&Router>,
    audience: &str,
    edition: Edition,
    force: bool,
) -> Result<BriefStats> {
    let now = Utc::now();
    let brief_date = now.date_naive().to_string();
    info!(audience, brief_date = %brief_date, edition = edition.as_str(), "daily_brief_start");

    let existing = storage::get_brief_day(pool, &brief_date, audience).await?;
    let mut editions = existing
        .map(|row| row.editions_value())
        .unwrap_or_else(|| json!({}));
    if !editions.is_object() {
        editions = json!({});
    }

    if !force {
        if let Some(doc) = editions.get(edition.as_str()).filter(|d| d.is_object()) {
            info!(audience, brief_date = %brief_date, edition = edition.as_str(),
                  "daily_brief_skip_existing");
            let items_selected = doc
                .get("items")
                .and_then(|i| i.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            return Ok(BriefStats {
                audience: audience.to_string(),
                brief_date,
                edition: edition.as_str().to_string(),
                items_selected,
                stored: true,
                skipped_existing: true,
            });
        }
    }

    // Overviews of the other editions already generated today; handing them
    // to the overview prompt reduces repetition between editions.
    let previous_overviews: Vec<Value> = Edition::ALL
        .iter()
        .filter(|e| **e != edition)
        .filter_map(|e| {
            editions
                .get(e.as_str())
                .and_then(|doc| doc.get("overview"))
                .and_then(|o| o.as_str())
                .map(|o| json!({"edition": e.as_str(), "overview": o}))
        })
        .collect();

    let brief_cfg = &config.brief;
    let max_topics = brief_cfg.max_topics.unwrap_or(brief_cfg.topics.len());
    let since = now - Duration::hours(brief_cfg.lookback_hours);

    let mut topic_sections: Vec<Value> = Vec::new();
    let mut all_items: Vec<Value> = Vec::new();

    for topic in brief_cfg.topics.iter().take(max_topics) {
        let rows = storage::recent_cards_for_category(
            pool,
            topic,
            since,
            (brief_cfg.items_per_topic * 3) as i64,
        )
        .await?;
        let rows = dedupe_by_cluster(rows, brief_cfg.items_per_topic);

        let topic_items: Vec<Value> = rows.iter().map(full_item).collect();
        let llm_items: Vec<Value> = rows.iter().map(compact_item).collect();

        let mut section =
            topic_brief_section(router, topic, &brief_date, &llm_items, brief_cfg).await;
        section["items"] = Value::Array(topic_items.clone());
        topic_sections.push(section);

        all_items.extend(topic_items.into_iter().take(3));
    }
    all_items.truncate(25);
    let items_selected = all_items.len();
    let topics_count = topic_sections.len();

    let mut doc = json!({
        "brief_date": brief_date,
        "audience": audience,
        "edition": edition.as_str(),
        "generated_at": now.to_rfc3339(),
        "overview": null,
        "tags": [],
        "topics": topic_sections,
        "items": all_items,
        "previous_overviews": previous_overviews,
    });
    apply_cross_topic_overview(router, &mut doc, brief_cfg).await;

    editions[edition.as_str()] = doc;
    storage::upsert_brief_day(pool, &brief_date, audience, &editions, edition.as_str(), now)
        .await?;

    info!(
        audience,
        brief_date = %brief_date,
        edition = edition.as_str(),
        topics = topics_count,
        items_selected,
        "daily_brief_generated"
    );

    Ok(BriefStats {
        audience: audience.to_string(),
        brief_date,
        edition: edition.as_str().to_string(),
        items_selected,
        stored: true,
        skipped_existing: false,
    })
}

/// Keep the first row per cluster, bounded by `limit`.
pub fn dedupe_by_cluster(rows: Vec<FeedCardRow>, limit: usize) -> Vec<FeedCardRow> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if !seen.insert(row.cluster_id) {
            continue;
        }
        out.push(row);
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// The full item shape embedded in the brief document.
fn full_item(row: &FeedCardRow) -> Value {
    let card = row.card_value();
    json!({
        "category": row.category,
        "title": card.get("title").cloned().unwrap_or(Value::Null),
        "what_happened": card.get("what_happened").cloned().unwrap_or(Value::Null),
        "why_it_matters": card.get("why_it_matters").cloned().unwrap_or_else(|| json!([])),
        "talk_track": card.get("talk_track").cloned().unwrap_or(Value::Null),
        "smart_question": card.get("smart_question").cloned().unwrap_or(Value::Null),
        "sources": card.get("sources").cloned().unwrap_or_else(|| json!([])),
        "updated_at": row.updated_at.to_rfc3339(),
    })
}

/// The compact payload handed to the topic prompt.
fn compact_item(row: &FeedCardRow) -> Value {
    let card = row.card_value();
    let url = card
        .get("sources")
        .and_then(|s| s.as_array())
        .and_then(|a| a.first())
        .and_then(|s| s.get("url"))
        .cloned()
        .unwrap_or(Value::Null);
    json!({
        "title": card.get("title").cloned().unwrap_or(Value::Null),
        "what_happened": card.get("what_happened").cloned().unwrap_or(Value::Null),
        "url": url,
    })
}

async fn topic_brief_section(
    router: Option<&Router>,
    topic: &str,
    brief_date: &str,
    items: &[Value],
    brief_cfg: &BriefConfig,
) -> Value {
    let empty_section = |mode: &str| {
        json!({
            "topic": topic,
            "overview": null,
            "tags": [],
            "conversation_starters": [],
            "mode": mode,
        })
    };

    let Some(router) = router else {
        return empty_section("no_llm");
    };
    if items.is_empty() {
        return empty_section("no_items");
    }

    let system = "You write a daily brief for young professionals. \
                  Be concise, neutral, and avoid hype. Do not invent facts. \
                  Only reference what is clearly supported by the provided items.";
    let user = json!({
        "topic": topic,
        "brief_date": brief_date,
        "items": items,
        "required_json": {
            "overview": "string, 3-5 sentences max",
            "tags": "array of up to 8 strings",
            "conversation_starters": "array of up to 3 short questions",
        },
    });
    let request = CompletionRequest {
        purpose: "topic_brief".to_string(),
        system: system.to_string(),
        user,
        temperature: 0.3,
        max_tokens: brief_cfg.max_tokens,
    };

    let (value, meta) = router.complete_json(&request).await;
    match value {
        Some(v) => json!({
            "topic": topic,
            "overview": v.get("overview").cloned().unwrap_or(Value::Null),
            "tags": v.get("tags").cloned().unwrap_or_else(|| json!([])),
            "conversation_starters": v
                .get("conversation_starters")
                .cloned()
                .unwrap_or_else(|| json!([])),
            "mode": "llm",
            "model": meta.model,
        }),
        None => json!({
            "topic": topic,
            "overview": null,
            "tags": [],
            "conversation_starters": [],
            "mode": "llm_error",
            "error": meta.error,
        }),
    }
}

/// One more router call spanning all selected topics' top items. The exact
/// paragraph structure is demanded in the instruction text only; the output
/// is trusted (soft contract).
async fn apply_cross_topic_overview(
    router: Option<&Router>,
    doc: &mut Value,
    brief_cfg: &BriefConfig,
) {
    let Some(router) = router else {
        return;
    };
    let items: Vec<Value> = doc
        .get("items")
        .and_then(|i| i.as_array())
        .map(|a| a.iter().take(15).cloned().collect())
        .unwrap_or_default();
    if items.is_empty() {
        return;
    }

    let system = "You write a morning/midday/evening brief for young professionals. \
                  Be concise, neutral, and avoid hype. Do not invent facts.";
    let user = json!({
        "brief_date": doc.get("brief_date").cloned().unwrap_or(Value::Null),
        "edition": doc.get("edition").cloned().unwrap_or(Value::Null),
        "items": items,
        "previous_overviews": doc.get("previous_overviews").cloned().unwrap_or_else(|| json!([])),
        "required_json": {
            "overview": "string, exactly two paragraphs separated by a blank line: \
                         first a 2-3 sentence synthesis across topics, \
                         then a 1-2 sentence forward look; \
                         do not repeat the previous_overviews",
            "tags": "array of up to 8 strings",
        },
    });
    let request = CompletionRequest {
        purpose: "brief_overview".to_string(),
        system: system.to_string(),
        user,
        temperature: 0.3,
        max_tokens: brief_cfg.max_tokens,
    };

    let (value, meta) = router.complete_json(&request).await;
    match value {
        Some(v) => {
            doc["overview"] = v.get("overview").cloned().unwrap_or(Value::Null);
            doc["tags"] = v.get("tags").cloned().unwrap_or_else(|| json!([]));
        }
        None => {
            doc["llm_error"] = meta.error.map(Value::String).unwrap_or(Value::Null);
        }
    }
}

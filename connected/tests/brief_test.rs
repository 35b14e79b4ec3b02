use chrono::Utc;
use common::{BriefConfig, Config, DatabaseConfig, HttpConfig, NewsConfig};
use connected::brief::{run_daily_brief, Edition};
use connected::cards::{Card, SourceRef};
use connected::storage::{self, FeedCardRecord};
use serde_json::json;
use sqlx::SqlitePool;

async fn setup_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("brief_test.db");
    let pool = common::init_db_pool(path.to_str().expect("utf8 path"))
        .await
        .expect("init pool");
    storage::ensure_schema(&pool).await.expect("ensure schema");
    (pool, dir)
}

fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            path: "unused".to_string(),
        },
        http: HttpConfig::default(),
        news: NewsConfig::default(),
        brief: BriefConfig {
            topics: vec!["tech".to_string()],
            lookback_hours: 24,
            items_per_topic: 5,
            max_topics: None,
            max_tokens: 450,
        },
        llm: None,
        admin: None,
    }
}

async fn seed_card(pool: &SqlitePool, category: &str, title: &str, url: &str) -> i64 {
    let now = Utc::now();
    let key = connected::normalize::normalize_story_key(title);
    let cluster_id = storage::insert_active_cluster(pool, category, title, &key, now)
        .await
        .expect("insert cluster");

    let card = Card {
        category: category.to_string(),
        title: title.to_string(),
        what_happened: format!("{} happened.", title),
        why_it_matters: vec!["it matters".to_string()],
        talk_track: format!("Here's a quick update: {}", title),
        smart_question: "What next?".to_string(),
        sources: vec![SourceRef {
            url: url.to_string(),
        }],
    };
    let record = FeedCardRecord::new(
        cluster_id,
        category.to_string(),
        card,
        json!({"ok": true, "mode": "fallback"}),
        None,
        "v0-fallback".to_string(),
        now,
    )
    .expect("card record");
    storage::upsert_feed_card(pool, &record).await.expect("upsert card");
    cluster_id
}

#[tokio::test]
async fn brief_selects_recent_cards_for_configured_topics() {
    let (pool, _dir) = setup_pool().await;
    seed_card(&pool, "tech", "Apple releases new product", "https://example.com/a").await;
    seed_card(&pool, "tech", "Chip production expands", "https://example.com/b").await;
    // Different category must not be selected for the "tech" topic.
    seed_card(&pool, "sports", "Cup final tonight", "https://example.com/c").await;

    let stats = run_daily_brief(&pool, &test_config(), None, "global", Edition::Morning, false)
        .await
        .expect("brief run");

    assert_eq!(stats.items_selected, 2);
    assert!(stats.stored);
    assert!(!stats.skipped_existing);

    let row = storage::get_brief_day(&pool, &stats.brief_date, "global")
        .await
        .expect("read brief")
        .expect("brief row");
    assert_eq!(row.latest_edition.as_deref(), Some("morning"));

    let editions = row.editions_value();
    let doc = &editions["morning"];
    assert_eq!(doc["edition"], "morning");
    assert_eq!(doc["topics"].as_array().expect("topics").len(), 1);
    let section = &doc["topics"][0];
    assert_eq!(section["topic"], "tech");
    // No provider configured: sections carry items but no prose overview.
    assert_eq!(section["mode"], "no_llm");
    assert_eq!(section["items"].as_array().expect("items").len(), 2);
    assert!(doc["overview"].is_null());
}

#[tokio::test]
async fn existing_edition_is_not_regenerated_unless_forced() {
    let (pool, _dir) = setup_pool().await;
    seed_card(&pool, "tech", "Apple releases new product", "https://example.com/a").await;
    let config = test_config();

    let first = run_daily_brief(&pool, &config, None, "global", Edition::Morning, false)
        .await
        .expect("run 1");
    assert!(!first.skipped_existing);

    let second = run_daily_brief(&pool, &config, None, "global", Edition::Morning, false)
        .await
        .expect("run 2");
    assert!(second.skipped_existing);
    assert_eq!(second.items_selected, first.items_selected);

    let forced = run_daily_brief(&pool, &config, None, "global", Edition::Morning, true)
        .await
        .expect("forced run");
    assert!(!forced.skipped_existing);
}

#[tokio::test]
async fn editions_are_independent_within_one_day() {
    let (pool, _dir) = setup_pool().await;
    seed_card(&pool, "tech", "Apple releases new product", "https://example.com/a").await;
    let config = test_config();

    run_daily_brief(&pool, &config, None, "global", Edition::Morning, false)
        .await
        .expect("morning");
    let evening = run_daily_brief(&pool, &config, None, "global", Edition::Evening, false)
        .await
        .expect("evening");
    assert!(!evening.skipped_existing);

    let row = storage::get_brief_day(&pool, &evening.brief_date, "global")
        .await
        .expect("read brief")
        .expect("brief row");
    let editions = row.editions_value();
    assert!(editions["morning"].is_object());
    assert!(editions["evening"].is_object());
    assert!(editions["midday"].is_null());
    assert_eq!(row.latest_edition.as_deref(), Some("evening"));
}

#[tokio::test]
async fn audiences_get_separate_containers() {
    let (pool, _dir) = setup_pool().await;
    seed_card(&pool, "tech", "Apple releases new product", "https://example.com/a").await;
    let config = test_config();

    run_daily_brief(&pool, &config, None, "global", Edition::Morning, false)
        .await
        .expect("global brief");
    let team = run_daily_brief(&pool, &config, None, "team", Edition::Morning, false)
        .await
        .expect("team brief");
    assert!(!team.skipped_existing);

    let global_row = storage::get_brief_day(&pool, &team.brief_date, "global")
        .await
        .expect("read")
        .expect("row");
    let team_row = storage::get_brief_day(&pool, &team.brief_date, "team")
        .await
        .expect("read")
        .expect("row");
    assert_eq!(global_row.audience, "global");
    assert_eq!(team_row.audience, "team");
}

use chrono::{DateTime, Utc};
use common::{BriefConfig, Config, DatabaseConfig, HttpConfig, NewsConfig};
use connected::pipeline::run_news_pipeline;
use connected::storage;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

const FEED_BODY: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Tech Wire</title>
    <item>
      <title>Apple releases new product</title>
      <link>https://example.com/apple-product</link>
      <description>The company unveiled a device. Analysts expect strong demand.</description>
      <pubDate>Tue, 02 Jan 2024 08:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

async fn setup_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipeline_test.db");
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
        brief: BriefConfig::default(),
        llm: None,
        admin: None,
    }
}

async fn seed_source(pool: &SqlitePool, name: &str, url: &str, category: &str) {
    storage::seed_sources(
        pool,
        &[storage::SourceSeed {
            name: name.to_string(),
            source_type: "rss".to_string(),
            url: url.to_string(),
            category: category.to_string(),
            enabled: true,
        }],
    )
    .await
    .expect("seed source");
}

#[tokio::test]
async fn no_provider_scenario_produces_fallback_card() {
    let (pool, _dir) = setup_pool().await;
    let mut server = mockito::Server::new_async().await;
    let feed_mock = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(FEED_BODY)
        .create_async()
        .await;

    seed_source(&pool, "Tech Wire", &format!("{}/feed.xml", server.url()), "tech").await;

    let stats = run_news_pipeline(&pool, &test_config(), None)
        .await
        .expect("pipeline run");

    assert_eq!(stats.sources, 1);
    assert_eq!(stats.articles_fetched, 1);
    assert_eq!(stats.articles_upserted, 1);
    assert_eq!(stats.clusters_touched, 1);
    assert_eq!(stats.cards_published, 1);

    let active_clusters: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM news_story_clusters WHERE status = 'active'",
    )
    .fetch_one(&pool)
    .await
    .expect("count clusters");
    assert_eq!(active_clusters, 1);

    let card_row = sqlx::query("SELECT card, prompt_version FROM news_feed_cards")
        .fetch_one(&pool)
        .await
        .expect("card row");
    let card: Value =
        serde_json::from_str(&card_row.get::<String, _>("card")).expect("card json");

    assert!(card["talk_track"]
        .as_str()
        .expect("talk_track")
        .starts_with("Here's a quick update:"));
    assert_eq!(
        card["sources"],
        serde_json::json!([{"url": "https://example.com/apple-product"}])
    );
    assert_eq!(card["what_happened"], "The company unveiled a device");
    assert_eq!(card_row.get::<String, _>("prompt_version"), "v0-fallback");

    feed_mock.assert_async().await;
}

#[tokio::test]
async fn same_key_entries_share_one_cluster() {
    let (pool, _dir) = setup_pool().await;
    let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Wire</title>
<item><title>Big merger announced</title><link>https://example.com/a</link>
  <pubDate>Tue, 02 Jan 2024 10:00:00 GMT</pubDate></item>
<item><title>Big merger announced</title><link>https://example.com/b</link>
  <pubDate>Tue, 02 Jan 2024 09:00:00 GMT</pubDate></item>
<item><title>Big merger announced</title><link>https://example.com/c</link>
  <pubDate>Tue, 02 Jan 2024 08:00:00 GMT</pubDate></item>
</channel></rss>"#;

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    seed_source(&pool, "Wire", &format!("{}/feed.xml", server.url()), "finance").await;

    let stats = run_news_pipeline(&pool, &test_config(), None)
        .await
        .expect("pipeline run");

    assert_eq!(stats.articles_fetched, 3);
    assert_eq!(stats.articles_upserted, 3);
    assert_eq!(stats.clusters_touched, 1);
    // Entries after the first hit the publish gate inside the same run.
    assert_eq!(stats.cards_published, 1);

    let clusters = sqlx::query("SELECT id FROM news_story_clusters WHERE status = 'active'")
        .fetch_all(&pool)
        .await
        .expect("clusters");
    assert_eq!(clusters.len(), 1);
    let cluster_id: i64 = clusters[0].get("id");

    let linked = storage::cluster_article_count(&pool, cluster_id)
        .await
        .expect("link count");
    assert_eq!(linked, 3);
}

#[tokio::test]
async fn rerun_within_cooldown_publishes_nothing_new() {
    let (pool, _dir) = setup_pool().await;
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(FEED_BODY)
        .expect(2)
        .create_async()
        .await;

    seed_source(&pool, "Tech Wire", &format!("{}/feed.xml", server.url()), "tech").await;

    let config = test_config();
    let first = run_news_pipeline(&pool, &config, None).await.expect("run 1");
    assert_eq!(first.cards_published, 1);
    assert_eq!(first.articles_upserted, 1);

    let updated_at_before: DateTime<Utc> =
        sqlx::query_scalar("SELECT updated_at FROM news_feed_cards")
            .fetch_one(&pool)
            .await
            .expect("updated_at");

    let second = run_news_pipeline(&pool, &config, None).await.expect("run 2");
    assert_eq!(second.cards_published, 0);
    assert_eq!(second.clusters_touched, 1);
    assert_eq!(second.articles_upserted, 1);

    // Exactly one card write happened across both runs.
    let updated_at_after: DateTime<Utc> =
        sqlx::query_scalar("SELECT updated_at FROM news_feed_cards")
            .fetch_one(&pool)
            .await
            .expect("updated_at");
    assert_eq!(updated_at_before, updated_at_after);

    let card_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_feed_cards")
        .fetch_one(&pool)
        .await
        .expect("card count");
    assert_eq!(card_count, 1);
}

#[tokio::test]
async fn failing_source_is_skipped_without_aborting_the_run() {
    let (pool, _dir) = setup_pool().await;
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/bad.xml")
        .with_status(503)
        .create_async()
        .await;
    server
        .mock("GET", "/good.xml")
        .with_status(200)
        .with_body(FEED_BODY)
        .create_async()
        .await;

    seed_source(&pool, "Bad Wire", &format!("{}/bad.xml", server.url()), "tech").await;
    seed_source(&pool, "Tech Wire", &format!("{}/good.xml", server.url()), "tech").await;

    let stats = run_news_pipeline(&pool, &test_config(), None)
        .await
        .expect("pipeline run");

    assert_eq!(stats.sources, 2);
    assert_eq!(stats.articles_upserted, 1);
    assert_eq!(stats.cards_published, 1);
}

#[tokio::test]
async fn duplicate_links_within_a_batch_are_processed_once() {
    let (pool, _dir) = setup_pool().await;
    let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Wire</title>
<item><title>Story one</title><link>https://example.com/dup</link></item>
<item><title>Story one repeated</title><link>https://example.com/dup</link></item>
</channel></rss>"#;

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    seed_source(&pool, "Wire", &format!("{}/feed.xml", server.url()), "tech").await;

    let stats = run_news_pipeline(&pool, &test_config(), None)
        .await
        .expect("pipeline run");

    assert_eq!(stats.articles_fetched, 2);
    assert_eq!(stats.articles_upserted, 1);

    let article_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_articles_raw")
        .fetch_one(&pool)
        .await
        .expect("article count");
    assert_eq!(article_count, 1);
}

#[tokio::test]
async fn per_source_cap_limits_entries() {
    let (pool, _dir) = setup_pool().await;
    let mut items = String::new();
    for i in 0..5 {
        items.push_str(&format!(
            "<item><title>Story number {i}</title>\
             <link>https://example.com/{i}</link>\
             <pubDate>Tue, 02 Jan 2024 0{i}:00:00 GMT</pubDate></item>"
        ));
    }
    let body = format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Wire</title>{}</channel></rss>"#,
        items
    );

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    seed_source(&pool, "Wire", &format!("{}/feed.xml", server.url()), "tech").await;

    let mut config = test_config();
    config.news.max_entries_per_source = 2;

    let stats = run_news_pipeline(&pool, &config, None)
        .await
        .expect("pipeline run");

    assert_eq!(stats.articles_fetched, 2);
    assert_eq!(stats.articles_upserted, 2);

    // Newest-first ordering decides which entries survive the cap.
    let urls: Vec<String> = sqlx::query_scalar("SELECT url FROM news_articles_raw ORDER BY url")
        .fetch_all(&pool)
        .await
        .expect("urls");
    assert_eq!(urls, vec!["https://example.com/3", "https://example.com/4"]);
}

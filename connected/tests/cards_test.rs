use common::ProviderConfig;
use connected::cards::{self, PROMPT_VERSION_LLM, PROMPT_VERSION_LLM_FALLBACK};
use connected::llm::openai::OpenAiProvider;
use connected::llm::Router;
use serde_json::json;

const URL: &str = "https://example.com/story";

fn router_for(url: &str, key_env: &str) -> Router {
    std::env::set_var(key_env, "fake-api-key");
    let provider = OpenAiProvider::from_config(&ProviderConfig {
        api_url: Some(url.to_string()),
        api_key_env: Some(key_env.to_string()),
        model: Some("gpt-4o-mini".to_string()),
        timeout_seconds: Some(5),
        max_tokens: None,
    })
    .expect("provider");
    Router::with_providers(vec![Box::new(provider)])
}

fn chat_body(content: &str) -> String {
    json!({
        "model": "gpt-4o-mini",
        "choices": [{"message": {"role": "assistant", "content": content}}],
    })
    .to_string()
}

#[tokio::test]
async fn provider_card_without_sources_gets_origin_injected() {
    let mut server = mockito::Server::new_async().await;
    let card_json = json!({
        "category": "tech",
        "title": "Apple releases new product",
        "what_happened": "Apple shipped a new device.",
        "why_it_matters": ["New market segment", "Competitive pressure"],
        "talk_track": "Apple just shipped something new.",
        "smart_question": "Who is this for?",
        "sources": [],
    });
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(chat_body(&card_json.to_string()))
        .create_async()
        .await;

    let router = router_for(&server.url(), "CARDS_TEST_KEY_A");
    let out = cards::synthesize_card(
        Some(&router),
        "tech",
        "Apple releases new product",
        URL,
        Some("Apple shipped a new device."),
    )
    .await;

    assert_eq!(out.prompt_version, PROMPT_VERSION_LLM);
    assert_eq!(out.card.sources.len(), 1);
    assert_eq!(out.card.sources[0].url, URL);
    assert_eq!(out.qa["ok"], true);
    assert_eq!(out.qa["mode"], "llm");
    assert_eq!(out.card.what_happened, "Apple shipped a new device.");
}

#[tokio::test]
async fn invalid_candidate_is_replaced_by_fallback() {
    let mut server = mockito::Server::new_async().await;
    // why_it_matters is the wrong type: the candidate must be discarded.
    let card_json = json!({
        "category": "tech",
        "title": "Apple releases new product",
        "what_happened": "Apple shipped a new device.",
        "why_it_matters": "not a list",
        "talk_track": "Apple just shipped something new.",
        "smart_question": "Who is this for?",
        "sources": [{"url": URL}],
    });
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(chat_body(&card_json.to_string()))
        .create_async()
        .await;

    let router = router_for(&server.url(), "CARDS_TEST_KEY_B");
    let out = cards::synthesize_card(
        Some(&router),
        "tech",
        "Apple releases new product",
        URL,
        Some("The device shipped today. Analysts are split."),
    )
    .await;

    assert_eq!(out.prompt_version, PROMPT_VERSION_LLM_FALLBACK);
    assert_eq!(out.qa["mode"], "qa");
    let issues = out.qa["issues"].as_array().expect("issues");
    assert!(issues.contains(&json!("why_it_matters:not_list")));
    // The substituted fallback card is still fully valid.
    assert_eq!(out.card.sources[0].url, URL);
    assert_eq!(out.card.what_happened, "The device shipped today");
}

#[tokio::test]
async fn exhausted_ladder_falls_back_deterministically() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(chat_body("I will not answer in JSON."))
        .create_async()
        .await;

    let router = router_for(&server.url(), "CARDS_TEST_KEY_C");
    let out = cards::synthesize_card(
        Some(&router),
        "tech",
        "Apple releases new product",
        URL,
        None,
    )
    .await;

    assert_eq!(out.prompt_version, PROMPT_VERSION_LLM_FALLBACK);
    assert_eq!(out.qa["ok"], false);
    assert_eq!(out.qa["mode"], "llm");
    assert!(out.qa["tried"].as_array().map(|t| !t.is_empty()).unwrap_or(false));
    assert_eq!(out.card.sources[0].url, URL);
    assert!(out.card.talk_track.starts_with("Here's a quick update:"));
}

#[tokio::test]
async fn no_router_goes_straight_to_fallback() {
    let out = cards::synthesize_card(
        None,
        "tech",
        "Apple releases new product",
        URL,
        Some("The device shipped today. Analysts are split. Preorders open Friday."),
    )
    .await;

    assert_eq!(out.prompt_version, "v0-fallback");
    assert!(out.model.is_none());
    assert_eq!(out.card.what_happened, "The device shipped today");
    assert_eq!(
        out.card.why_it_matters,
        vec!["Analysts are split", "Preorders open Friday"]
    );
    assert_eq!(out.card.sources[0].url, URL);
}

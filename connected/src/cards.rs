use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::{CompletionRequest, Router};

pub const PROMPT_VERSION_FALLBACK: &str = "v0-fallback";
pub const PROMPT_VERSION_LLM: &str = "v1-llm";
pub const PROMPT_VERSION_LLM_FALLBACK: &str = "v1-llm-fallback";

const REQUIRED_KEYS: &[&str] = &[
    "category",
    "title",
    "what_happened",
    "why_it_matters",
    "talk_track",
    "smart_question",
    "sources",
];

const STRING_KEYS: &[&str] = &[
    "category",
    "title",
    "what_happened",
    "talk_track",
    "smart_question",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
}

/// The card shape served to readers. One per cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub category: String,
    pub title: String,
    pub what_happened: String,
    pub why_it_matters: Vec<String>,
    pub talk_track: String,
    pub smart_question: String,
    pub sources: Vec<SourceRef>,
}

/// A synthesized card plus the QA record describing how it was produced.
#[derive(Debug, Clone)]
pub struct SynthesizedCard {
    pub card: Card,
    pub qa: Value,
    pub model: Option<String>,
    pub prompt_version: &'static str,
}

/// Deterministic rule-based card built from title/summary alone. Always
/// structurally valid; used when no provider is configured, when the ladder
/// is exhausted, and when a candidate fails validation.
pub fn fallback_card(category: &str, title: &str, url: &str, summary: Option<&str>) -> Card {
    let cleaned = summary.map(strip_html).unwrap_or_default();
    let sentences = split_sentences(&cleaned);

    let what_happened = sentences
        .first()
        .cloned()
        .unwrap_or_else(|| title.to_string());
    let why_it_matters: Vec<String> = sentences.iter().skip(1).take(2).cloned().collect();

    Card {
        category: category.to_string(),
        title: title.to_string(),
        what_happened,
        why_it_matters,
        talk_track: format!("Here's a quick update: {}", title),
        smart_question: "How do you think this affects the market / industry?".to_string(),
        sources: vec![SourceRef {
            url: url.to_string(),
        }],
    }
}

/// Validate a candidate card's shape. Returns the violated rules; empty
/// means valid. Runs on whatever the provider returned, independent of how
/// the ladder fared.
pub fn validate_card(card: &Value, url: &str) -> Vec<String> {
    let mut issues = Vec::new();

    let Some(obj) = card.as_object() else {
        return vec!["card:not_object".to_string()];
    };

    for key in REQUIRED_KEYS {
        if !obj.contains_key(*key) {
            issues.push(format!("missing:{}", key));
        }
    }

    if let Some(v) = obj.get("why_it_matters") {
        if !v.is_array() {
            issues.push("why_it_matters:not_list".to_string());
        }
    }

    match obj.get("sources").and_then(|s| s.as_array()) {
        Some(sources) if !sources.is_empty() => {
            let has_url = sources
                .iter()
                .filter_map(|s| s.get("url"))
                .filter_map(|u| u.as_str())
                .any(|u| u == url);
            if !has_url {
                issues.push("sources:missing_url".to_string());
            }
        }
        _ => {
            if obj.contains_key("sources") {
                issues.push("sources:empty".to_string());
            }
        }
    }

    for key in STRING_KEYS {
        if let Some(v) = obj.get(*key) {
            if !v.is_null() && !v.is_string() {
                issues.push(format!("{}:not_string", key));
            }
        }
    }

    issues
}

/// Normalize provider-returned sources to `{url}` objects and make sure the
/// originating article URL is present, appending it when missing.
pub fn normalize_sources(card: &mut Value, url: &str) {
    let Some(obj) = card.as_object_mut() else {
        return;
    };

    let mut sources: Vec<Value> = obj
        .get("sources")
        .and_then(|s| s.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(s) => Some(json!({ "url": s })),
                    Value::Object(o) => o
                        .get("url")
                        .and_then(|u| u.as_str())
                        .map(|u| json!({ "url": u })),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let has_url = sources
        .iter()
        .any(|s| s.get("url").and_then(|u| u.as_str()) == Some(url));
    if !has_url {
        sources.push(json!({ "url": url }));
    }

    obj.insert("sources".to_string(), Value::Array(sources));
}

/// Build a candidate card via the provider router, or the deterministic
/// fallback when no provider is configured. Validation failures always
/// degrade to the fallback card; this never errors.
pub async fn synthesize_card(
    router: Option<&Router>,
    category: &str,
    title: &str,
    url: &str,
    summary: Option<&str>,
) -> SynthesizedCard {
    let Some(router) = router else {
        return SynthesizedCard {
            card: fallback_card(category, title, url, summary),
            qa: json!({"ok": true, "mode": "fallback"}),
            model: None,
            prompt_version: PROMPT_VERSION_FALLBACK,
        };
    };

    let system = "You are a news brief assistant for young professionals and networkers. \
                  Create a compact, credible card. Never invent facts. \
                  Do not include numbers unless explicitly present in the provided summary/title. \
                  Always keep it short.";
    let user = json!({
        "category": category,
        "title": title,
        "url": url,
        "summary": summary,
        "required_json": {
            "category": "string",
            "title": "string",
            "what_happened": "string (1 sentence)",
            "why_it_matters": "array of 2 short bullets max",
            "talk_track": "string (1 sentence user can say)",
            "smart_question": "string (1 question)",
            "sources": "array of {url} (must include the provided url)"
        },
    });
    let request = CompletionRequest {
        purpose: "news_card".to_string(),
        system: system.to_string(),
        user,
        temperature: 0.2,
        max_tokens: 500,
    };

    let (value, meta) = router.complete_json(&request).await;
    let tried = serde_json::to_value(&meta.tried).unwrap_or(Value::Null);

    let Some(mut candidate) = value else {
        return SynthesizedCard {
            card: fallback_card(category, title, url, summary),
            qa: json!({"ok": false, "mode": "llm", "error": meta.error, "tried": tried}),
            model: None,
            prompt_version: PROMPT_VERSION_LLM_FALLBACK,
        };
    };

    normalize_sources(&mut candidate, url);
    // Null title/category pass validation; backfill from the entry so the
    // typed record still deserializes.
    for (key, value) in [("title", title), ("category", category)] {
        if candidate.get(key).map(|v| v.is_null()).unwrap_or(false) {
            candidate[key] = Value::String(value.to_string());
        }
    }
    let issues = validate_card(&candidate, url);
    if !issues.is_empty() {
        let upstream = json!({
            "ok": meta.ok,
            "mode": "llm",
            "provider": meta.provider,
            "tried": tried,
        });
        return SynthesizedCard {
            card: fallback_card(category, title, url, summary),
            qa: json!({"ok": false, "mode": "qa", "issues": issues, "upstream": upstream}),
            model: meta.model,
            prompt_version: PROMPT_VERSION_LLM_FALLBACK,
        };
    }

    let mut card: Card = match serde_json::from_value(candidate) {
        Ok(card) => card,
        Err(e) => {
            // Shape passed the explicit checks but still does not deserialize
            // (e.g. non-string bullet entries); same recovery path.
            return SynthesizedCard {
                card: fallback_card(category, title, url, summary),
                qa: json!({
                    "ok": false,
                    "mode": "qa",
                    "issues": [format!("deserialize:{}", e)],
                    "tried": tried,
                }),
                model: meta.model,
                prompt_version: PROMPT_VERSION_LLM_FALLBACK,
            };
        }
    };

    if card.title.is_empty() {
        card.title = title.to_string();
    }
    if card.category.is_empty() {
        card.category = category.to_string();
    }

    SynthesizedCard {
        card,
        qa: json!({"ok": true, "mode": "llm", "provider": meta.provider, "tried": tried}),
        model: meta.model,
        prompt_version: PROMPT_VERSION_LLM,
    }
}

/// Strip HTML tags and decode the entities feeds commonly carry.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }

    let out = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

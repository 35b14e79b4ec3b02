use serde_json::Value;

pub mod anthropic;
pub mod openai;
pub mod router;

pub use router::{Router, RouterMeta, TriedProvider};

/// One structured-completion request: a system instruction plus a JSON user
/// context, expecting a single JSON object back.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// What the call is for ("news_card", "topic_brief", "brief_overview").
    pub purpose: String,
    pub system: String,
    pub user: Value,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Outcome of a single provider attempt. A retryable failure lets the router
/// advance to the next provider in the ladder; a fatal one stops it.
#[derive(Debug)]
pub enum Attempt {
    Success { value: Value, model: String },
    Retryable { reason: String },
    Fatal { reason: String },
}

/// A completion provider able to produce a JSON object from an instruction.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn model(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Attempt;
}

/// Two-stage JSON extraction: strict parse of the whole response first, then
/// the first balanced `{...}` substring. Anything that is not a JSON object
/// yields `None`.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    let candidate = first_balanced_object(trimmed)?;
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(|v| v.is_object())
}

/// Scan for the first balanced brace pair, string- and escape-aware.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

use sha2::{Digest, Sha256};

/// Stopwords dropped from the slug before hashing.
const STOPWORDS: &[&str] = &["the", "a", "an"];

/// Derive the clustering key for a story title.
///
/// The key is a lowercase slug (alphanumeric runs joined by `-`, stopwords
/// removed, capped at 80 chars) suffixed with the first 16 hex chars of the
/// SHA-256 digest of the full slug. Same input text always yields the same
/// key; this exact-match key is the sole dedup mechanism, so near-duplicate
/// stories with materially different titles are not merged.
pub fn normalize_story_key(text: &str) -> String {
    let slug = slugify(text);
    let slug = if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    };

    let mut hasher = Sha256::new();
    hasher.update(slug.as_bytes());
    let digest = hex_prefix(&hasher.finalize(), 16);

    let head: String = slug.chars().take(80).collect();
    format!("{}-{}", head, digest)
}

/// Build the normalizer input: the title, optionally followed by the first
/// sentence of the cleaned summary for extra disambiguation signal.
pub fn key_text(title: &str, summary_first_sentence: Option<&str>) -> String {
    match summary_first_sentence {
        Some(s) if !s.trim().is_empty() => format!("{} {}", title, s.trim()),
        _ => title.to_string(),
    }
}

/// Lowercase slug: alphanumeric runs joined by `-`, stopwords removed.
fn slugify(text: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch.to_ascii_lowercase());
        } else if ch.is_alphanumeric() {
            // Non-ASCII letters/digits are kept lowercased; feeds are mostly
            // ASCII but titles in other scripts must still produce a key.
            for lc in ch.to_lowercase() {
                current.push(lc);
            }
        } else if !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts.retain(|p| !STOPWORDS.contains(&p.as_str()));
    parts.join("-")
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = normalize_story_key("The Market Rally Continues");
        let b = normalize_story_key("The Market Rally Continues");
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_title() {
        let a = normalize_story_key("Apple releases new product");
        let b = normalize_story_key("Microsoft releases new product");
        assert_ne!(a, b);
    }

    #[test]
    fn stopwords_are_stripped() {
        let a = normalize_story_key("The Apple releases a new product");
        let b = normalize_story_key("Apple releases new product");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_title_falls_back_to_untitled() {
        let key = normalize_story_key("");
        assert!(key.starts_with("untitled-"));
        // slug + '-' + 16 hex chars
        assert_eq!(key.len(), "untitled".len() + 1 + 16);
    }

    #[test]
    fn long_slug_is_truncated_to_80_chars() {
        let title = "word ".repeat(40);
        let key = normalize_story_key(&title);
        let (head, digest) = key.rsplit_once('-').expect("hash suffix");
        assert!(head.chars().count() <= 80);
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_text_appends_summary_sentence() {
        assert_eq!(key_text("Title", None), "Title");
        assert_eq!(key_text("Title", Some("")), "Title");
        assert_eq!(
            key_text("Title", Some("First sentence")),
            "Title First sentence"
        );
    }
}

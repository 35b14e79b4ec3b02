use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

/// Uniform feed entry produced by either parsing strategy.
#[derive(Debug, Clone, Default)]
pub struct FeedEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// Parse a feed body into a uniform entry sequence.
///
/// Primary strategy is feed-rs; if it rejects the document a hand-rolled
/// RSS 2.0 / Atom parser takes over. Entries lacking both link and title are
/// discarded, and the result is ordered by publish timestamp descending with
/// unparsable dates last — that order governs which entries survive the
/// per-source and per-category caps.
pub fn parse_feed(text: &str) -> Result<ParsedFeed> {
    let mut parsed = match feed_rs::parser::parse(text.as_bytes()) {
        Ok(feed) => from_feed_rs(feed),
        Err(e) => {
            debug!(error = %e, "feed-rs rejected feed, using XML fallback parser");
            parse_feed_xml(text)?
        }
    };

    parsed
        .entries
        .retain(|e| e.link.is_some() || e.title.is_some());
    parsed.entries.sort_by(|a, b| {
        let ka = a.published.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let kb = b.published.unwrap_or(DateTime::<Utc>::MIN_UTC);
        kb.cmp(&ka)
    });

    Ok(parsed)
}

fn from_feed_rs(feed: feed_rs::model::Feed) -> ParsedFeed {
    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref() == Some("alternate"))
                .or_else(|| entry.links.first())
                .map(|l| l.href.clone());
            FeedEntry {
                title: entry.title.map(|t| t.content),
                link,
                summary: entry.summary.map(|s| s.content),
                published: entry.published.or(entry.updated),
            }
        })
        .collect();

    ParsedFeed {
        title: feed.title.map(|t| t.content),
        entries,
    }
}

/// Fallback parser: generic XML traversal handling RSS 2.0 (`channel/item`)
/// and Atom (`feed/entry`), with namespace prefixes stripped from tag names.
fn parse_feed_xml(text: &str) -> Result<ParsedFeed> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut parsed = ParsedFeed::default();
    let mut stack: Vec<String> = Vec::new();
    let mut entry: Option<FeedEntry> = None;
    // Atom alternate links win over plain links within one entry.
    let mut link_is_alternate = false;
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .context("XML fallback parse error")?
        {
            Event::Start(e) => {
                let local = local_name(e.name().as_ref());
                if local == "item" || local == "entry" {
                    entry = Some(FeedEntry::default());
                    link_is_alternate = false;
                } else if local == "link" {
                    if let Some(current) = entry.as_mut() {
                        apply_link_attrs(&e, current, &mut link_is_alternate);
                    }
                }
                stack.push(local);
            }
            Event::Empty(e) => {
                let local = local_name(e.name().as_ref());
                if local == "link" {
                    if let Some(current) = entry.as_mut() {
                        apply_link_attrs(&e, current, &mut link_is_alternate);
                    }
                }
            }
            Event::Text(t) => {
                let text = t.unescape().unwrap_or_default().to_string();
                handle_text(&stack, entry.as_mut(), &mut parsed, text);
            }
            Event::CData(c) => {
                let bytes = c.into_inner();
                let text = String::from_utf8_lossy(&bytes).to_string();
                handle_text(&stack, entry.as_mut(), &mut parsed, text);
            }
            Event::End(e) => {
                let local = local_name(e.name().as_ref());
                stack.pop();
                if local == "item" || local == "entry" {
                    if let Some(done) = entry.take() {
                        parsed.entries.push(done);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if parsed.entries.is_empty() && parsed.title.is_none() {
        anyhow::bail!("no recognizable RSS/Atom structure in feed body");
    }
    Ok(parsed)
}

fn handle_text(
    stack: &[String],
    entry: Option<&mut FeedEntry>,
    parsed: &mut ParsedFeed,
    text: String,
) {
    if text.is_empty() {
        return;
    }
    let Some(element) = stack.last().map(String::as_str) else {
        return;
    };

    match entry {
        Some(current) => match element {
            "title" => current.title = Some(text),
            // RSS 2.0 carries the URL as element text.
            "link" => {
                if current.link.is_none() {
                    current.link = Some(text);
                }
            }
            "description" | "summary" => current.summary = Some(text),
            "pubDate" | "published" | "updated" => {
                if current.published.is_none() {
                    current.published = parse_date(&text);
                }
            }
            _ => {}
        },
        None => {
            // Feed-level title: rss/channel/title or feed/title.
            if element == "title" && stack.len() <= 3 && parsed.title.is_none() {
                parsed.title = Some(text);
            }
        }
    }
}

fn apply_link_attrs(
    e: &quick_xml::events::BytesStart<'_>,
    entry: &mut FeedEntry,
    link_is_alternate: &mut bool,
) {
    let mut href: Option<String> = None;
    let mut rel: Option<String> = None;
    for attr in e.attributes().flatten() {
        let key = local_name(attr.key.as_ref());
        let value = attr.unescape_value().unwrap_or_default().to_string();
        match key.as_str() {
            "href" => href = Some(value),
            "rel" => rel = Some(value),
            _ => {}
        }
    }

    let Some(href) = href else { return };
    let alternate = rel.as_deref().map(|r| r == "alternate").unwrap_or(true);
    if entry.link.is_none() || (alternate && !*link_is_alternate) {
        entry.link = Some(href);
        *link_is_alternate = alternate;
    }
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    match name.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => name.to_string(),
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

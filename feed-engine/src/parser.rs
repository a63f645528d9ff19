use crate::types::{EngineError, ParsedEntry, ParsedFeed, Result};
use chrono::Utc;
use feed_rs::parser;
use tracing::debug;

/// RSS/Atom decoding on top of `feed-rs`. Stateless: duplicate handling is
/// the deduplicator's job, not the parser's.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_feed(&self, content: &str) -> Result<ParsedFeed> {
        debug!(bytes = content.len(), "parsing feed content");

        // Entries without a guid/id keep an empty id; the normalizer picks
        // the stable fallback.
        let feed = parser::Builder::new()
            .id_generator(|_links, _title, _uri| String::new())
            .build()
            .parse(content.as_bytes())
            .map_err(|e| EngineError::Parse(format!("Failed to parse feed: {}", e)))?;

        let title = feed.title.map(|t| t.content);
        let description = feed.description.map(|d| d.content);
        let entries: Vec<ParsedEntry> = feed.entries.into_iter().map(Self::parse_entry).collect();

        debug!(entries = entries.len(), "parsed feed");
        Ok(ParsedFeed {
            title,
            description,
            entries,
        })
    }

    fn parse_entry(entry: feed_rs::model::Entry) -> ParsedEntry {
        let guid = Some(entry.id).filter(|id| !id.trim().is_empty());
        let link = entry.links.first().map(|l| l.href.clone());
        let title = entry.title.map(|t| t.content);
        let description = entry.summary.map(|s| s.content);
        let content = entry.content.and_then(|c| c.body);
        let author = entry.authors.first().map(|a| a.name.clone());
        let published_at = entry.published.map(|dt| dt.with_timezone(&Utc));
        let updated_at = entry.updated.map(|dt| dt.with_timezone(&Utc));
        let tags = entry.categories.into_iter().map(|c| c.term).collect();

        ParsedEntry {
            guid,
            link,
            title,
            description,
            content,
            author,
            published_at,
            updated_at,
            tags,
        }
    }
}

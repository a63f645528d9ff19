use crate::feed_utils::time::parse_instant;
use crate::path;
use crate::types::{FeedSubscription, Item, ParsedEntry, ParsedFeed, RawPayload, ResponseParser};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Keys tried, in order, when an object body has no configured items path.
const FALLBACK_ITEM_KEYS: &[&str] = &["items", "data", "results"];

/// Maps fetched payloads onto canonical items, preserving fetch order.
pub fn normalize(payload: &RawPayload, subscription: &FeedSubscription) -> Vec<Item> {
    match payload {
        RawPayload::Feed(feed) => normalize_feed(feed),
        RawPayload::Json(body) => {
            let parser = subscription
                .api_config
                .as_ref()
                .map(|c| c.response_parser.clone())
                .unwrap_or_default();
            normalize_json(body, &parser, subscription.id)
        }
    }
}

pub fn normalize_feed(feed: &ParsedFeed) -> Vec<Item> {
    feed.entries.iter().map(entry_to_item).collect()
}

fn entry_to_item(entry: &ParsedEntry) -> Item {
    let title = entry.title.clone().unwrap_or_default();
    let link = entry.link.clone().unwrap_or_default();
    let body = entry
        .description
        .clone()
        .or_else(|| entry.content.clone())
        .unwrap_or_default();
    let timestamp = entry.published_at.or(entry.updated_at);

    let id = entry
        .guid
        .clone()
        .or_else(|| Some(link.clone()).filter(|l| !l.is_empty()))
        .unwrap_or_else(|| digest_id(title.as_bytes()));

    let raw = json!({
        "id": id,
        "guid": entry.guid,
        "title": entry.title,
        "link": entry.link,
        "description": entry.description,
        "content": entry.content,
        "author": entry.author,
        "published": entry.published_at.map(|t| t.to_rfc3339()),
        "updated": entry.updated_at.map(|t| t.to_rfc3339()),
        "tags": entry.tags,
    });

    Item {
        id,
        title,
        body,
        link,
        timestamp,
        raw,
    }
}

/// Applies the response-parser mapping to a JSON API body.
pub fn normalize_json(body: &Value, parser: &ResponseParser, subscription_id: i64) -> Vec<Item> {
    let Some(entries) = locate_items(body, &parser.items_path) else {
        warn!(
            subscription_id,
            items_path = %parser.items_path,
            "items path did not resolve to a list, no items this pass"
        );
        return Vec::new();
    };

    let mut items = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let raw = match entry {
            Value::Object(_) => entry.clone(),
            Value::String(s) => json!({ "title": s, "description": s }),
            other => {
                warn!(
                    subscription_id,
                    index,
                    kind = json_kind(other),
                    "skipping API item that is not an object"
                );
                continue;
            }
        };
        items.push(json_to_item(raw, parser));
    }

    debug!(subscription_id, items = items.len(), "normalized API payload");
    items
}

fn locate_items<'a>(body: &'a Value, items_path: &str) -> Option<Vec<&'a Value>> {
    let node = if items_path.trim().is_empty() {
        match body {
            Value::Object(map) => FALLBACK_ITEM_KEYS
                .iter()
                .find_map(|key| map.get(*key).filter(|v| v.is_array()))
                .unwrap_or(body),
            _ => body,
        }
    } else {
        path::resolve(body, items_path)?
    };

    match node {
        Value::Array(list) => Some(list.iter().collect()),
        Value::Object(_) => Some(vec![node]),
        _ => None,
    }
}

fn json_to_item(raw: Value, parser: &ResponseParser) -> Item {
    let text_at = |field: &str| -> String {
        path::resolve(&raw, field)
            .map(path::value_text)
            .unwrap_or_default()
    };

    let title = text_at(&parser.title_field);
    let body = text_at(&parser.description_field);
    let link = text_at(&parser.link_field);
    let timestamp = path::resolve(&raw, &parser.timestamp_field).and_then(parse_instant);
    let id = Some(text_at(&parser.id_field))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| digest_id(raw.to_string().as_bytes()));

    Item {
        id,
        title,
        body,
        link,
        timestamp,
        raw,
    }
}

/// Stable id for entries that carry none of their own.
fn digest_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{:x}", digest)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn parser(items_path: &str) -> ResponseParser {
        ResponseParser {
            items_path: items_path.to_string(),
            id_field: "AlertID".to_string(),
            title_field: "EventCategory".to_string(),
            description_field: "HeadlineDescription".to_string(),
            timestamp_field: "LastUpdatedTime".to_string(),
            link_field: "Url".to_string(),
        }
    }

    #[test]
    fn maps_response_parser_fields_and_keeps_raw() {
        let body = json!({
            "payload": {"alerts": [
                {
                    "AlertID": 501,
                    "EventCategory": "Collision",
                    "HeadlineDescription": "Two lanes blocked",
                    "LastUpdatedTime": "/Date(1690000000000-0700)/",
                    "StartRoadwayLocation": {"RoadName": "I-5"}
                }
            ]}
        });
        let items = normalize_json(&body, &parser("payload.alerts"), 1);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.id, "501");
        assert_eq!(item.title, "Collision");
        assert_eq!(item.body, "Two lanes blocked");
        assert_eq!(item.link, "");
        assert_eq!(
            item.timestamp,
            Utc.timestamp_millis_opt(1_690_000_000_000).single()
        );
        assert_eq!(item.field_text("raw.StartRoadwayLocation.RoadName"), "I-5");
    }

    #[test]
    fn empty_items_path_uses_top_level_array() {
        let body = json!([{"AlertID": "a"}, {"AlertID": "b"}]);
        let ids: Vec<String> = normalize_json(&body, &parser(""), 1)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn object_body_falls_back_to_common_keys_then_itself() {
        let defaults = ResponseParser::default();
        let body = json!({"data": [{"id": 1, "title": "one"}]});
        assert_eq!(normalize_json(&body, &defaults, 1)[0].title, "one");

        let single = json!({"id": 7, "title": "solo"});
        let items = normalize_json(&single, &defaults, 1);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "7");
    }

    #[test]
    fn odd_items_are_skipped_and_strings_promoted() {
        let body = json!(["plain headline", 12, null, {"id": "x"}]);
        let items = normalize_json(&body, &ResponseParser::default(), 1);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "plain headline");
        assert_eq!(items[0].body, "plain headline");
        assert!(items[0].id.starts_with("sha256:"));
        assert_eq!(items[1].id, "x");
    }

    #[test]
    fn unresolvable_items_path_yields_nothing() {
        let body = json!({"payload": {}});
        assert!(normalize_json(&body, &parser("payload.alerts"), 1).is_empty());
    }

    #[test]
    fn missing_item_fields_are_empty_strings() {
        let body = json!([{"AlertID": "1"}]);
        let item = &normalize_json(&body, &parser(""), 1)[0];
        assert_eq!(item.title, "");
        assert_eq!(item.body, "");
        assert_eq!(item.timestamp, None);
    }

    #[test]
    fn rss_entries_prefer_guid_then_link() {
        let feed = ParsedFeed {
            entries: vec![
                ParsedEntry {
                    guid: Some("g-1".into()),
                    link: Some("https://e.com/1".into()),
                    title: Some("One".into()),
                    ..Default::default()
                },
                ParsedEntry {
                    link: Some("https://e.com/2".into()),
                    title: Some("Two".into()),
                    content: Some("<p>Body</p>".into()),
                    ..Default::default()
                },
                ParsedEntry {
                    title: Some("Three".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let items = normalize_feed(&feed);
        assert_eq!(items[0].id, "g-1");
        assert_eq!(items[1].id, "https://e.com/2");
        assert_eq!(items[1].body, "<p>Body</p>");
        assert!(items[2].id.starts_with("sha256:"));
        assert_eq!(items[0].field_text("raw.title"), "One");
    }

    #[test]
    fn parsed_rss_without_guid_gets_stable_ids() {
        let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Roads</title><link>https://example.com</link><description>Closures</description>
<item><title>Road closed</title><link>https://example.com/a</link></item>
<item><title>No link here</title></item>
</channel></rss>"#;
        let ids = || -> Vec<String> {
            let feed = crate::parser::FeedParser::new().parse_feed(body).unwrap();
            normalize_feed(&feed).into_iter().map(|i| i.id).collect()
        };
        let first = ids();
        assert_eq!(first[0], "https://example.com/a");
        assert!(first[1].starts_with("sha256:"));
        assert_eq!(first, ids());
    }
}

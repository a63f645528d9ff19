use crate::feed_utils::time::{parse_instant, parse_instant_str};
use crate::item::Field;
use crate::types::{Item, SortOrder, SortSpec};
use serde_json::Value;

/// Ordering key for one item. Unresolvable or unparseable values sort as the
/// earliest instant; instants sort before plain text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Earliest,
    Instant(i64),
    Text(String),
}

fn key_for(item: &Item, field: &str) -> SortKey {
    match item.lookup(field) {
        None => SortKey::Earliest,
        Some(Field::Instant(t)) => SortKey::Instant(t.timestamp_millis()),
        Some(Field::Value(value)) => match value {
            Value::String(s) => match parse_instant_str(s) {
                Some(t) => SortKey::Instant(t.timestamp_millis()),
                None if looks_like_timestamp(field) => SortKey::Earliest,
                None => SortKey::Text(s.to_lowercase()),
            },
            other => parse_instant(other)
                .map(|t| SortKey::Instant(t.timestamp_millis()))
                .unwrap_or(SortKey::Earliest),
        },
        Some(Field::Text(s)) => match parse_instant_str(s) {
            Some(t) => SortKey::Instant(t.timestamp_millis()),
            None => SortKey::Text(s.to_lowercase()),
        },
    }
}

/// Field names that only ever hold dates; garbage in them sinks instead of
/// sorting alphabetically.
fn looks_like_timestamp(field: &str) -> bool {
    let leaf = field.rsplit('.').next().unwrap_or(field).to_ascii_lowercase();
    ["time", "date", "updated", "published", "created", "timestamp"]
        .iter()
        .any(|hint| leaf.contains(hint))
}

/// Stable sort; `None` keeps fetch order.
pub fn sort(items: Vec<Item>, spec: Option<&SortSpec>) -> Vec<Item> {
    let Some(spec) = spec else {
        return items;
    };
    if spec.field.trim().is_empty() {
        return items;
    }

    let mut keyed: Vec<(SortKey, Item)> = items
        .into_iter()
        .map(|item| (key_for(&item, &spec.field), item))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| match spec.order {
        SortOrder::Asc => a.cmp(b),
        SortOrder::Desc => b.cmp(a),
    });
    keyed.into_iter().map(|(_, item)| item).collect()
}

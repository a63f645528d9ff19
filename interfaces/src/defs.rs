use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type SubscriptionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Rss,
    Api,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Rss => "rss",
            FeedKind::Api => "api",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rss" | "atom" => Ok(FeedKind::Rss),
            "api" | "json" => Ok(FeedKind::Api),
            other => Err(format!("unknown feed kind '{other}', expected 'rss' or 'api'")),
        }
    }
}

/// Where items live inside a JSON API response and which sub-fields map
/// onto the canonical item fields. All paths are dotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseParser {
    /// Empty means the body itself is the array.
    pub items_path: String,
    pub id_field: String,
    pub title_field: String,
    pub description_field: String,
    pub timestamp_field: String,
    pub link_field: String,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            items_path: String::new(),
            id_field: "id".to_string(),
            title_field: "title".to_string(),
            description_field: "description".to_string(),
            timestamp_field: "created_at".to_string(),
            link_field: "link".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    /// JSON body, only sent with POST.
    pub body: Option<Value>,
    pub response_parser: ResponseParser,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            body: None,
            response_parser: ResponseParser::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    In,
    NotIn,
    Matches,
    NotMatches,
    Contains,
    NotContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    /// Operand for equals / contains (and their negations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Operand list for in / not_in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    /// Regular expression for matches / not_matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "And")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "Or")]
    Or,
}

/// One level of conditions combined uniformly by `logic`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub kind: FeedKind,
    pub url: String,
    pub channel: String,
    pub name: Option<String>,
    pub check_interval_seconds: u64,
    pub output_format: Option<String>,
    pub send_interval_seconds: Option<f64>,
    pub filter: Option<FilterSpec>,
    pub sort: Option<SortSpec>,
    pub api_config: Option<ApiConfig>,
    pub enabled: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Newest delivered item id. Informational; dedup never reads it.
    pub last_item_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeedSubscription {
    /// Name used for emoji selection and listings, falling back to the URL.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }
}

/// A fully resolved subscription ready to be persisted; defaults have
/// already been applied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub kind: FeedKind,
    pub url: String,
    pub channel: String,
    pub name: Option<String>,
    pub check_interval_seconds: u64,
    pub output_format: Option<String>,
    pub send_interval_seconds: Option<f64>,
    pub filter: Option<FilterSpec>,
    pub sort: Option<SortSpec>,
    pub api_config: Option<ApiConfig>,
}

/// Partial update. `None` leaves a field untouched; `Some(None)` clears a
/// nullable field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(default)]
    pub check_interval_seconds: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub output_format: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub send_interval_seconds: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub filter: Option<Option<FilterSpec>>,
    #[serde(default, deserialize_with = "double_option")]
    pub sort: Option<Option<SortSpec>>,
    #[serde(default, deserialize_with = "double_option")]
    pub api_config: Option<Option<ApiConfig>>,
}

/// Keeps an explicit `null` distinguishable from an absent key.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl SubscriptionUpdate {
    pub fn is_empty(&self) -> bool {
        *self == SubscriptionUpdate::default()
    }

    pub fn apply_to(self, sub: &mut FeedSubscription, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            sub.name = name;
        }
        if let Some(interval) = self.check_interval_seconds {
            sub.check_interval_seconds = interval;
        }
        if let Some(enabled) = self.enabled {
            sub.enabled = enabled;
        }
        if let Some(format) = self.output_format {
            sub.output_format = format;
        }
        if let Some(send_interval) = self.send_interval_seconds {
            sub.send_interval_seconds = send_interval;
        }
        if let Some(filter) = self.filter {
            sub.filter = filter;
        }
        if let Some(sort) = self.sort {
            sub.sort = sort;
        }
        if let Some(api_config) = self.api_config {
            sub.api_config = api_config;
        }
        sub.updated_at = now;
    }
}

/// Result of one pipeline pass, persisted atomically with the cursor fields.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Success,
    Failure { error_type: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub subscription_id: SubscriptionId,
    pub item_id: String,
    pub item_title: String,
    pub message: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub subscription_id: SubscriptionId,
    pub error_type: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedStats {
    pub total_subscriptions: usize,
    pub enabled_subscriptions: usize,
    pub items_24h: usize,
    pub items_7d: usize,
    pub active_errors: usize,
    pub top_channels: Vec<(String, usize)>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("send to channel '{channel}' failed: {reason}")]
pub struct SendError {
    pub channel: String,
    pub reason: String,
}

/// The radio/transport layer that puts a rendered message onto a channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> Result<(), SendError>;
}

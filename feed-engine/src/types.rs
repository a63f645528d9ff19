use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// Use the interfaces crate for the data model shared with collaborators
pub use interfaces::defs::{
    ActivityRecord, ApiConfig, ChannelSender, CheckOutcome, Condition, ErrorRecord, FeedKind,
    FeedStats, FeedSubscription, FilterSpec, Logic, NewSubscription, Operator, ResponseParser,
    SendError, SortOrder, SortSpec, SubscriptionId, SubscriptionUpdate,
};
pub use interfaces::state::{FeedStore, StoreError};

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_redirects: usize,
    /// Minimum spacing between two requests to the same origin.
    pub rate_limit: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "MeshCoreBot/1.0 FeedManager".to_string(),
            timeout_seconds: 30,
            max_retries: 1,
            retry_delay_ms: 500,
            max_redirects: 5,
            rate_limit: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedEntry {
    pub guid: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

/// What the fetcher hands to the normalizer.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Feed(ParsedFeed),
    Json(Value),
}

/// One normalized entry. Lives for a single pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub body: String,
    pub link: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// The source entry as a tree, reachable through dotted paths.
    pub raw: Value,
}

/// A rendered message waiting for the channel sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub subscription_id: SubscriptionId,
    pub channel: String,
    pub item_id: String,
    pub item_title: String,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// `status` is set when the server answered with a non-2xx code.
    #[error("Fetch failed for {url}: {reason}")]
    Fetch {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Feed subscription not found: {id}")]
    SubscriptionNotFound { id: SubscriptionId },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Category persisted with the subscription's error log.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Http(_) | EngineError::Fetch { .. } | EngineError::InvalidUrl(_) => {
                "fetch"
            }
            EngineError::Parse(_) | EngineError::Serialization(_) => "parse",
            EngineError::Template(_) => "render",
            EngineError::Store(_) => "store",
            EngineError::Config(_) | EngineError::SubscriptionNotFound { .. } => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

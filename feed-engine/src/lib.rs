pub mod types;
pub mod path;
pub mod feed_utils;
pub mod item;
pub mod rate_limiter;
pub mod parser;
pub mod normalizer;
pub mod filter;
pub mod sort;
pub mod template;
pub mod dedup;
pub mod fetcher;
pub mod dispatch;
pub mod config;
pub mod engine;
pub mod scheduler;
pub mod registry;

pub use types::*;
pub use config::EngineConfig;
pub use dedup::Deduplicator;
pub use dispatch::DispatchQueue;
pub use engine::{FeedEngine, PassReport, PreviewItem};
pub use fetcher::Fetcher;
pub use parser::FeedParser;
pub use rate_limiter::RateLimiter;
pub use registry::{FeedRegistry, SubscriptionRequest, SubscriptionStatus, UnsubscribeTarget};
pub use scheduler::Scheduler;
pub use template::Template;

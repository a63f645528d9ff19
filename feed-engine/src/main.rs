use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use feed_engine::{
    ChannelSender, EngineConfig, FeedEngine, FeedKind, FeedRegistry, FilterSpec, Scheduler,
    SendError, SortSpec, SubscriptionRequest, SubscriptionUpdate, UnsubscribeTarget,
};
use interfaces::SqliteFeedStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feed-engine", about = "Polls feeds and relays new items to channels")]
struct Cli {
    /// TOML config file. Falls back to $FEED_ENGINE_CONFIG, then
    /// config/feed_engine.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Run,
    Subscribe {
        /// rss or api
        #[arg(long, default_value = "rss")]
        kind: FeedKind,
        url: String,
        channel: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        interval: Option<u64>,
        /// Output template, e.g. "{emoji} {title|truncate:60}".
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        send_interval: Option<f64>,
        /// Filter as JSON.
        #[arg(long)]
        filter: Option<String>,
        /// Sort as JSON, e.g. '{"field":"raw.updated","order":"desc"}'.
        #[arg(long)]
        sort: Option<String>,
        /// API request/response config as JSON.
        #[arg(long)]
        api_config: Option<String>,
    },
    Unsubscribe {
        id: Option<i64>,
        #[arg(long, requires = "channel", conflicts_with = "id")]
        url: Option<String>,
        #[arg(long)]
        channel: Option<String>,
    },
    List {
        channel: Option<String>,
    },
    Status {
        id: i64,
    },
    Stats,
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
    /// Apply a partial update given as JSON.
    Update {
        id: i64,
        #[arg(long)]
        json: String,
    },
    /// Fetch and render a few items without sending anything.
    Test {
        id: i64,
    },
}

/// Stands in for the radio transport: every message goes to the log.
struct LogSender;

#[async_trait]
impl ChannelSender for LogSender {
    async fn send(&self, channel: &str, text: &str) -> Result<(), SendError> {
        info!(channel, "{}", text);
        Ok(())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, raw: Option<String>) -> anyhow::Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s).with_context(|| format!("parsing --{what}")))
        .transpose()
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = EngineConfig::load(cli.config.as_deref()).context("loading config")?;
    let store = Arc::new(
        SqliteFeedStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store at {}", config.database_url))?,
    );
    let engine = Arc::new(FeedEngine::new(config, store, Arc::new(LogSender))?);
    let registry = FeedRegistry::new(engine.clone());

    match cli.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    let _ = shutdown_tx.send(true);
                }
            });
            Scheduler::new(engine).run(shutdown_rx).await?;
        }
        Command::Subscribe {
            kind,
            url,
            channel,
            name,
            interval,
            format,
            send_interval,
            filter,
            sort,
            api_config,
        } => {
            let request = SubscriptionRequest {
                kind,
                url,
                channel,
                name,
                check_interval_seconds: interval,
                output_format: format,
                send_interval_seconds: send_interval,
                filter: parse_json::<FilterSpec>("filter", filter)?,
                sort: parse_json::<SortSpec>("sort", sort)?,
                api_config: parse_json("api-config", api_config)?,
            };
            print(&registry.subscribe(request).await?)?;
        }
        Command::Unsubscribe { id, url, channel } => {
            let target = match (id, url, channel) {
                (Some(id), _, _) => UnsubscribeTarget::Id(id),
                (None, Some(url), Some(channel)) => UnsubscribeTarget::Url { url, channel },
                _ => bail!("give a subscription id or --url with --channel"),
            };
            let removed = registry.unsubscribe(target).await?;
            println!("removed {removed} subscription(s)");
        }
        Command::List { channel } => print(&registry.list(channel.as_deref()).await?)?,
        Command::Status { id } => print(&registry.status(id).await?)?,
        Command::Stats => print(&registry.stats().await?)?,
        Command::Enable { id } => print(&registry.enable(id).await?)?,
        Command::Disable { id } => print(&registry.disable(id).await?)?,
        Command::Update { id, json } => {
            let update: SubscriptionUpdate =
                serde_json::from_str(&json).context("parsing --json")?;
            print(&registry.update(id, update).await?)?;
        }
        Command::Test { id } => {
            for preview in registry.test(id).await? {
                println!("[{}] {}\n{}\n", preview.id, preview.title, preview.message);
            }
        }
    }

    Ok(())
}

use crate::defs::{
    ActivityRecord, CheckOutcome, ErrorRecord, FeedKind, FeedStats, FeedSubscription,
    NewSubscription, SubscriptionId, SubscriptionUpdate,
};
use crate::state::{FeedStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS feed_subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feed_type TEXT NOT NULL,
        feed_url TEXT NOT NULL,
        channel_name TEXT NOT NULL,
        feed_name TEXT,
        check_interval_seconds INTEGER NOT NULL DEFAULT 300,
        output_format TEXT,
        message_send_interval_seconds REAL,
        filter_config TEXT,
        sort_config TEXT,
        api_config TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_check_time TEXT,
        consecutive_errors INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        last_item_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_seen (
        subscription_id INTEGER NOT NULL,
        item_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        seen_at TEXT NOT NULL,
        PRIMARY KEY (subscription_id, item_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_activity (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feed_id INTEGER NOT NULL,
        item_id TEXT NOT NULL,
        item_title TEXT NOT NULL,
        message_sent TEXT NOT NULL,
        processed_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feed_id INTEGER NOT NULL,
        error_type TEXT NOT NULL,
        error_message TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        resolved_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_feed_subscriptions_channel ON feed_subscriptions (channel_name)",
    "CREATE INDEX IF NOT EXISTS idx_feed_seen_seq ON feed_seen (subscription_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_feed_activity_feed ON feed_activity (feed_id, processed_at)",
    "CREATE INDEX IF NOT EXISTS idx_feed_errors_feed ON feed_errors (feed_id, occurred_at)",
];

/// Removes a subscription with its seen-set and error log. Activity rows
/// stay as delivery history.
async fn purge_subscription(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: SubscriptionId,
) -> StoreResult<u64> {
    let removed = sqlx::query("DELETE FROM feed_subscriptions WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM feed_seen WHERE subscription_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM feed_errors WHERE feed_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(removed)
}

/// SQLite-backed [`FeedStore`].
pub struct SqliteFeedStore {
    pool: SqlitePool,
    // SQLite admits one writer at a time; taking this before every write
    // transaction keeps read-modify-write sequences from interleaving.
    write_lock: Mutex<()>,
}

impl SqliteFeedStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");
        // Every connection to `:memory:` is a separate database.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.setup_schema().await?;
        info!("Feed store ready at {}", database_url);
        Ok(store)
    }

    pub async fn setup_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn encode_json<T: Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn decode_json<T: DeserializeOwned>(raw: Option<String>) -> StoreResult<Option<T>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

fn subscription_from_row(row: &SqliteRow) -> StoreResult<FeedSubscription> {
    let kind: String = row.try_get("feed_type")?;
    let kind = FeedKind::from_str(&kind).map_err(|reason| StoreError::Corrupt {
        table: "feed_subscriptions",
        reason,
    })?;

    Ok(FeedSubscription {
        id: row.try_get("id")?,
        kind,
        url: row.try_get("feed_url")?,
        channel: row.try_get("channel_name")?,
        name: row.try_get("feed_name")?,
        check_interval_seconds: row.try_get::<i64, _>("check_interval_seconds")?.max(0) as u64,
        output_format: row.try_get("output_format")?,
        send_interval_seconds: row.try_get("message_send_interval_seconds")?,
        filter: decode_json(row.try_get("filter_config")?)?,
        sort: decode_json(row.try_get("sort_config")?)?,
        api_config: decode_json(row.try_get("api_config")?)?,
        enabled: row.try_get("enabled")?,
        last_checked: row.try_get("last_check_time")?,
        error_count: row.try_get::<i64, _>("consecutive_errors")?.max(0) as u32,
        last_error: row.try_get("last_error")?,
        last_item_id: row.try_get("last_item_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn error_from_row(row: &SqliteRow) -> StoreResult<ErrorRecord> {
    Ok(ErrorRecord {
        id: row.try_get("id")?,
        subscription_id: row.try_get("feed_id")?,
        error_type: row.try_get("error_type")?,
        message: row.try_get("error_message")?,
        occurred_at: row.try_get("occurred_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

#[async_trait]
impl FeedStore for SqliteFeedStore {
    async fn insert_subscription(&self, new: NewSubscription) -> StoreResult<FeedSubscription> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO feed_subscriptions
                (feed_type, feed_url, channel_name, feed_name, check_interval_seconds,
                 output_format, message_send_interval_seconds, filter_config, sort_config,
                 api_config, enabled, consecutive_errors, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?)
            "#,
        )
        .bind(new.kind.as_str())
        .bind(&new.url)
        .bind(&new.channel)
        .bind(&new.name)
        .bind(new.check_interval_seconds as i64)
        .bind(&new.output_format)
        .bind(new.send_interval_seconds)
        .bind(encode_json(&new.filter)?)
        .bind(encode_json(&new.sort)?)
        .bind(encode_json(&new.api_config)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Inserted feed subscription {} for {}", id, new.url);

        Ok(FeedSubscription {
            id,
            kind: new.kind,
            url: new.url,
            channel: new.channel,
            name: new.name,
            check_interval_seconds: new.check_interval_seconds,
            output_format: new.output_format,
            send_interval_seconds: new.send_interval_seconds,
            filter: new.filter,
            sort: new.sort,
            api_config: new.api_config,
            enabled: true,
            last_checked: None,
            error_count: 0,
            last_error: None,
            last_item_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StoreResult<Option<FeedSubscription>> {
        let row = sqlx::query("SELECT * FROM feed_subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn list_subscriptions(
        &self,
        channel: Option<&str>,
    ) -> StoreResult<Vec<FeedSubscription>> {
        let rows = match channel {
            Some(channel) => {
                sqlx::query("SELECT * FROM feed_subscriptions WHERE channel_name = ? ORDER BY id")
                    .bind(channel)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM feed_subscriptions ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(subscription_from_row).collect()
    }

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        update: SubscriptionUpdate,
    ) -> StoreResult<Option<FeedSubscription>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM feed_subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut sub = subscription_from_row(&row)?;
        update.apply_to(&mut sub, Utc::now());

        sqlx::query(
            r#"
            UPDATE feed_subscriptions
            SET feed_name = ?, check_interval_seconds = ?, enabled = ?, output_format = ?,
                message_send_interval_seconds = ?, filter_config = ?, sort_config = ?,
                api_config = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&sub.name)
        .bind(sub.check_interval_seconds as i64)
        .bind(sub.enabled)
        .bind(&sub.output_format)
        .bind(sub.send_interval_seconds)
        .bind(encode_json(&sub.filter)?)
        .bind(encode_json(&sub.sort)?)
        .bind(encode_json(&sub.api_config)?)
        .bind(sub.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(sub))
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let removed = purge_subscription(&mut tx, id).await?;

        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn delete_subscription_by_url(&self, url: &str, channel: &str) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM feed_subscriptions WHERE feed_url = ? AND channel_name = ?",
        )
        .bind(url)
        .bind(channel)
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            purge_subscription(&mut tx, *id).await?;
        }

        tx.commit().await?;
        Ok(ids.len())
    }

    async fn record_check(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        outcome: CheckOutcome,
    ) -> StoreResult<u32> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let count = match outcome {
            CheckOutcome::Success => {
                sqlx::query(
                    r#"
                    UPDATE feed_subscriptions
                    SET last_check_time = ?, consecutive_errors = 0, last_error = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE feed_errors SET resolved_at = ? WHERE feed_id = ? AND resolved_at IS NULL",
                )
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                0
            }
            CheckOutcome::Failure {
                error_type,
                message,
            } => {
                let updated = sqlx::query(
                    r#"
                    UPDATE feed_subscriptions
                    SET last_check_time = ?, consecutive_errors = consecutive_errors + 1,
                        last_error = ?
                    WHERE id = ?
                    "#,
                )
                .bind(at)
                .bind(&message)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if updated == 0 {
                    0
                } else {
                    sqlx::query(
                        r#"
                        INSERT INTO feed_errors (feed_id, error_type, error_message, occurred_at)
                        VALUES (?, ?, ?, ?)
                        "#,
                    )
                    .bind(id)
                    .bind(&error_type)
                    .bind(&message)
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;

                    let count: i64 = sqlx::query_scalar(
                        "SELECT consecutive_errors FROM feed_subscriptions WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                    count.max(0) as u32
                }
            }
        };

        tx.commit().await?;
        Ok(count)
    }

    async fn seen_ids(&self, id: SubscriptionId) -> StoreResult<HashSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT item_id FROM feed_seen WHERE subscription_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn add_seen(
        &self,
        id: SubscriptionId,
        item_ids: &[String],
        capacity: usize,
    ) -> StoreResult<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM feed_seen WHERE subscription_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        for item_id in item_ids {
            seq += 1;
            sqlx::query(
                r#"
                INSERT INTO feed_seen (subscription_id, item_id, seq, seen_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (subscription_id, item_id)
                DO UPDATE SET seq = excluded.seq, seen_at = excluded.seen_at
                "#,
            )
            .bind(id)
            .bind(item_id)
            .bind(seq)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM feed_seen
            WHERE subscription_id = ?
              AND seq NOT IN (
                  SELECT seq FROM feed_seen
                  WHERE subscription_id = ?
                  ORDER BY seq DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(capacity as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_activity(&self, record: ActivityRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO feed_activity (feed_id, item_id, item_title, message_sent, processed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.subscription_id)
        .bind(&record.item_id)
        .bind(&record.item_title)
        .bind(&record.message)
        .bind(record.processed_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE feed_subscriptions SET last_item_id = ? WHERE id = ?")
            .bind(&record.item_id)
            .bind(record.subscription_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn activity(&self, id: SubscriptionId, limit: usize) -> StoreResult<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT feed_id, item_id, item_title, message_sent, processed_at
            FROM feed_activity
            WHERE feed_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ActivityRecord {
                    subscription_id: row.try_get("feed_id")?,
                    item_id: row.try_get("item_id")?,
                    item_title: row.try_get("item_title")?,
                    message: row.try_get("message_sent")?,
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }

    async fn errors(&self, id: SubscriptionId, limit: usize) -> StoreResult<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM feed_errors WHERE feed_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(error_from_row).collect()
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<FeedStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_subscriptions")
            .fetch_one(&self.pool)
            .await?;
        let enabled: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_subscriptions WHERE enabled = 1")
                .fetch_one(&self.pool)
                .await?;
        let items_24h: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_activity WHERE processed_at > ?")
                .bind(now - Duration::hours(24))
                .fetch_one(&self.pool)
                .await?;
        let items_7d: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_activity WHERE processed_at > ?")
                .bind(now - Duration::days(7))
                .fetch_one(&self.pool)
                .await?;
        let active_errors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_errors WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            r#"
            SELECT channel_name, COUNT(*) AS feed_count
            FROM feed_subscriptions
            WHERE enabled = 1
            GROUP BY channel_name
            ORDER BY feed_count DESC, channel_name ASC
            LIMIT 10
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let top_channels = rows
            .iter()
            .map(|row| {
                let channel: String = row.try_get("channel_name")?;
                let count: i64 = row.try_get("feed_count")?;
                Ok((channel, count.max(0) as usize))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(FeedStats {
            total_subscriptions: total.max(0) as usize,
            enabled_subscriptions: enabled.max(0) as usize,
            items_24h: items_24h.max(0) as usize,
            items_7d: items_7d.max(0) as usize,
            active_errors: active_errors.max(0) as usize,
            top_channels,
        })
    }
}

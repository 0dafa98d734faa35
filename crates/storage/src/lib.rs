use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChannelId, ChannelSummary, Message, MessageId, Sender, UserId};

/// Durable, queryable log of messages keyed by channel, plus the membership
/// directory (subscriptions, push endpoints, muted channels). Concurrent
/// writes serialize at single-insert granularity through the pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// One push delivery target resolved from the membership directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    pub user_id: UserId,
    pub token: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let database_url = normalize_database_url(database_url);
        ensure_sqlite_parent_dir_exists(&database_url)?;

        let connect_options =
            SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_channel(&self, channel_id: &ChannelId, description: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, description) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET description = excluded.description",
        )
        .bind(channel_id.as_str())
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelSummary>> {
        let row = sqlx::query("SELECT id, description FROM channels WHERE id = ?")
            .bind(channel_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChannelSummary {
            channel_id: ChannelId(r.get::<String, _>(0)),
            description: r.get::<String, _>(1),
        }))
    }

    /// Inserts a message, ignoring duplicates by id so an at-least-once
    /// retry never produces a second row. Returns whether a row was written.
    pub async fn insert_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages
                 (id, channel_id, sender_id, sender_name, body_text, image_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.as_str())
        .bind(message.channel_id.as_str())
        .bind(message.sender.id.as_str())
        .bind(message.sender.name.as_deref())
        .bind(message.text.as_deref())
        .bind(message.image_url.as_deref())
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delta query: messages in a channel with `created_at` strictly greater
    /// than the watermark, ascending.
    pub async fn messages_after(
        &self,
        channel_id: &ChannelId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, sender_id, sender_name, body_text, image_url, created_at
             FROM messages
             WHERE channel_id = ? AND created_at > ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(channel_id.as_str())
        .bind(after)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Message {
                id: MessageId(r.get::<String, _>(0)),
                channel_id: ChannelId(r.get::<String, _>(1)),
                sender: Sender {
                    id: UserId(r.get::<String, _>(2)),
                    name: r.get::<Option<String>, _>(3),
                },
                text: r.get::<Option<String>, _>(4),
                image_url: r.get::<Option<String>, _>(5),
                created_at: r.get::<DateTime<Utc>, _>(6),
            })
            .collect())
    }

    pub async fn subscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO subscriptions (user_id, channel_id) VALUES (?, ?)")
            .bind(user_id.as_str())
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<()> {
        sqlx::query("DELETE FROM subscriptions WHERE user_id = ? AND channel_id = ?")
            .bind(user_id.as_str())
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn register_push_endpoint(&self, user_id: &UserId, token: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO push_endpoints (user_id, token) VALUES (?, ?)")
            .bind(user_id.as_str())
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes one endpoint token for a user; the logout path.
    pub async fn unregister_push_endpoint(&self, user_id: &UserId, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM push_endpoints WHERE user_id = ? AND token = ?")
            .bind(user_id.as_str())
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_muted(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
        muted: bool,
    ) -> Result<()> {
        if muted {
            sqlx::query("INSERT OR IGNORE INTO muted_channels (user_id, channel_id) VALUES (?, ?)")
                .bind(user_id.as_str())
                .bind(channel_id.as_str())
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("DELETE FROM muted_channels WHERE user_id = ? AND channel_id = ?")
                .bind(user_id.as_str())
                .bind(channel_id.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn is_muted(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<bool> {
        let row =
            sqlx::query("SELECT 1 FROM muted_channels WHERE user_id = ? AND channel_id = ?")
                .bind(user_id.as_str())
                .bind(channel_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Resolves the fan-out recipients for a channel: one row per endpoint
    /// token of every subscribed member, excluding the sender's own record
    /// and anyone who muted the channel. Read fresh on every broadcast so
    /// the directory stays the single source of truth.
    pub async fn notification_targets(
        &self,
        channel_id: &ChannelId,
        sender_id: &UserId,
    ) -> Result<Vec<NotificationTarget>> {
        let rows = sqlx::query(
            "SELECT e.user_id, e.token
             FROM subscriptions s
             INNER JOIN push_endpoints e ON e.user_id = s.user_id
             WHERE s.channel_id = ?
               AND s.user_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM muted_channels m
                   WHERE m.user_id = s.user_id AND m.channel_id = s.channel_id
               )
             ORDER BY e.user_id ASC, e.token ASC",
        )
        .bind(channel_id.as_str())
        .bind(sender_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| NotificationTarget {
                user_id: UserId(r.get::<String, _>(0)),
                token: r.get::<String, _>(1),
            })
            .collect())
    }
}

/// Accepts plain file paths as well as sqlite URLs so `DATABASE_URL` can be
/// either; missing parent directories are created before connecting.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

//! Local client-side persistence: the handful of values that survive a
//! session (mute registry, last selected workspace) in a small sqlite file.
//! Conversation and message state is owned by the remote store and is never
//! written here.

use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChannelId, WorkspaceId};

const LAST_WORKSPACE_KEY: &str = "last_workspace";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_value(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_workspace(&self) -> Result<Option<WorkspaceId>> {
        Ok(self
            .get_value(LAST_WORKSPACE_KEY)
            .await?
            .map(WorkspaceId::new))
    }

    pub async fn set_last_workspace(&self, workspace: &WorkspaceId) -> Result<()> {
        self.set_value(LAST_WORKSPACE_KEY, workspace.as_str()).await
    }

    pub async fn muted_channels(&self) -> Result<HashSet<ChannelId>> {
        let rows = sqlx::query("SELECT channel_id FROM muted_channels")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChannelId::new(r.get::<String, _>(0)))
            .collect())
    }

    pub async fn is_channel_muted(&self, channel: &ChannelId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM muted_channels WHERE channel_id = ?")
            .bind(channel.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn set_channel_muted(&self, channel: &ChannelId, muted: bool) -> Result<()> {
        if muted {
            sqlx::query("INSERT OR IGNORE INTO muted_channels (channel_id) VALUES (?)")
                .bind(channel.as_str())
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("DELETE FROM muted_channels WHERE channel_id = ?")
                .bind(channel.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
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

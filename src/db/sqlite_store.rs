use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::info;

use super::{Announcement, DataSafe, DataSafeError, validate_identifier};

/// Longest tenant key or plugin name accepted as a row key.
const MAX_IDENTIFIER_LEN: usize = 500;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS config (
        tenant TEXT NOT NULL,
        plugin TEXT NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (tenant, plugin)
    )",
    "CREATE TABLE IF NOT EXISTS announcement (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant TEXT NOT NULL,
        header TEXT NOT NULL,
        message TEXT NOT NULL,
        time TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS announcement_tenant ON announcement (tenant, id)",
];

/// Relational backend. The configuration bytes are a SQLite connection URL,
/// e.g. `sqlite://announcer.db`.
#[derive(Default)]
pub struct SqliteDataSafe {
    pool: OnceCell<SqlitePool>,
}

impl SqliteDataSafe {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> Result<&SqlitePool, DataSafeError> {
        self.pool.get().ok_or(DataSafeError::NotInitialised)
    }
}

fn check(identifier: &str) -> Result<(), DataSafeError> {
    validate_identifier(identifier)?;
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(DataSafeError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

fn row_to_announcement(row: &sqlx::sqlite::SqliteRow) -> Result<Announcement, DataSafeError> {
    Ok(Announcement {
        header: row.try_get("header")?,
        message: row.try_get("message")?,
        time: row.try_get::<DateTime<Utc>, _>("time")?,
    })
}

#[async_trait]
impl DataSafe for SqliteDataSafe {
    async fn initialise(&self, config: &[u8]) -> Result<(), DataSafeError> {
        let url = std::str::from_utf8(config)
            .map_err(|e| DataSafeError::InvalidConfig(e.to_string()))?
            .trim();
        if url.is_empty() {
            return Err(DataSafeError::InvalidConfig(
                "missing SQLite connection URL".to_string(),
            ));
        }
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        self.pool
            .set(pool)
            .map_err(|_| DataSafeError::AlreadyInitialised)?;
        info!("SQLite data safe initialised.");
        Ok(())
    }

    async fn get_config(&self, key: &str, plugin: &str) -> Result<Option<Vec<u8>>, DataSafeError> {
        check(key)?;
        check(plugin)?;
        let row = sqlx::query("SELECT data FROM config WHERE tenant = ? AND plugin = ?")
            .bind(key)
            .bind(plugin)
            .fetch_optional(self.pool()?)
            .await?;
        row.map(|row| row.try_get::<Vec<u8>, _>("data"))
            .transpose()
            .map_err(Into::into)
    }

    async fn set_config(&self, key: &str, plugin: &str, data: &[u8]) -> Result<(), DataSafeError> {
        check(key)?;
        check(plugin)?;
        sqlx::query(
            "INSERT INTO config (tenant, plugin, data) VALUES (?, ?, ?)
             ON CONFLICT (tenant, plugin) DO UPDATE SET data = excluded.data",
        )
        .bind(key)
        .bind(plugin)
        .bind(data)
        .execute(self.pool()?)
        .await?;
        Ok(())
    }

    async fn save_announcement(
        &self,
        key: &str,
        announcement: &Announcement,
    ) -> Result<String, DataSafeError> {
        check(key)?;
        let result = sqlx::query(
            "INSERT INTO announcement (tenant, header, message, time) VALUES (?, ?, ?, ?)",
        )
        .bind(key)
        .bind(&announcement.header)
        .bind(&announcement.message)
        .bind(announcement.time)
        .execute(self.pool()?)
        .await?;
        Ok(result.last_insert_rowid().to_string())
    }

    async fn get_announcement(&self, key: &str, id: &str) -> Result<Announcement, DataSafeError> {
        check(key)?;
        let id_num: i64 = id
            .parse()
            .map_err(|_| DataSafeError::NotFound(id.to_string()))?;
        let row = sqlx::query(
            "SELECT header, message, time FROM announcement WHERE tenant = ? AND id = ?",
        )
        .bind(key)
        .bind(id_num)
        .fetch_optional(self.pool()?)
        .await?
        .ok_or_else(|| DataSafeError::NotFound(id.to_string()))?;
        row_to_announcement(&row)
    }

    async fn get_all_announcements(&self, key: &str) -> Result<Vec<Announcement>, DataSafeError> {
        check(key)?;
        let rows = sqlx::query(
            "SELECT header, message, time FROM announcement WHERE tenant = ? ORDER BY id",
        )
        .bind(key)
        .fetch_all(self.pool()?)
        .await?;
        rows.iter().map(row_to_announcement).collect()
    }

    async fn get_announcement_keys(&self, key: &str) -> Result<Vec<String>, DataSafeError> {
        check(key)?;
        let rows = sqlx::query("SELECT id FROM announcement WHERE tenant = ? ORDER BY id")
            .bind(key)
            .fetch_all(self.pool()?)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("id")?.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &std::path::Path) -> SqliteDataSafe {
        let store = SqliteDataSafe::new();
        let url = format!("sqlite://{}", dir.join("test.db").display());
        store.initialise(url.as_bytes()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_config_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        assert_eq!(store.get_config("news", "Telegram").await.unwrap(), None);
        store.set_config("news", "Telegram", b"a").await.unwrap();
        store.set_config("news", "Telegram", b"b").await.unwrap();
        assert_eq!(
            store.get_config("news", "Telegram").await.unwrap(),
            Some(b"b".to_vec())
        );
        assert_eq!(store.get_config("other", "Telegram").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_history_is_ordered_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let a = Announcement::new("a", "1");
        let b = Announcement::new("b", "2");
        let id_a = store.save_announcement("news", &a).await.unwrap();
        store
            .save_announcement("other", &Announcement::new("x", "y"))
            .await
            .unwrap();
        let id_b = store.save_announcement("news", &b).await.unwrap();

        assert!(id_a.parse::<i64>().unwrap() < id_b.parse::<i64>().unwrap());
        assert_eq!(
            store.get_announcement_keys("news").await.unwrap(),
            vec![id_a.clone(), id_b.clone()]
        );
        let all = store.get_all_announcements("news").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].header, "a");
        assert_eq!(all[1].header, "b");
        assert_eq!(store.get_announcement("news", &id_b).await.unwrap().message, "2");
        assert!(matches!(
            store.get_announcement("other", &id_b).await,
            Err(DataSafeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_overlong_and_reserved_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let long_key = "k".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            store.set_config(&long_key, "RSS", b"x").await,
            Err(DataSafeError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            store.get_config("news", "\u{FDD0}").await,
            Err(DataSafeError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_config_is_rejected() {
        let store = SqliteDataSafe::new();
        assert!(matches!(
            store.initialise(b"  ").await,
            Err(DataSafeError::InvalidConfig(_))
        ));
    }
}

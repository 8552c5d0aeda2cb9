use std::path::Path;

use anyhow::Result;
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;

use crate::cursor::{CursorStore, Cursors};

/// Cursor store backed by a SQLite file.
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                channel TEXT PRIMARY KEY,
                last_seen INTEGER NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl CursorStore for Database {
    async fn load(&self) -> Result<Cursors> {
        let rows = sqlx::query(
            r#"
            SELECT channel, last_seen FROM cursors
            ORDER BY channel
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let cursors: Cursors = rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
            .collect();
        debug!("Loaded {} cursors from database", cursors.len());
        Ok(cursors)
    }

    async fn save(&self, cursors: &Cursors) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM cursors").execute(&mut *tx).await?;

        for (channel, last_seen) in cursors.iter() {
            sqlx::query(
                r#"
                INSERT INTO cursors (channel, last_seen)
                VALUES (?, ?)
                "#,
            )
            .bind(channel)
            .bind(last_seen)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Saved {} cursors to database", cursors.len());
        Ok(())
    }
}

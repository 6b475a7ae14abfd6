//! SQLite result sink

use crate::proxy::models::ValidationResult;
use crate::sink::ResultSink;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

/// Stores the verified proxies of the latest run in a `verified_proxies` table
pub struct SqliteSink {
    pool: SqlitePool,
    run_id: Uuid,
}

/// Row of the `verified_proxies` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRow {
    pub proxy: String,
    pub reported_ip: Option<String>,
    pub latency_ms: Option<i64>,
    pub run_id: String,
}

impl SqliteSink {
    /// Open (creating if needed) the database and clear the previous run
    pub async fn connect(database_url: &str, run_id: Uuid) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, run_id).await
    }

    pub async fn from_pool(pool: SqlitePool, run_id: Uuid) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS verified_proxies (
                proxy TEXT PRIMARY KEY,
                reported_ip TEXT,
                latency_ms INTEGER,
                run_id TEXT NOT NULL,
                checked_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Every run re-validates from scratch
        sqlx::query("DELETE FROM verified_proxies")
            .execute(&pool)
            .await?;

        Ok(Self { pool, run_id })
    }

    async fn upsert(
        &self,
        proxy: &str,
        reported_ip: Option<&str>,
        latency_ms: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verified_proxies (proxy, reported_ip, latency_ms, run_id, checked_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(proxy) DO UPDATE SET
                reported_ip = excluded.reported_ip,
                latency_ms = excluded.latency_ms,
                run_id = excluded.run_id,
                checked_at = excluded.checked_at
            "#,
        )
        .bind(proxy)
        .bind(reported_ip)
        .bind(latency_ms)
        .bind(self.run_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All rows, ordered by proxy
    pub async fn rows(&self) -> Result<Vec<VerifiedRow>> {
        let rows = sqlx::query(
            "SELECT proxy, reported_ip, latency_ms, run_id FROM verified_proxies ORDER BY proxy",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(VerifiedRow {
                proxy: row.try_get("proxy")?,
                reported_ip: row.try_get("reported_ip")?,
                latency_ms: row.try_get("latency_ms")?,
                run_id: row.try_get("run_id")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn accept(&mut self, proxy: &str) -> Result<()> {
        self.upsert(proxy, None, None).await
    }

    async fn accept_result(&mut self, result: &ValidationResult) -> Result<()> {
        let proxy = result.endpoint.to_string();
        let latency = result.latency_ms().map(|ms| ms as i64);
        self.upsert(&proxy, result.reported_ip.as_deref(), latency).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

//! Proxy store backed by SQLite

use crate::error::{Error, Result};
use crate::proxy::catalog::{Sort, SortKey, SortOrder};
use crate::proxy::models::{ProxyId, ProxyRecord, ProxyType};
use crate::proxy::stats::ProxyStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::debug;

const COLUMNS: &str = "scheme, address, port, created_at, updated_at, today_checks, \
     today_speed, today_speed_samples, today_uptime, speed_history, uptime_history";

/// Storage operations the monitor needs from its backing store
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Insert a new proxy. Returns `false` if the identity triple already exists.
    async fn insert(&self, record: &ProxyRecord) -> Result<bool>;

    async fn find(&self, id: &ProxyId) -> Result<Option<ProxyRecord>>;

    /// The proxy with the oldest `updated_at`
    async fn find_least_recently_updated(&self) -> Result<Option<ProxyRecord>>;

    /// Persist a record's statistics and `updated_at`
    async fn update_stats(&self, record: &ProxyRecord) -> Result<()>;

    async fn list_page(
        &self,
        good_only: bool,
        sort: Sort,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ProxyRecord>>;

    async fn count_all(&self) -> Result<u64>;

    async fn count_good(&self) -> Result<u64>;
}

#[derive(Debug, FromRow)]
struct ProxyRow {
    scheme: String,
    address: String,
    port: i64,
    created_at: i64,
    updated_at: i64,
    today_checks: Option<i64>,
    today_speed: Option<f64>,
    today_speed_samples: i64,
    today_uptime: f64,
    speed_history: String,
    uptime_history: String,
}

impl TryFrom<ProxyRow> for ProxyRecord {
    type Error = Error;

    fn try_from(row: ProxyRow) -> Result<Self> {
        let scheme: ProxyType = row.scheme.parse()?;
        let address: Ipv4Addr = row
            .address
            .parse()
            .map_err(|_| Error::InvalidRow(format!("address {}", row.address)))?;
        let port = u16::try_from(row.port)
            .map_err(|_| Error::InvalidRow(format!("port {}", row.port)))?;

        let today_checks = row
            .today_checks
            .map(|n| {
                u32::try_from(n).map_err(|_| Error::InvalidRow(format!("today_checks {}", n)))
            })
            .transpose()?;
        let today_speed_samples = u32::try_from(row.today_speed_samples).map_err(|_| {
            Error::InvalidRow(format!("today_speed_samples {}", row.today_speed_samples))
        })?;

        let stats = ProxyStats {
            today_checks,
            today_speed: row.today_speed,
            today_speed_samples,
            today_uptime: row.today_uptime,
            speed_history: serde_json::from_str(&row.speed_history)?,
            uptime_history: serde_json::from_str(&row.uptime_history)?,
        };

        Ok(ProxyRecord {
            id: ProxyId::new(scheme, address, port),
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            stats,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| Error::InvalidRow(format!("timestamp {}", ms)))
}

impl SortKey {
    fn column(&self) -> &'static str {
        match self {
            SortKey::Recency => "updated_at",
            SortKey::Speed => "avg_speed",
            SortKey::Uptime => "avg_uptime",
        }
    }
}

impl SortOrder {
    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// SQLite implementation of [`ProxyStore`]
pub struct ProxyDatabase {
    pool: SqlitePool,
}

impl ProxyDatabase {
    /// Open (or create) the database and run migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // A single long-lived connection keeps in-memory databases alive and
        // avoids "database is locked" under concurrent writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                scheme TEXT NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                today_checks INTEGER,
                today_speed REAL,
                today_speed_samples INTEGER NOT NULL DEFAULT 0,
                today_uptime REAL NOT NULL DEFAULT 0,
                speed_history TEXT NOT NULL DEFAULT '[]',
                uptime_history TEXT NOT NULL DEFAULT '[]',
                avg_speed REAL,
                avg_uptime REAL,
                PRIMARY KEY (scheme, address, port)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxies_updated_at ON proxies (updated_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxies_avg_uptime ON proxies (avg_uptime)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ProxyStore for ProxyDatabase {
    async fn insert(&self, record: &ProxyRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO proxies (scheme, address, port, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (scheme, address, port) DO NOTHING
            "#,
        )
        .bind(record.id.scheme.as_str())
        .bind(record.id.address.to_string())
        .bind(i64::from(record.id.port))
        .bind(record.created_at.timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(proxy = %record.id, "proxy already registered");
        }
        Ok(inserted)
    }

    async fn find(&self, id: &ProxyId) -> Result<Option<ProxyRecord>> {
        let row: Option<ProxyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM proxies WHERE scheme = ? AND address = ? AND port = ?",
            COLUMNS
        ))
        .bind(id.scheme.as_str())
        .bind(id.address.to_string())
        .bind(i64::from(id.port))
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProxyRecord::try_from).transpose()
    }

    async fn find_least_recently_updated(&self) -> Result<Option<ProxyRecord>> {
        let row: Option<ProxyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM proxies ORDER BY updated_at ASC LIMIT 1",
            COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProxyRecord::try_from).transpose()
    }

    async fn update_stats(&self, record: &ProxyRecord) -> Result<()> {
        let stats = &record.stats;
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET updated_at = ?,
                today_checks = ?,
                today_speed = ?,
                today_speed_samples = ?,
                today_uptime = ?,
                speed_history = ?,
                uptime_history = ?,
                avg_speed = ?,
                avg_uptime = ?
            WHERE scheme = ? AND address = ? AND port = ?
            "#,
        )
        .bind(record.updated_at.timestamp_millis())
        .bind(stats.today_checks.map(i64::from))
        .bind(stats.today_speed)
        .bind(i64::from(stats.today_speed_samples))
        .bind(stats.today_uptime)
        .bind(serde_json::to_string(&stats.speed_history)?)
        .bind(serde_json::to_string(&stats.uptime_history)?)
        .bind(stats.average_speed())
        .bind(stats.average_uptime())
        .bind(record.id.scheme.as_str())
        .bind(record.id.address.to_string())
        .bind(i64::from(record.id.port))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(record.id));
        }
        Ok(())
    }

    async fn list_page(
        &self,
        good_only: bool,
        sort: Sort,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ProxyRecord>> {
        let filter = if good_only { "WHERE avg_uptime > 0" } else { "" };
        let column = sort.key.column();
        // Column and direction come from fixed enums, never from input text
        let query = format!(
            "SELECT {} FROM proxies {} ORDER BY {} IS NULL, {} {}, scheme, address, port \
             LIMIT ? OFFSET ?",
            COLUMNS,
            filter,
            column,
            column,
            sort.order.keyword()
        );

        let rows: Vec<ProxyRow> = sqlx::query_as(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ProxyRecord::try_from).collect()
    }

    async fn count_all(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn count_good(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies WHERE avg_uptime > 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

//! Database module for the link tracker
//!
//! A libSQL database holding the whitelist of external links and the log
//! of redirect hits, behind the [`LinkStore`] trait the handlers use.
//!
//! In-memory databases keep one persistent connection: every libSQL
//! connection to `:memory:` would otherwise see its own empty database.

mod migrations;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{params::IntoParams, Connection, Database as LibSqlDatabase};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub use migrations::MigrationRunner;

/// Database path selecting a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

pub fn is_in_memory(path: &Path) -> bool {
    path == Path::new(IN_MEMORY)
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    persistent: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Open `path`, or an in-memory database when it is [`IN_MEMORY`].
    pub async fn open(name: &str, path: &Path) -> Result<Self, DatabaseError> {
        if is_in_memory(path) {
            Self::in_memory(name).await
        } else {
            Self::open_local(name, path).await
        }
    }

    /// Get a fresh connection to the database
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    /// The shared connection of an in-memory database.
    pub fn persistent_connection(&self) -> Option<Arc<Mutex<Connection>>> {
        self.persistent.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a query on the persistent connection if there is one.
    pub async fn query(
        &self,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<libsql::Rows, DatabaseError> {
        let rows = if let Some(persistent) = &self.persistent {
            let conn = persistent.lock().await;
            conn.query(sql, params).await
        } else {
            self.connect()?.query(sql, params).await
        };
        rows.map_err(|e| DatabaseError::QueryFailed(e.to_string()))
    }

    /// Execute a statement on the persistent connection if there is one.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> Result<u64, DatabaseError> {
        let changed = if let Some(persistent) = &self.persistent {
            let conn = persistent.lock().await;
            conn.execute(sql, params).await
        } else {
            self.connect()?.execute(sql, params).await
        };
        changed.map_err(|e| DatabaseError::QueryFailed(e.to_string()))
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        match self.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// One redirect served to a visitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub url: String,
    pub at: DateTime<Utc>,
    /// The `Referer` header, or empty.
    pub referrer: String,
}

/// Number of hits on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyHits {
    pub day: NaiveDate,
    pub hits: u64,
}

/// Whitelist and hit log storage used by the HTTP handlers.
#[async_trait]
pub trait LinkStore: Send + Sync + 'static {
    /// Whether `url` may be redirected to.
    async fn is_whitelisted(&self, url: &str) -> Result<bool, DatabaseError>;

    /// Add `url` to the whitelist. Adding a known URL is a no-op.
    async fn add_url(&self, url: &str) -> Result<(), DatabaseError>;

    async fn record_hit(&self, hit: &Hit) -> Result<(), DatabaseError>;

    /// Hits on `url` between `from` and `to` inclusive, grouped by UTC day
    /// and ordered by day. Days without hits are omitted.
    async fn daily_hits(
        &self,
        url: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyHits>, DatabaseError>;
}

/// [`LinkStore`] backed by a libSQL [`Database`].
#[derive(Clone)]
pub struct LibsqlLinkStore {
    db: Database,
}

impl LibsqlLinkStore {
    /// Wrap `db`, applying any pending migrations first.
    pub async fn new(db: Database) -> Result<Self, DatabaseError> {
        MigrationRunner::new(migrations::all()).run(&db).await?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn database(&self) -> &Database {
        &self.db
    }
}

/// Timestamps are stored as RFC 3339 UTC text so they sort and compare as
/// strings and the first ten characters are the day.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl LinkStore for LibsqlLinkStore {
    #[instrument(skip(self))]
    async fn is_whitelisted(&self, url: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .db
            .query(
                "SELECT 1 FROM links WHERE external_url = ?1 LIMIT 1",
                libsql::params![url],
            )
            .await?;
        let found = rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?
            .is_some();
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn add_url(&self, url: &str) -> Result<(), DatabaseError> {
        let inserted = self
            .db
            .execute(
                "INSERT OR IGNORE INTO links (external_url) VALUES (?1)",
                libsql::params![url],
            )
            .await?;
        if inserted > 0 {
            info!(url, "Added external link");
        } else {
            debug!(url, "External link already whitelisted");
        }
        Ok(())
    }

    async fn record_hit(&self, hit: &Hit) -> Result<(), DatabaseError> {
        self.db
            .execute(
                "INSERT INTO hits (external_url, hit_at, referrer) VALUES (?1, ?2, ?3)",
                libsql::params![hit.url.as_str(), timestamp(hit.at), hit.referrer.as_str()],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn daily_hits(
        &self,
        url: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyHits>, DatabaseError> {
        let mut rows = self
            .db
            .query(
                r#"
                SELECT substr(hit_at, 1, 10) AS day, COUNT(*) AS hits
                FROM hits
                WHERE external_url = ?1 AND hit_at >= ?2 AND hit_at <= ?3
                GROUP BY day
                ORDER BY day
                "#,
                libsql::params![url, timestamp(from), timestamp(to)],
            )
            .await?;

        let mut days = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?
        {
            let day: String = row.get(0)?;
            let hits: i64 = row.get(1)?;
            let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .map_err(|e| DatabaseError::QueryFailed(format!("bad day {day:?}: {e}")))?;
            days.push(DailyHits {
                day,
                hits: hits.max(0) as u64,
            });
        }
        Ok(days)
    }
}

//! Database migration system for the link tracker
//!
//! Migrations are embedded SQL applied in version order; applied versions
//! are tracked in a `_migrations` table so each runs once.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

/// Whitelisted links and the hit log.
pub const V0001_INITIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_url TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS hits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_url TEXT NOT NULL,
    hit_at TEXT NOT NULL,                  -- RFC 3339, UTC, whole seconds
    referrer TEXT NOT NULL DEFAULT ''
);
"#;

/// Index backing the per-URL daily report.
pub const V0002_HITS_BY_URL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_hits_url_time ON hits(external_url, hit_at);
"#;

/// All migrations in order.
pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema - links and hits",
            sql: V0001_INITIAL_SCHEMA,
        },
        Migration {
            version: 2,
            description: "Index hits by URL and time",
            sql: V0002_HITS_BY_URL,
        },
    ]
}

/// Applies pending migrations to a database
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// Run all pending migrations on the database, returning the versions
    /// applied by this call.
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        if let Some(persistent) = db.persistent_connection() {
            let conn = persistent.lock().await;
            self.run_with_connection(&conn).await
        } else {
            let conn = db.connect()?;
            self.run_with_connection(&conn).await
        }
    }

    async fn run_with_connection(&self, conn: &libsql::Connection) -> Result<Vec<i64>, DatabaseError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e)))?;

        let mut applied: Vec<i64> = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM _migrations ORDER BY version", ())
            .await
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e)))?;

        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })? {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version from row: {}", e))
            })?;
            applied.push(version);
        }

        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration v{} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("No new migrations to apply");
        } else {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }

    /// Get the current schema version
    #[cfg(test)]
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let mut rows = db
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='_migrations'",
                (),
            )
            .await?;
        if rows.next().await?.is_none() {
            return Ok(None);
        }

        let mut rows = db.query("SELECT MAX(version) FROM _migrations", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0).ok()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migration_runner() {
        let db = Database::in_memory("test-migrations").await.unwrap();
        let runner = MigrationRunner::new(all());

        assert_eq!(runner.current_version(&db).await.unwrap(), None);

        let applied = runner.run(&db).await.unwrap();
        assert_eq!(applied, vec![1, 2]);

        // Running again should apply nothing
        let applied_again = runner.run(&db).await.unwrap();
        assert!(applied_again.is_empty());

        assert_eq!(runner.current_version(&db).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_tables_exist() {
        let db = Database::in_memory("test-tables").await.unwrap();
        MigrationRunner::new(all()).run(&db).await.unwrap();

        let mut rows = db
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                (),
            )
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(0).unwrap();
            tables.push(name);
        }

        assert!(tables.contains(&"links".to_string()));
        assert!(tables.contains(&"hits".to_string()));
    }

    #[tokio::test]
    async fn test_failed_migration_is_reported() {
        let db = Database::in_memory("test-broken").await.unwrap();
        let runner = MigrationRunner::new(vec![Migration {
            version: 1,
            description: "broken",
            sql: "CREATE TABLE (",
        }]);

        let err = runner.run(&db).await.unwrap_err();
        assert!(matches!(err, DatabaseError::MigrationFailed(_)));
    }
}

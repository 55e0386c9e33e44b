//! SQLite event store.
//!
//! Holds the raw link events, the reference data they join against, and the
//! aggregate tables. Schema lives in `/sql/` and is applied in file order;
//! `PRAGMA user_version` records how many files have run.
//!
//! Tables:
//! - `link_events` + `link_event_urls`: append-only raw facts and their patterns
//! - `organisations`, `collections`, `programs`, `users`, `url_patterns`
//! - `*_aggregates`, `program_top_*`: one row per key tuple per day

mod aggregates;
mod events;
mod reference;

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;
use crate::models::DatabaseConfig;

pub use aggregates::{AggregateCounts, AggregateKey, AggregateRow};
pub use events::RestoreSummary;

/// Schema files, applied in order. Each uses `IF NOT EXISTS`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "00_organisations.sql",
        include_str!("../../sql/00_organisations.sql"),
    ),
    (
        "01_link_events.sql",
        include_str!("../../sql/01_link_events.sql"),
    ),
    ("02_aggregates.sql", include_str!("../../sql/02_aggregates.sql")),
    (
        "03_program_totals.sql",
        include_str!("../../sql/03_program_totals.sql"),
    ),
];

/// Handle to the SQLite database.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(busy_timeout)?;

        // WAL lets the aggregation jobs read while ingestion keeps writing
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("SQLite journal_mode={} for {}", mode, path.as_ref().display());

        Self::init(conn)
    }

    /// Open the database described by the configuration.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Apply schema files that have not run yet.
    fn migrate(&self) -> Result<()> {
        let applied: usize =
            self.conn
                .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))? as usize;

        for (index, (name, sql)) in MIGRATIONS.iter().enumerate().skip(applied) {
            log::info!("Running schema migration {}", name);
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", (index + 1) as i64)?;
            tx.commit()?;
        }
        Ok(())
    }

    /// Underlying connection, for queries the typed API does not cover.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_record_user_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i64 = db
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
    }

    #[test]
    fn test_reopen_file_database_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("linkstats.db");

        {
            let db = Database::open(&path, Duration::from_secs(1)).unwrap();
            db.create_organisation("ACME Org").unwrap();
        }

        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM organisations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}

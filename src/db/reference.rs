//! Organisations, collections, programs, users and URL patterns.
//!
//! These are owned by the administrative collaborator; the pipeline only
//! reads them, apart from the get-or-create of users when restoring archives.

use rusqlite::{OptionalExtension, params};

use super::Database;
use crate::error::{AppError, Result};
use crate::models::{Collection, Organisation, Program, UrlPattern};

impl Database {
    pub fn create_organisation(&self, name: &str) -> Result<Organisation> {
        self.conn
            .execute("INSERT INTO organisations (name) VALUES (?1)", params![name])?;
        Ok(Organisation {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    pub fn create_collection(
        &self,
        name: &str,
        organisation_id: Option<i64>,
    ) -> Result<Collection> {
        self.conn.execute(
            "INSERT INTO collections (name, organisation_id) VALUES (?1, ?2)",
            params![name, organisation_id],
        )?;
        Ok(Collection {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            organisation_id,
        })
    }

    pub fn collection(&self, id: i64) -> Result<Option<Collection>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, organisation_id FROM collections WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Collection {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        organisation_id: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Collections that belong to an organisation, in id order.
    pub fn organisation_collections(&self) -> Result<Vec<Collection>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, organisation_id FROM collections
             WHERE organisation_id IS NOT NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Collection {
                id: row.get(0)?,
                name: row.get(1)?,
                organisation_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn create_program(&self, name: &str, description: Option<&str>) -> Result<Program> {
        self.conn.execute(
            "INSERT INTO programs (name, description) VALUES (?1, ?2)",
            params![name, description],
        )?;
        Ok(Program {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.map(str::to_string),
        })
    }

    pub fn add_program_organisation(&self, program_id: i64, organisation_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO program_organisations (program_id, organisation_id)
             VALUES (?1, ?2)",
            params![program_id, organisation_id],
        )?;
        Ok(())
    }

    pub fn program(&self, id: i64) -> Result<Option<Program>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, description FROM programs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Program {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn programs(&self) -> Result<Vec<Program>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description FROM programs ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Program {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Id of the user with this username, creating the row if needed.
    pub fn user_id_for(&self, username: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (username) VALUES (?1)",
            params![username],
        )?;
        Ok(self.conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?)
    }

    /// Insert a pattern. Callers holding a `PatternMatcher` should go through
    /// `PatternMatcher::create_pattern` so its cache is invalidated.
    pub fn insert_pattern(&self, url: &str, collection_id: Option<i64>) -> Result<UrlPattern> {
        self.conn.execute(
            "INSERT INTO url_patterns (url, collection_id) VALUES (?1, ?2)",
            params![url, collection_id],
        )?;
        Ok(UrlPattern {
            id: self.conn.last_insert_rowid(),
            url: url.to_string(),
            collection_id,
        })
    }

    pub fn save_pattern(&self, pattern: &UrlPattern) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE url_patterns SET url = ?2, collection_id = ?3 WHERE id = ?1",
            params![pattern.id, pattern.url, pattern.collection_id],
        )?;
        if changed == 0 {
            return Err(AppError::not_found("URL pattern", pattern.id));
        }
        Ok(())
    }

    pub fn url_patterns(&self) -> Result<Vec<UrlPattern>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, url, collection_id FROM url_patterns ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(UrlPattern {
                id: row.get(0)?,
                url: row.get(1)?,
                collection_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn pattern_exists(&self, id: i64) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM url_patterns WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organisation_collections_skip_orphans() {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organisation("ACME Org").unwrap();
        let owned = db.create_collection("ACME", Some(org.id)).unwrap();
        db.create_collection("Orphan", None).unwrap();

        let collections = db.organisation_collections().unwrap();
        assert_eq!(collections, vec![owned]);
    }

    #[test]
    fn test_user_id_for_is_stable() {
        let db = Database::open_in_memory().unwrap();
        let first = db.user_id_for("Jim").unwrap();
        let second = db.user_id_for("Jim").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, db.user_id_for("Bob").unwrap());
    }

    #[test]
    fn test_save_missing_pattern_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let pattern = UrlPattern {
            id: 99,
            url: "gale.com".to_string(),
            collection_id: None,
        };
        assert!(matches!(
            db.save_pattern(&pattern),
            Err(AppError::NotFound { .. })
        ));
    }
}

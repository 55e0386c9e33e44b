//! Row-level access to the aggregate tables.
//!
//! Table and column names are interpolated into SQL; they always come from
//! the static granularity descriptors, never from user input.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};

use super::Database;
use crate::error::Result;
use crate::utils::time;

/// Columns every aggregate table carries besides its scope and entity key.
const FIXED_COLUMNS: &[&str] = &[
    "id",
    "full_date",
    "day",
    "month",
    "year",
    "on_user_list",
    "total_links_added",
    "total_links_removed",
    "created_at",
    "updated_at",
];

/// Full identity of an aggregate row: scope, entity key, day and user-list flag.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateKey {
    pub scope: Vec<(&'static str, i64)>,
    pub keys: Vec<(&'static str, Value)>,
    pub full_date: NaiveDate,
    pub on_user_list: bool,
}

impl AggregateKey {
    fn columns(&self) -> Vec<&'static str> {
        self.scope
            .iter()
            .map(|(col, _)| *col)
            .chain(self.keys.iter().map(|(col, _)| *col))
            .chain(["full_date", "on_user_list"])
            .collect()
    }

    fn values(&self) -> Vec<Value> {
        self.scope
            .iter()
            .map(|(_, id)| Value::Integer(*id))
            .chain(self.keys.iter().map(|(_, v)| v.clone()))
            .chain([
                Value::Text(time::format_date(self.full_date)),
                Value::Integer(self.on_user_list as i64),
            ])
            .collect()
    }

    fn where_clause(&self) -> String {
        self.columns()
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ?{}", col, i + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateCounts {
    pub added: u32,
    pub removed: u32,
}

/// A stored aggregate row, with its scope and key columns by name.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub id: i64,
    pub full_date: NaiveDate,
    pub on_user_list: bool,
    pub counts: AggregateCounts,
    pub columns: BTreeMap<String, Value>,
}

impl AggregateRow {
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.columns.get(column) {
            Some(Value::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(Value::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl Database {
    /// Latest `full_date` in `table`, optionally restricted to one scope id.
    pub fn high_water_mark(
        &self,
        table: &str,
        scope: Option<(&str, i64)>,
    ) -> Result<Option<NaiveDate>> {
        let latest: Option<String> = match scope {
            Some((column, id)) => self.conn.query_row(
                &format!("SELECT MAX(full_date) FROM {table} WHERE {column} = ?1"),
                params![id],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                &format!("SELECT MAX(full_date) FROM {table}"),
                [],
                |row| row.get(0),
            )?,
        };
        latest.as_deref().map(time::parse_date).transpose()
    }

    /// Id and counts of the row with exactly this key, if any.
    pub fn find_aggregate(
        &self,
        table: &str,
        key: &AggregateKey,
    ) -> Result<Option<(i64, AggregateCounts)>> {
        let sql = format!(
            "SELECT id, total_links_added, total_links_removed FROM {table} WHERE {}",
            key.where_clause()
        );
        Ok(self
            .conn
            .query_row(&sql, params_from_iter(key.values()), |row| {
                Ok((
                    row.get(0)?,
                    AggregateCounts {
                        added: row.get(1)?,
                        removed: row.get(2)?,
                    },
                ))
            })
            .optional()?)
    }

    pub fn update_aggregate_counts(
        &self,
        table: &str,
        id: i64,
        counts: AggregateCounts,
    ) -> Result<()> {
        self.conn.execute(
            &format!(
                "UPDATE {table}
                 SET total_links_added = ?2, total_links_removed = ?3, updated_at = ?4
                 WHERE id = ?1"
            ),
            params![
                id,
                counts.added,
                counts.removed,
                time::format_timestamp(&Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Insert a new row in its own transaction.
    ///
    /// A concurrent writer may have created the same key first; the unique
    /// index then rejects the insert and the error is returned to the caller.
    pub fn insert_aggregate(
        &self,
        table: &str,
        key: &AggregateKey,
        counts: AggregateCounts,
    ) -> Result<i64> {
        let mut columns = key.columns();
        columns.extend([
            "day",
            "month",
            "year",
            "total_links_added",
            "total_links_removed",
            "created_at",
            "updated_at",
        ]);

        let now = time::format_timestamp(&Utc::now());
        let mut values = key.values();
        values.extend([
            Value::Integer(key.full_date.day() as i64),
            Value::Integer(key.full_date.month() as i64),
            Value::Integer(key.full_date.year() as i64),
            Value::Integer(counts.added as i64),
            Value::Integer(counts.removed as i64),
            Value::Text(now.clone()),
            Value::Text(now),
        ]);

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(&sql, params_from_iter(values))?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Every row of an aggregate table, ordered by day then id.
    pub fn aggregate_rows(&self, table: &str) -> Result<Vec<AggregateRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {table} ORDER BY full_date, id"))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let rows = stmt.query_map([], |row| {
            let full_date: String = row.get("full_date")?;
            let mut columns = BTreeMap::new();
            for (idx, name) in names.iter().enumerate() {
                if !FIXED_COLUMNS.contains(&name.as_str()) {
                    columns.insert(name.clone(), row.get::<_, Value>(idx)?);
                }
            }
            Ok((
                AggregateRow {
                    id: row.get("id")?,
                    full_date: NaiveDate::MIN,
                    on_user_list: row.get("on_user_list")?,
                    counts: AggregateCounts {
                        added: row.get("total_links_added")?,
                        removed: row.get("total_links_removed")?,
                    },
                    columns,
                },
                full_date,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (mut aggregate, full_date) = row?;
            aggregate.full_date = time::parse_date(&full_date)?;
            result.push(aggregate);
        }
        Ok(result)
    }
}

//! Raw link event storage: ingestion writes, archive reads and deletes.

use chrono::NaiveDate;
use rusqlite::{OptionalExtension, Row, params};

use super::Database;
use crate::error::{AppError, Result};
use crate::models::{ChangeKind, LinkEvent, NewLinkEvent};
use crate::utils::time;

const EVENT_COLUMNS: &str = "e.id, e.link, e.timestamp, e.domain, u.username, e.user_id,
    e.rev_id, e.page_title, e.page_namespace, e.event_id, e.user_is_bot,
    e.hash_link_event_id, e.change, e.on_user_list,
    (SELECT group_concat(url_pattern_id) FROM link_event_urls WHERE link_event_id = e.id)";

/// Outcome of restoring a batch of archived events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    /// Events whose id was already present
    pub skipped: usize,
}

fn conversion_error(idx: usize, err: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<LinkEvent> {
    let timestamp: String = row.get(2)?;
    let change: i64 = row.get(12)?;
    let patterns: Option<String> = row.get(14)?;

    let mut url_patterns = patterns
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| conversion_error(14, AppError::validation(e.to_string())))
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;
    url_patterns.sort_unstable();

    Ok(LinkEvent {
        id: row.get(0)?,
        link: row.get(1)?,
        timestamp: time::parse_timestamp(&timestamp).map_err(|e| conversion_error(2, e))?,
        domain: row.get(3)?,
        username: row.get(4)?,
        user_id: row.get(5)?,
        rev_id: row.get(6)?,
        page_title: row.get(7)?,
        page_namespace: row.get(8)?,
        event_id: row.get(9)?,
        user_is_bot: row.get(10)?,
        hash_link_event_id: row.get(11)?,
        change: ChangeKind::from_db(change).ok_or_else(|| {
            conversion_error(12, AppError::validation(format!("unknown change {change}")))
        })?,
        on_user_list: row.get(13)?,
        url_patterns,
    })
}

impl Database {
    /// Store a new event tagged with the given pattern ids.
    ///
    /// Called by the ingestion collaborator after running the matcher.
    pub fn insert_event(&self, event: &NewLinkEvent, pattern_ids: &[i64]) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let username_id = match &event.username {
            Some(name) => Some(self.user_id_for(name)?),
            None => None,
        };

        tx.execute(
            "INSERT INTO link_events (link, timestamp, domain, username_id, user_id, rev_id,
                 page_title, page_namespace, event_id, user_is_bot, hash_link_event_id,
                 change, on_user_list)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.link,
                time::format_timestamp(&event.timestamp),
                event.domain,
                username_id,
                event.user_id,
                event.rev_id,
                event.page_title,
                event.page_namespace,
                event.event_id,
                event.user_is_bot,
                event.hash(),
                event.change.as_db(),
                event.on_user_list,
            ],
        )?;
        let id = tx.last_insert_rowid();

        for pattern_id in pattern_ids {
            tx.execute(
                "INSERT OR IGNORE INTO link_event_urls (link_event_id, url_pattern_id)
                 VALUES (?1, ?2)",
                params![id, pattern_id],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Put archived events back with their original ids and associations.
    ///
    /// Runs in one transaction: either every event of the batch is restored
    /// (or skipped as already present) or none is.
    pub fn restore_events(&self, events: &[LinkEvent]) -> Result<RestoreSummary> {
        let tx = self.conn.unchecked_transaction()?;
        let mut summary = RestoreSummary::default();

        for event in events {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM link_events WHERE id = ?1",
                    params![event.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                summary.skipped += 1;
                continue;
            }

            for pattern_id in &event.url_patterns {
                if !self.pattern_exists(*pattern_id)? {
                    return Err(AppError::validation(format!(
                        "link event {} references missing URL pattern {}",
                        event.id, pattern_id
                    )));
                }
            }

            let username_id = match &event.username {
                Some(name) => Some(self.user_id_for(name)?),
                None => None,
            };

            tx.execute(
                "INSERT INTO link_events (id, link, timestamp, domain, username_id, user_id,
                     rev_id, page_title, page_namespace, event_id, user_is_bot,
                     hash_link_event_id, change, on_user_list)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    event.id,
                    event.link,
                    time::format_timestamp(&event.timestamp),
                    event.domain,
                    username_id,
                    event.user_id,
                    event.rev_id,
                    event.page_title,
                    event.page_namespace,
                    event.event_id,
                    event.user_is_bot,
                    event.hash_link_event_id,
                    event.change.as_db(),
                    event.on_user_list,
                ],
            )?;
            for pattern_id in &event.url_patterns {
                tx.execute(
                    "INSERT INTO link_event_urls (link_event_id, url_pattern_id) VALUES (?1, ?2)",
                    params![event.id, pattern_id],
                )?;
            }
            summary.restored += 1;
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Every stored event in id order.
    pub fn events(&self) -> Result<Vec<LinkEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM link_events e
             LEFT JOIN users u ON u.id = e.username_id
             ORDER BY e.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_event)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM link_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Highest event id currently stored, or 0 for an empty table.
    pub fn max_event_id(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM link_events",
            [],
            |row| row.get(0),
        )?)
    }

    /// Day of the oldest event with id at or below `max_id`.
    pub fn earliest_event_date(&self, max_id: i64) -> Result<Option<NaiveDate>> {
        let earliest: Option<String> = self.conn.query_row(
            "SELECT MIN(substr(timestamp, 1, 10)) FROM link_events WHERE id <= ?1",
            params![max_id],
            |row| row.get(0),
        )?;
        earliest.as_deref().map(time::parse_date).transpose()
    }

    /// One page of a day's events in id order, starting after `after_id`.
    pub fn events_for_day(
        &self,
        day: NaiveDate,
        after_id: i64,
        max_id: i64,
        limit: usize,
    ) -> Result<Vec<LinkEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM link_events e
             LEFT JOIN users u ON u.id = e.username_id
             WHERE e.timestamp >= ?1 AND e.timestamp < ?2
               AND e.id > ?3 AND e.id <= ?4
             ORDER BY e.id
             LIMIT ?5"
        );
        let next_day = day
            .succ_opt()
            .ok_or_else(|| AppError::validation(format!("no day after {day}")))?;

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                time::day_start(day),
                time::day_start(next_day),
                after_id,
                max_id,
                limit as i64
            ],
            row_to_event,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete events before `boundary` with id at or below `max_id`, one
    /// batch of primary keys at a time. Returns the number deleted.
    pub fn delete_events_before(
        &self,
        boundary: NaiveDate,
        max_id: i64,
        batch_size: usize,
    ) -> Result<usize> {
        let cutoff = time::day_start(boundary);
        let mut total = 0;

        loop {
            let deleted = self.conn.execute(
                "DELETE FROM link_events WHERE id IN (
                     SELECT id FROM link_events
                     WHERE timestamp < ?1 AND id <= ?2
                     LIMIT ?3
                 )",
                params![cutoff, max_id, batch_size as i64],
            )?;
            if deleted == 0 {
                break;
            }
            total += deleted;
            log::debug!("Deleted batch of {} link events before {}", deleted, cutoff);
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn new_event(link: &str, at: (i32, u32, u32, u32), change: ChangeKind) -> NewLinkEvent {
        NewLinkEvent {
            link: link.to_string(),
            timestamp: Utc.with_ymd_and_hms(at.0, at.1, at.2, at.3, 0, 0).unwrap(),
            domain: "en.wikipedia.org".to_string(),
            username: Some("Jim".to_string()),
            user_id: Some(7),
            rev_id: Some(974060045),
            page_title: "Page1".to_string(),
            page_namespace: 0,
            event_id: "4100e9a8-af77-405f-ab13-ec0957a7c24c".to_string(),
            user_is_bot: false,
            change,
            on_user_list: false,
        }
    }

    #[test]
    fn test_insert_event_stores_hash_and_patterns() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_pattern("jstor.org", None).unwrap();
        let b = db.insert_pattern("www.jstor.org", None).unwrap();
        let event = new_event("https://www.jstor.org/x", (2020, 8, 20, 21), ChangeKind::Added);

        db.insert_event(&event, &[b.id, a.id]).unwrap();

        let stored = db.events().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].hash_link_event_id, event.hash());
        assert_eq!(stored[0].url_patterns, vec![a.id, b.id]);
        assert_eq!(stored[0].username.as_deref(), Some("Jim"));
        assert_eq!(stored[0].timestamp, event.timestamp);
    }

    #[test]
    fn test_events_for_day_pages_by_id() {
        let db = Database::open_in_memory().unwrap();
        for hour in 0..5 {
            db.insert_event(&new_event("https://a.org", (2020, 1, 1, hour), ChangeKind::Added), &[])
                .unwrap();
        }
        db.insert_event(&new_event("https://a.org", (2020, 1, 2, 0), ChangeKind::Added), &[])
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let max_id = db.max_event_id().unwrap();

        let first = db.events_for_day(day, 0, max_id, 3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = db.events_for_day(day, first[2].id, max_id, 3).unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_delete_events_before_respects_boundary_and_snapshot() {
        let db = Database::open_in_memory().unwrap();
        let p = db.insert_pattern("a.org", None).unwrap();
        for day in 1..=4 {
            db.insert_event(&new_event("https://a.org", (2020, 1, day, 12), ChangeKind::Removed), &[p.id])
                .unwrap();
        }
        let snapshot = db.max_event_id().unwrap();
        // Arrives after the snapshot; must survive even though it is old
        db.insert_event(&new_event("https://a.org", (2020, 1, 1, 13), ChangeKind::Added), &[p.id])
            .unwrap();

        let boundary = NaiveDate::from_ymd_opt(2020, 1, 3).unwrap();
        let deleted = db.delete_events_before(boundary, snapshot, 1).unwrap();

        assert_eq!(deleted, 2);
        let left: Vec<_> = db.events().unwrap().into_iter().map(|e| e.timestamp).collect();
        assert_eq!(left.len(), 3);
        assert!(left.contains(&Utc.with_ymd_and_hms(2020, 1, 1, 13, 0, 0).unwrap()));
        let links: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM link_event_urls", [], |row| row.get(0))
            .unwrap();
        assert_eq!(links, 3);
    }

    #[test]
    fn test_restore_skips_existing_ids() {
        let db = Database::open_in_memory().unwrap();
        db.insert_event(&new_event("https://a.org", (2020, 1, 1, 1), ChangeKind::Added), &[])
            .unwrap();
        let events = db.events().unwrap();

        let summary = db.restore_events(&events).unwrap();
        assert_eq!(summary, RestoreSummary { restored: 0, skipped: 1 });
    }

    #[test]
    fn test_restore_rejects_missing_pattern() {
        let db = Database::open_in_memory().unwrap();
        let p = db.insert_pattern("a.org", None).unwrap();
        db.insert_event(&new_event("https://a.org", (2020, 1, 1, 1), ChangeKind::Added), &[p.id])
            .unwrap();
        let mut events = db.events().unwrap();
        events[0].id = 500;
        events[0].url_patterns = vec![p.id + 1];

        assert!(db.restore_events(&events).is_err());
        assert_eq!(db.event_count().unwrap(), 1);
    }
}

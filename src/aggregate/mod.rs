//! Incremental daily folds of link events into the aggregate tables.
//!
//! Every output table is produced by the same [`AggregationJob`], configured
//! with a [`Granularity`]. A run resumes from the table's high-water-mark:
//! the latest aggregated day is recomputed in full and overwritten, earlier
//! days are never read again, and today is never aggregated from scratch.
//!
//! Rows are upserted one group at a time. Two jobs racing on the same key are
//! resolved by the unique index: the loser re-reads the winner's row and
//! reconciles its counts.

pub mod granularity;

use std::ops::AddAssign;

use chrono::NaiveDate;
use rusqlite::params_from_iter;
use rusqlite::types::Value;

use crate::db::{AggregateCounts, AggregateKey, Database};
use crate::error::{AppError, Result};
use crate::utils::time;

pub use granularity::{
    ARCHIVE_GATES, COLLECTION_FOLDS, Granularity, KeyColumn, LINK, PAGE, PAGE_PROJECT,
    PROGRAM_FOLDS, PROGRAM_TOP_ORGANISATIONS, PROGRAM_TOP_PROJECTS, PROGRAM_TOP_USERS, PROJECT,
    ScopeKind, Source, USER,
};

/// A single collection or program an aggregate row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Collection {
        organisation_id: i64,
        collection_id: i64,
    },
    Program {
        program_id: i64,
    },
}

impl Scope {
    /// Id the fold query filters on.
    fn id(&self) -> i64 {
        match self {
            Scope::Collection { collection_id, .. } => *collection_id,
            Scope::Program { program_id } => *program_id,
        }
    }

    /// Column and value used to scope the high-water-mark.
    fn filter(&self) -> (&'static str, i64) {
        match self {
            Scope::Collection { collection_id, .. } => ("collection_id", *collection_id),
            Scope::Program { program_id } => ("program_id", *program_id),
        }
    }

    fn columns(&self) -> Vec<(&'static str, i64)> {
        match self {
            Scope::Collection {
                organisation_id,
                collection_id,
            } => vec![
                ("organisation_id", *organisation_id),
                ("collection_id", *collection_id),
            ],
            Scope::Program { program_id } => vec![("program_id", *program_id)],
        }
    }
}

/// Range of days a fold reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// From the start of the high-water-mark day up to the start of today,
    /// both inclusive.
    Resume { from: NaiveDate, through: NaiveDate },
    /// Everything before the start of today.
    Backfill { before: NaiveDate },
}

impl Window {
    pub fn new(high_water_mark: Option<NaiveDate>, today: NaiveDate) -> Self {
        match high_water_mark {
            Some(from) => Window::Resume {
                from,
                through: today,
            },
            None => Window::Backfill { before: today },
        }
    }

    /// SQL condition on `column` and its parameters. `bound` renders a day
    /// the way `column` stores it.
    fn condition(&self, column: &str, bound: fn(NaiveDate) -> String) -> (String, Vec<Value>) {
        match self {
            Window::Resume { from, through } => (
                format!("{column} >= ? AND {column} <= ?"),
                vec![Value::Text(bound(*from)), Value::Text(bound(*through))],
            ),
            Window::Backfill { before } => (
                format!("{column} < ?"),
                vec![Value::Text(bound(*before))],
            ),
        }
    }
}

/// Counters for one fold run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldSummary {
    pub scopes: usize,
    pub groups: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Inserts that lost a race with a concurrent job
    pub duplicates: usize,
}

impl FoldSummary {
    /// Rows for a summary log block.
    pub fn items(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Scopes", self.scopes.to_string()),
            ("Groups", self.groups.to_string()),
            ("Inserted", self.inserted.to_string()),
            ("Updated", self.updated.to_string()),
            ("Unchanged", self.unchanged.to_string()),
            ("Duplicates", self.duplicates.to_string()),
        ]
    }
}

impl AddAssign for FoldSummary {
    fn add_assign(&mut self, other: Self) {
        self.scopes += other.scopes;
        self.groups += other.groups;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.duplicates += other.duplicates;
    }
}

/// One (entity key, day, user-list flag) group with its counts.
#[derive(Debug)]
struct Group {
    keys: Vec<Value>,
    full_date: NaiveDate,
    on_user_list: bool,
    counts: AggregateCounts,
}

/// Fold of one granularity against the database.
pub struct AggregationJob<'a> {
    db: &'a Database,
    granularity: Granularity,
    today: NaiveDate,
}

impl<'a> AggregationJob<'a> {
    pub fn new(db: &'a Database, granularity: Granularity) -> Self {
        Self {
            db,
            granularity,
            today: time::today(),
        }
    }

    /// Pin "today" instead of reading the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Run the fold for the given collection or program ids, or for all of
    /// them when `scope_ids` is `None`.
    ///
    /// Unknown ids fail the run before anything is written.
    pub fn run(&self, scope_ids: Option<&[i64]>) -> Result<FoldSummary> {
        let table = self.granularity.table;
        let scopes = self.resolve_scopes(scope_ids)?;

        // An unscoped run resumes every scope from the same table-wide mark
        let global_mark = match scope_ids {
            Some(_) => None,
            None => self.db.high_water_mark(table, None)?,
        };

        let mut summary = FoldSummary::default();
        for scope in &scopes {
            let mark = match scope_ids {
                Some(_) => self.db.high_water_mark(table, Some(scope.filter()))?,
                None => global_mark,
            };
            let window = Window::new(mark, self.today);
            log::debug!(
                "Folding {} aggregates for {:?} over {:?}",
                self.granularity.name,
                scope,
                window
            );

            for group in self.groups(scope, window)? {
                summary.groups += 1;
                let key = AggregateKey {
                    scope: scope.columns(),
                    keys: self
                        .granularity
                        .keys
                        .iter()
                        .map(|k| k.column)
                        .zip(group.keys)
                        .collect(),
                    full_date: group.full_date,
                    on_user_list: group.on_user_list,
                };
                self.upsert(&key, group.counts, &mut summary)?;
            }
            summary.scopes += 1;
        }

        Ok(summary)
    }

    fn resolve_scopes(&self, scope_ids: Option<&[i64]>) -> Result<Vec<Scope>> {
        match (self.granularity.scope, scope_ids) {
            (ScopeKind::Collection, None) => Ok(self
                .db
                .organisation_collections()?
                .into_iter()
                .filter_map(|c| {
                    c.organisation_id.map(|organisation_id| Scope::Collection {
                        organisation_id,
                        collection_id: c.id,
                    })
                })
                .collect()),
            (ScopeKind::Collection, Some(ids)) => ids
                .iter()
                .map(|&id| {
                    let collection = self
                        .db
                        .collection(id)?
                        .ok_or_else(|| AppError::not_found("Collection", id))?;
                    let organisation_id = collection
                        .organisation_id
                        .ok_or_else(|| AppError::not_found("Organisation of collection", id))?;
                    Ok(Scope::Collection {
                        organisation_id,
                        collection_id: id,
                    })
                })
                .collect(),
            (ScopeKind::Program, None) => Ok(self
                .db
                .programs()?
                .into_iter()
                .map(|p| Scope::Program { program_id: p.id })
                .collect()),
            (ScopeKind::Program, Some(ids)) => ids
                .iter()
                .map(|&id| {
                    self.db
                        .program(id)?
                        .ok_or_else(|| AppError::not_found("Program", id))?;
                    Ok(Scope::Program { program_id: id })
                })
                .collect(),
        }
    }

    fn fold_query(&self, scope: &Scope, window: Window) -> (String, Vec<Value>) {
        let keys: String = self
            .granularity
            .keys
            .iter()
            .map(|k| format!("{}, ", k.source))
            .collect();
        let mut params = vec![Value::Integer(scope.id())];

        let sql = match self.granularity.source {
            Source::Events { require } => {
                let (bounds, bound_params) = window.condition("e.timestamp", time::day_start);
                params.extend(bound_params);
                let require = require.map(|r| format!(" AND {r}")).unwrap_or_default();
                format!(
                    "SELECT {keys}substr(e.timestamp, 1, 10) AS event_date, e.on_user_list,
                            COUNT(DISTINCT CASE WHEN e.change = 1 THEN e.id END),
                            COUNT(DISTINCT CASE WHEN e.change = 0 THEN e.id END)
                     FROM link_events e
                     JOIN link_event_urls leu ON leu.link_event_id = e.id
                     JOIN url_patterns p ON p.id = leu.url_pattern_id
                     LEFT JOIN users u ON u.id = e.username_id
                     WHERE p.collection_id = ? AND {bounds}{require}
                     GROUP BY {keys}event_date, e.on_user_list
                     ORDER BY event_date"
                )
            }
            Source::Aggregates { table } => {
                let (bounds, bound_params) = window.condition("a.full_date", time::format_date);
                params.extend(bound_params);
                format!(
                    "SELECT {keys}a.full_date, a.on_user_list,
                            SUM(a.total_links_added), SUM(a.total_links_removed)
                     FROM {table} a
                     JOIN program_organisations po ON po.organisation_id = a.organisation_id
                     WHERE po.program_id = ? AND {bounds}
                     GROUP BY {keys}a.full_date, a.on_user_list
                     ORDER BY a.full_date"
                )
            }
        };
        (sql, params)
    }

    fn groups(&self, scope: &Scope, window: Window) -> Result<Vec<Group>> {
        let (sql, params) = self.fold_query(scope, window);
        let key_count = self.granularity.keys.len();

        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            let keys = (0..key_count)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let full_date: String = row.get(key_count)?;
            Ok((
                keys,
                full_date,
                row.get::<_, bool>(key_count + 1)?,
                AggregateCounts {
                    added: row.get(key_count + 2)?,
                    removed: row.get(key_count + 3)?,
                },
            ))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (keys, full_date, on_user_list, counts) = row?;
            groups.push(Group {
                keys,
                full_date: time::parse_date(&full_date)?,
                on_user_list,
                counts,
            });
        }
        Ok(groups)
    }

    fn upsert(
        &self,
        key: &AggregateKey,
        counts: AggregateCounts,
        summary: &mut FoldSummary,
    ) -> Result<()> {
        match self.db.find_aggregate(self.granularity.table, key)? {
            Some((id, existing)) => self.reconcile(id, existing, counts, summary),
            None => self.insert_or_reconcile(key, counts, summary),
        }
    }

    fn reconcile(
        &self,
        id: i64,
        existing: AggregateCounts,
        counts: AggregateCounts,
        summary: &mut FoldSummary,
    ) -> Result<()> {
        if existing == counts {
            summary.unchanged += 1;
        } else {
            self.db
                .update_aggregate_counts(self.granularity.table, id, counts)?;
            summary.updated += 1;
        }
        Ok(())
    }

    fn insert_or_reconcile(
        &self,
        key: &AggregateKey,
        counts: AggregateCounts,
        summary: &mut FoldSummary,
    ) -> Result<()> {
        let table = self.granularity.table;
        match self.db.insert_aggregate(table, key, counts) {
            Ok(_) => {
                summary.inserted += 1;
                Ok(())
            }
            Err(err) if err.is_unique_violation() => {
                log::warn!(
                    "Concurrent insert of {} aggregate for {:?} on {}; reconciling",
                    self.granularity.name,
                    key.scope,
                    key.full_date
                );
                summary.duplicates += 1;
                match self.db.find_aggregate(table, key)? {
                    Some((id, existing)) if existing != counts => {
                        self.db.update_aggregate_counts(table, id, counts)
                    }
                    _ => Ok(()),
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AggregateRow;
    use crate::models::{ChangeKind, NewLinkEvent};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        db: Database,
        org: i64,
        collection: i64,
        pattern: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let org = db.create_organisation("ACME Org").unwrap();
        let collection = db.create_collection("ACME", Some(org.id)).unwrap();
        let pattern = db.insert_pattern("test.com", Some(collection.id)).unwrap();
        Fixture {
            db,
            org: org.id,
            collection: collection.id,
            pattern: pattern.id,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(day: NaiveDate, hour: u32, change: ChangeKind) -> NewLinkEvent {
        NewLinkEvent {
            link: "https://www.test.com/".to_string(),
            timestamp: Utc
                .from_utc_datetime(&day.and_hms_opt(hour, 0, 0).unwrap()),
            domain: "en.wikipedia.org".to_string(),
            username: Some("Jim".to_string()),
            user_id: Some(1),
            rev_id: Some(10),
            page_title: "Page1".to_string(),
            page_namespace: 0,
            event_id: format!("{day}-{hour}"),
            user_is_bot: false,
            change,
            on_user_list: false,
        }
    }

    fn add(db: &Database, event: &NewLinkEvent, patterns: &[i64]) {
        db.insert_event(event, patterns).unwrap();
    }

    fn rows(db: &Database, granularity: Granularity) -> Vec<AggregateRow> {
        db.aggregate_rows(granularity.table).unwrap()
    }

    fn run(db: &Database, granularity: Granularity, today: NaiveDate) -> FoldSummary {
        AggregationJob::new(db, granularity)
            .with_today(today)
            .run(None)
            .unwrap()
    }

    /// Three events on 2020-01-01 (two added, one removed) and five added on 2020-09-10.
    fn seed_scenario(f: &Fixture) {
        let jan = date(2020, 1, 1);
        add(&f.db, &event(jan, 1, ChangeKind::Added), &[f.pattern]);
        add(&f.db, &event(jan, 2, ChangeKind::Added), &[f.pattern]);
        add(&f.db, &event(jan, 3, ChangeKind::Removed), &[f.pattern]);
        for hour in 0..5 {
            add(&f.db, &event(date(2020, 9, 10), hour, ChangeKind::Added), &[f.pattern]);
        }
    }

    #[test]
    fn test_link_scenario_and_late_event() {
        let f = fixture();
        seed_scenario(&f);
        let today = date(2020, 9, 11);

        let summary = run(&f.db, LINK, today);
        assert_eq!(summary.inserted, 2);

        let first = rows(&f.db, LINK);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].full_date, date(2020, 1, 1));
        assert_eq!(first[0].counts, AggregateCounts { added: 2, removed: 1 });
        assert_eq!(first[0].int("organisation_id"), Some(f.org));
        assert_eq!(first[1].counts, AggregateCounts { added: 5, removed: 0 });

        add(&f.db, &event(date(2020, 9, 10), 20, ChangeKind::Added), &[f.pattern]);
        let summary = run(&f.db, LINK, today);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.inserted, 0);

        let second = rows(&f.db, LINK);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], first[0]);
        assert_eq!(second[1].id, first[1].id);
        assert_eq!(second[1].counts.added, 6);
    }

    #[test]
    fn test_rerun_without_new_events_is_idempotent() {
        let f = fixture();
        seed_scenario(&f);
        let today = date(2020, 9, 11);

        for granularity in COLLECTION_FOLDS {
            run(&f.db, granularity, today);
            let before = rows(&f.db, granularity);
            let summary = run(&f.db, granularity, today);
            assert_eq!(summary.inserted + summary.updated, 0, "{}", granularity.name);
            assert_eq!(rows(&f.db, granularity), before, "{}", granularity.name);
        }
    }

    #[test]
    fn test_today_is_not_aggregated_from_scratch() {
        let f = fixture();
        seed_scenario(&f);

        run(&f.db, LINK, date(2020, 9, 10));

        let stored = rows(&f.db, LINK);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].full_date, date(2020, 1, 1));
    }

    #[test]
    fn test_days_before_high_water_mark_are_not_rescanned() {
        let f = fixture();
        seed_scenario(&f);
        let today = date(2020, 9, 11);
        run(&f.db, LINK, today);

        add(&f.db, &event(date(2020, 1, 1), 9, ChangeKind::Added), &[f.pattern]);
        run(&f.db, LINK, today);

        assert_eq!(rows(&f.db, LINK)[0].counts.added, 2);
    }

    #[test]
    fn test_event_matching_two_patterns_counts_once() {
        let f = fixture();
        let second = f.db.insert_pattern("www.test.com", Some(f.collection)).unwrap();
        add(
            &f.db,
            &event(date(2020, 1, 1), 1, ChangeKind::Added),
            &[f.pattern, second.id],
        );

        run(&f.db, LINK, date(2020, 1, 2));

        assert_eq!(rows(&f.db, LINK)[0].counts.added, 1);
    }

    #[test]
    fn test_keyed_folds_split_counts() {
        let f = fixture();
        let day = date(2020, 1, 1);
        add(&f.db, &event(day, 1, ChangeKind::Added), &[f.pattern]);
        let mut other_page = event(day, 2, ChangeKind::Added);
        other_page.page_title = "Page2".to_string();
        other_page.domain = "de.wikipedia.org".to_string();
        add(&f.db, &other_page, &[f.pattern]);
        let mut anonymous = event(day, 3, ChangeKind::Removed);
        anonymous.username = None;
        anonymous.user_id = None;
        add(&f.db, &anonymous, &[f.pattern]);
        let today = date(2020, 1, 2);

        for granularity in [PAGE, PROJECT, USER, PAGE_PROJECT] {
            run(&f.db, granularity, today);
        }

        let pages = rows(&f.db, PAGE);
        assert_eq!(pages.len(), 2);
        let page1 = pages.iter().find(|r| r.text("page_name") == Some("Page1")).unwrap();
        assert_eq!(page1.counts, AggregateCounts { added: 1, removed: 1 });

        let projects = rows(&f.db, PROJECT);
        let de = projects
            .iter()
            .find(|r| r.text("project_name") == Some("de.wikipedia.org"))
            .unwrap();
        assert_eq!(de.counts, AggregateCounts { added: 1, removed: 0 });

        let users = rows(&f.db, USER);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].text("username"), Some("Jim"));
        assert_eq!(users[0].counts, AggregateCounts { added: 2, removed: 0 });

        assert_eq!(rows(&f.db, PAGE_PROJECT).len(), 2);
    }

    #[test]
    fn test_on_user_list_is_part_of_the_key() {
        let f = fixture();
        let day = date(2020, 1, 1);
        add(&f.db, &event(day, 1, ChangeKind::Added), &[f.pattern]);
        let mut listed = event(day, 2, ChangeKind::Added);
        listed.on_user_list = true;
        add(&f.db, &listed, &[f.pattern]);

        run(&f.db, LINK, date(2020, 1, 2));

        let stored = rows(&f.db, LINK);
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.counts.added == 1));
    }

    #[test]
    fn test_unknown_scope_fails_before_writing() {
        let f = fixture();
        seed_scenario(&f);
        let orphan = f.db.create_collection("Orphan", None).unwrap();

        for ids in [vec![f.collection, 999], vec![orphan.id]] {
            let err = AggregationJob::new(&f.db, LINK)
                .with_today(date(2020, 9, 11))
                .run(Some(&ids))
                .unwrap_err();
            assert!(matches!(err, AppError::NotFound { .. }));
        }
        assert!(rows(&f.db, LINK).is_empty());

        let err = AggregationJob::new(&f.db, PROGRAM_TOP_USERS)
            .run(Some(&[42]))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[test]
    fn test_scoped_run_uses_scope_high_water_mark() {
        let f = fixture();
        seed_scenario(&f);
        let today = date(2020, 9, 11);
        run(&f.db, LINK, today);

        let other = f.db.create_collection("Other", Some(f.org)).unwrap();
        let pattern = f.db.insert_pattern("other.org", Some(other.id)).unwrap();
        add(&f.db, &event(date(2020, 1, 1), 5, ChangeKind::Added), &[pattern.id]);

        AggregationJob::new(&f.db, LINK)
            .with_today(today)
            .run(Some(&[other.id]))
            .unwrap();

        let backfilled: Vec<_> = rows(&f.db, LINK)
            .into_iter()
            .filter(|r| r.int("collection_id") == Some(other.id))
            .collect();
        assert_eq!(backfilled.len(), 1);
        assert_eq!(backfilled[0].full_date, date(2020, 1, 1));
    }

    #[test]
    fn test_program_folds_sum_member_organisations() {
        let f = fixture();
        let org2 = f.db.create_organisation("Other Org").unwrap();
        let coll2 = f.db.create_collection("Other", Some(org2.id)).unwrap();
        let pattern2 = f.db.insert_pattern("other.org", Some(coll2.id)).unwrap();
        let program = f.db.create_program("Libraries", None).unwrap();
        f.db.add_program_organisation(program.id, f.org).unwrap();
        f.db.add_program_organisation(program.id, org2.id).unwrap();

        let day = date(2020, 1, 1);
        add(&f.db, &event(day, 1, ChangeKind::Added), &[f.pattern]);
        add(&f.db, &event(day, 2, ChangeKind::Added), &[pattern2.id]);
        add(&f.db, &event(day, 3, ChangeKind::Removed), &[pattern2.id]);
        let today = date(2020, 1, 2);

        for granularity in COLLECTION_FOLDS.into_iter().chain(PROGRAM_FOLDS) {
            run(&f.db, granularity, today);
        }

        let users = rows(&f.db, PROGRAM_TOP_USERS);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].int("program_id"), Some(program.id));
        assert_eq!(users[0].counts, AggregateCounts { added: 2, removed: 1 });

        let projects = rows(&f.db, PROGRAM_TOP_PROJECTS);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].text("project_name"), Some("en.wikipedia.org"));

        let orgs = rows(&f.db, PROGRAM_TOP_ORGANISATIONS);
        assert_eq!(orgs.len(), 2);
        let second = orgs.iter().find(|r| r.int("organisation_id") == Some(org2.id)).unwrap();
        assert_eq!(second.counts, AggregateCounts { added: 1, removed: 1 });
    }

    #[test]
    fn test_concurrent_insert_is_reconciled() {
        let f = fixture();
        let job = AggregationJob::new(&f.db, LINK);
        let key = AggregateKey {
            scope: Scope::Collection {
                organisation_id: f.org,
                collection_id: f.collection,
            }
            .columns(),
            keys: Vec::new(),
            full_date: date(2020, 1, 1),
            on_user_list: false,
        };
        // Another job got there first with stale counts
        f.db.insert_aggregate(LINK.table, &key, AggregateCounts { added: 1, removed: 0 })
            .unwrap();

        let mut summary = FoldSummary::default();
        let counts = AggregateCounts { added: 3, removed: 0 };
        job.insert_or_reconcile(&key, counts, &mut summary).unwrap();

        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.inserted, 0);
        let stored = rows(&f.db, LINK);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].counts, counts);
    }
}

// src/pipeline/aggregate.rs

use chrono::NaiveDate;

use crate::aggregate::{AggregationJob, COLLECTION_FOLDS, FoldSummary, Granularity, PROGRAM_FOLDS};
use crate::db::Database;
use crate::error::Result;
use crate::utils::log;

/// Run one fold and report its summary.
pub fn run_aggregate(
    db: &Database,
    granularity: Granularity,
    scope_ids: Option<&[i64]>,
    today: NaiveDate,
) -> Result<FoldSummary> {
    log::header(&format!("Aggregating {} totals", granularity.name));
    if let Some(ids) = scope_ids {
        log::sub_item(&format!("Restricted to ids {:?}", ids));
    }

    let summary = AggregationJob::new(db, granularity)
        .with_today(today)
        .run(scope_ids)?;

    log::summary(&format!("{} totals", granularity.name), &summary.items());
    Ok(summary)
}

/// Run every fold: the per-collection tables first, then the program
/// tables that read them.
pub fn run_all(db: &Database, today: NaiveDate) -> Result<FoldSummary> {
    let folds: Vec<Granularity> = COLLECTION_FOLDS
        .into_iter()
        .chain(PROGRAM_FOLDS)
        .collect();
    let mut total = FoldSummary::default();

    for (index, granularity) in folds.iter().enumerate() {
        log::step(
            index + 1,
            folds.len(),
            &format!("Aggregate {} totals", granularity.name),
        );
        total += run_aggregate(db, *granularity, None, today)?;
    }

    log::summary("All aggregates", &total.items());
    Ok(total)
}

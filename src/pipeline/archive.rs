// src/pipeline/archive.rs

//! Dump, reload and upload of raw link event archives.
//!
//! A dump writes every event older than the aggregation boundary to
//! gzip-compressed JSON files, one file per day and page:
//!
//! ```text
//! {output}/links_linkevent_20200101_0.json.gz
//! {output}/links_linkevent_20200101_1.json.gz
//! {output}/links_linkevent_20200102_0.json.gz
//! ```
//!
//! Each file is uploaded to object storage as soon as it is written. Events
//! are deleted only after every file has been written to local disk.
//!
//! Records follow the Django fixture layout (`model`, `pk`, `fields`), except
//! that `fields.username` holds the username string rather than the primary
//! key of a user row. Archives are self-contained and restore into any
//! database; fixtures that key users by primary key are not accepted.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::aggregate::ARCHIVE_GATES;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{ArchiveConfig, ChangeKind, Config, LinkEvent};
use crate::storage::{self, ARCHIVE_CONTENT_TYPE, ObjectStorage, write_atomic};
use crate::utils::{log, time};

const ARCHIVE_MODEL: &str = "links.linkevent";

/// What an `archive` invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ArchiveAction {
    /// Write old events to archive files, upload them, then delete them
    Dump,
    /// Restore events from archive files
    Load,
    /// Upload existing archive files
    Upload,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Archive everything up to and including this day instead of up to the
    /// aggregation boundary
    pub date: Option<NaiveDate>,
    pub output: Option<PathBuf>,
    /// Remove local files once they are safely in object storage
    pub object_storage_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// The aggregates were not ready; nothing was done
    pub skipped: bool,
    pub boundary: Option<NaiveDate>,
    pub files: usize,
    pub events: usize,
    pub uploaded: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: usize,
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// One archived event in the serialized fixture layout.
#[derive(Debug, Serialize, Deserialize)]
struct ArchiveRecord {
    model: String,
    pk: i64,
    fields: ArchiveFields,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveFields {
    link: String,
    timestamp: DateTime<Utc>,
    domain: String,
    /// Natural key of the user row
    username: Option<String>,
    user_id: Option<u32>,
    rev_id: Option<u32>,
    page_title: String,
    page_namespace: i32,
    event_id: String,
    user_is_bot: bool,
    hash_link_event_id: String,
    change: i64,
    on_user_list: bool,
    /// URL pattern ids
    url: Vec<i64>,
}

impl From<&LinkEvent> for ArchiveRecord {
    fn from(event: &LinkEvent) -> Self {
        Self {
            model: ARCHIVE_MODEL.to_string(),
            pk: event.id,
            fields: ArchiveFields {
                link: event.link.clone(),
                timestamp: event.timestamp,
                domain: event.domain.clone(),
                username: event.username.clone(),
                user_id: event.user_id,
                rev_id: event.rev_id,
                page_title: event.page_title.clone(),
                page_namespace: event.page_namespace,
                event_id: event.event_id.clone(),
                user_is_bot: event.user_is_bot,
                hash_link_event_id: event.hash_link_event_id.clone(),
                change: event.change.as_db(),
                on_user_list: event.on_user_list,
                url: event.url_patterns.clone(),
            },
        }
    }
}

impl TryFrom<ArchiveRecord> for LinkEvent {
    type Error = AppError;

    fn try_from(record: ArchiveRecord) -> Result<Self> {
        if record.model != ARCHIVE_MODEL {
            return Err(AppError::validation(format!(
                "unexpected model '{}' for record {}",
                record.model, record.pk
            )));
        }
        let fields = record.fields;
        let change = ChangeKind::from_db(fields.change).ok_or_else(|| {
            AppError::validation(format!(
                "unknown change {} for record {}",
                fields.change, record.pk
            ))
        })?;

        Ok(LinkEvent {
            id: record.pk,
            link: fields.link,
            timestamp: fields.timestamp,
            domain: fields.domain,
            username: fields.username,
            user_id: fields.user_id,
            rev_id: fields.rev_id,
            page_title: fields.page_title,
            page_namespace: fields.page_namespace,
            event_id: fields.event_id,
            user_is_bot: fields.user_is_bot,
            hash_link_event_id: fields.hash_link_event_id,
            change,
            on_user_list: fields.on_user_list,
            url_patterns: fields.url,
        })
    }
}

/// Serialize events to a gzip-compressed JSON array.
fn encode_events(events: &[LinkEvent]) -> Result<Vec<u8>> {
    let records: Vec<ArchiveRecord> = events.iter().map(ArchiveRecord::from).collect();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, &records)?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

fn decode_events(bytes: &[u8]) -> Result<Vec<LinkEvent>> {
    let mut json = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut json)?;
    let records: Vec<ArchiveRecord> = serde_json::from_slice(&json)?;
    records.into_iter().map(LinkEvent::try_from).collect()
}

pub fn archive_file_name(day: NaiveDate, page: usize) -> String {
    format!("links_linkevent_{}_{}.json.gz", time::compact_date(day), page)
}

fn sorted(files: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = files.to_vec();
    files.sort();
    files
}

/// Archive jobs against one database and an optional storage connection.
pub struct Archiver<'a> {
    db: &'a Database,
    config: &'a ArchiveConfig,
    storage: Option<&'a dyn ObjectStorage>,
}

impl<'a> Archiver<'a> {
    pub fn new(
        db: &'a Database,
        config: &'a ArchiveConfig,
        storage: Option<&'a dyn ObjectStorage>,
    ) -> Self {
        Self {
            db,
            config,
            storage,
        }
    }

    /// Day before which every gating aggregate has been computed, or `None`
    /// while any of them is still empty.
    fn aggregation_boundary(&self) -> Result<Option<NaiveDate>> {
        let mut boundary: Option<NaiveDate> = None;
        for gate in ARCHIVE_GATES {
            match self.db.high_water_mark(gate.table, None)? {
                Some(mark) => boundary = Some(boundary.map_or(mark, |b| b.min(mark))),
                None => return Ok(None),
            }
        }
        Ok(boundary)
    }

    async fn output_dir(&self, options: &ArchiveOptions) -> Result<PathBuf> {
        if let Some(dir) = &options.output {
            match tokio::fs::metadata(dir).await {
                Ok(meta) if meta.is_dir() => return Ok(dir.clone()),
                _ => log::warn(&format!(
                    "{} is not a directory, writing to {}",
                    dir.display(),
                    self.config.output_dir.display()
                )),
            }
        }
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        Ok(self.config.output_dir.clone())
    }

    /// Archive and delete events older than the boundary.
    pub async fn dump(&self, options: &ArchiveOptions) -> Result<DumpSummary> {
        let boundary = match options.date {
            Some(date) => date
                .succ_opt()
                .ok_or_else(|| AppError::validation(format!("no day after {date}")))?,
            None => match self.aggregation_boundary()? {
                Some(boundary) => boundary,
                None => {
                    log::warn("All of the aggregate jobs have not been run yet");
                    return Ok(DumpSummary {
                        skipped: true,
                        ..DumpSummary::default()
                    });
                }
            },
        };
        let mut summary = DumpSummary {
            boundary: Some(boundary),
            ..DumpSummary::default()
        };

        // Events inserted after this point are left alone
        let max_id = self.db.max_event_id()?;
        let Some(earliest) = self.db.earliest_event_date(max_id)? else {
            log::info("No link events to archive");
            return Ok(summary);
        };
        if earliest >= boundary {
            log::info(&format!("No link events before {}", boundary));
            return Ok(summary);
        }

        let output_dir = self.output_dir(options).await?;
        log::info(&format!(
            "Archiving link events from {} to {} into {}",
            earliest,
            boundary,
            output_dir.display()
        ));

        let mut day = boundary;
        while day > earliest {
            day = day
                .pred_opt()
                .ok_or_else(|| AppError::validation(format!("no day before {day}")))?;
            self.dump_day(day, max_id, &output_dir, options, &mut summary)
                .await?;
        }

        summary.deleted = self
            .db
            .delete_events_before(boundary, max_id, self.config.chunk_size)?;
        log::info(&format!(
            "Deleted {} archived link events before {}",
            summary.deleted, boundary
        ));
        Ok(summary)
    }

    async fn dump_day(
        &self,
        day: NaiveDate,
        max_id: i64,
        output_dir: &Path,
        options: &ArchiveOptions,
        summary: &mut DumpSummary,
    ) -> Result<()> {
        let chunk_size = self.config.chunk_size;
        let mut after_id = 0;
        let mut page = 0;

        loop {
            let mut events = self
                .db
                .events_for_day(day, after_id, max_id, chunk_size + 1)?;
            if events.is_empty() {
                break;
            }
            let more = events.len() > chunk_size;
            events.truncate(chunk_size);

            let path = output_dir.join(archive_file_name(day, page));
            write_atomic(&path, &encode_events(&events)?).await?;
            log::sub_item(&format!("{} ({} events)", path.display(), events.len()));
            summary.files += 1;
            summary.events += events.len();

            if self.upload_archive(&path).await {
                summary.uploaded += 1;
                if options.object_storage_only {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log::error(&format!("Unable to remove {}: {}", path.display(), e));
                    }
                }
            }

            after_id = events.last().map_or(after_id, |e| e.id);
            page += 1;
            if !more {
                break;
            }
        }
        Ok(())
    }

    /// Restore events from archive files, one transaction per file.
    pub async fn load(&self, files: &[PathBuf]) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        if files.is_empty() {
            log::info("No link event archives specified");
            return Ok(summary);
        }

        for path in sorted(files) {
            match self.load_file(&path).await {
                Ok(restored) => {
                    log::sub_item(&format!(
                        "{}: {} restored, {} already present",
                        path.display(),
                        restored.restored,
                        restored.skipped
                    ));
                    summary.files += 1;
                    summary.restored += restored.restored;
                    summary.skipped += restored.skipped;
                }
                Err(e) => {
                    log::error(&format!("Unable to load {}: {}", path.display(), e));
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn load_file(&self, path: &Path) -> Result<crate::db::RestoreSummary> {
        let bytes = tokio::fs::read(path).await?;
        let events = decode_events(&bytes)?;
        self.db.restore_events(&events)
    }

    /// Upload existing archive files.
    pub async fn upload(&self, files: &[PathBuf]) -> Result<UploadSummary> {
        let mut summary = UploadSummary::default();
        if files.is_empty() {
            log::info("No link event archives specified");
            return Ok(summary);
        }

        for path in sorted(files) {
            let is_file = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                log::error(&format!("{} is not a file", path.display()));
                summary.skipped += 1;
                continue;
            }

            if self.upload_archive(&path).await {
                summary.uploaded += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    /// Best-effort upload of one archive file. Returns whether the file is
    /// now in object storage; failures are logged, never raised.
    pub async fn upload_archive(&self, path: &Path) -> bool {
        let Some(storage) = self.storage else {
            log::warn(&format!(
                "Object storage credentials not provided. Skipping upload of {}",
                path.display()
            ));
            return false;
        };
        let container = self.config.container.as_str();
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                log::error(&format!("{} has no file name", path.display()));
                return false;
            }
        };

        match storage.ensure_container(container).await {
            Ok(true) => log::info(&format!("Created container {}", container)),
            Ok(false) => {}
            Err(e) => {
                log::error(&format!("Unable to get container {}: {}", container, e));
                return false;
            }
        }

        match storage.exists(container, &name).await {
            Ok(true) => {
                log::info(&format!("{} already exists in {}", name, container));
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                log::error(&format!("Unable to check {} in {}: {}", name, container, e));
                return false;
            }
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error(&format!("Unable to read {}: {}", path.display(), e));
                return false;
            }
        };

        match storage
            .upload(container, &name, bytes, ARCHIVE_CONTENT_TYPE)
            .await
        {
            Ok(()) => {
                log::info(&format!("Uploaded {} to {}", name, container));
                true
            }
            Err(e) => {
                log::error(&format!("Unable to upload {}: {}", name, e));
                false
            }
        }
    }
}

/// Run one archive action with the configured storage backend.
pub async fn run_archive(
    config: &Config,
    db: &Database,
    action: ArchiveAction,
    files: &[PathBuf],
    options: &ArchiveOptions,
) -> Result<()> {
    log::header(&format!("Archive {:?}", action));

    let storage = match action {
        ArchiveAction::Load => None,
        ArchiveAction::Dump | ArchiveAction::Upload => match storage::connect(&config.storage).await {
            Ok(storage) => Some(storage),
            Err(e) => {
                log::warn(&format!("{}. Skipping upload", e));
                None
            }
        },
    };
    let archiver = Archiver::new(db, &config.archive, storage.as_deref());

    match action {
        ArchiveAction::Dump => {
            let summary = archiver.dump(options).await?;
            log::summary(
                "Archive dump",
                &[
                    ("Skipped", summary.skipped.to_string()),
                    (
                        "Boundary",
                        summary
                            .boundary
                            .map(|b| b.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                    ("Files", summary.files.to_string()),
                    ("Events", summary.events.to_string()),
                    ("Uploaded", summary.uploaded.to_string()),
                    ("Deleted", summary.deleted.to_string()),
                ],
            );
        }
        ArchiveAction::Load => {
            let summary = archiver.load(files).await?;
            log::summary(
                "Archive load",
                &[
                    ("Files", summary.files.to_string()),
                    ("Restored", summary.restored.to_string()),
                    ("Already present", summary.skipped.to_string()),
                    ("Failed", summary.failed.to_string()),
                ],
            );
            if summary.failed > 0 {
                return Err(AppError::validation(format!(
                    "{} archive files failed to load",
                    summary.failed
                )));
            }
        }
        ArchiveAction::Upload => {
            let summary = archiver.upload(files).await?;
            log::summary(
                "Archive upload",
                &[
                    ("Uploaded", summary.uploaded.to_string()),
                    ("Failed", summary.failed.to_string()),
                    ("Skipped", summary.skipped.to_string()),
                ],
            );
        }
    }
    Ok(())
}

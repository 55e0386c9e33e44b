//! Pipeline entry points for the scheduled jobs.
//!
//! - `run_aggregate` / `run_all`: fold raw events into the aggregate tables
//! - `run_archive`: dump, load or upload raw event archives

pub mod aggregate;
pub mod archive;

pub use aggregate::{run_aggregate, run_all};
pub use archive::{
    ArchiveAction, ArchiveOptions, Archiver, DumpSummary, LoadSummary, UploadSummary, run_archive,
};

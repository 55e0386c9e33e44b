//! linkstats CLI
//!
//! Entry point for the scheduled aggregation and archive jobs.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use linkstats::{
    aggregate::{self, Granularity},
    db::Database,
    error::Result,
    matcher::PatternMatcher,
    models::Config,
    pipeline::{self, ArchiveAction, ArchiveOptions},
    utils::{self, time},
};

/// linkstats - link event aggregation and archival
#[derive(Parser, Debug)]
#[command(
    name = "linkstats",
    version,
    about = "Aggregates and archives link-placement events"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "linkstats.toml")]
    config: PathBuf,

    /// SQLite database path (overrides the configuration)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only write to the operational log
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CollectionArgs {
    /// Only aggregate these collection ids
    #[arg(long, num_args = 1..)]
    collections: Vec<i64>,
}

#[derive(Args, Debug)]
struct ProgramArgs {
    /// Only aggregate these program ids
    #[arg(long, num_args = 1..)]
    programs: Vec<i64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Daily link totals per collection
    AggregateLinkTotals(CollectionArgs),

    /// Daily totals per collection and page
    AggregatePageTotals(CollectionArgs),

    /// Daily totals per collection and project
    AggregateProjectTotals(CollectionArgs),

    /// Daily totals per collection and user
    AggregateUserTotals(CollectionArgs),

    /// Daily totals per collection, page and project
    AggregatePageprojectTotals(CollectionArgs),

    /// Daily totals per program and user
    AggregateProgramTopUsers(ProgramArgs),

    /// Daily totals per program and project
    AggregateProgramTopProjects(ProgramArgs),

    /// Daily totals per program and organisation
    AggregateProgramTopOrganisations(ProgramArgs),

    /// Run every aggregation job in dependency order
    AggregateAll,

    /// Dump, load or upload raw link event archives
    Archive {
        #[arg(value_enum)]
        action: ArchiveAction,

        /// Archive files for `load` and `upload`
        files: Vec<PathBuf>,

        /// Archive events up to and including this day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Directory to write archives to
        #[arg(long)]
        output: Option<PathBuf>,

        /// Delete local archives once uploaded
        #[arg(long)]
        object_storage_only: bool,
    },

    /// Show the URL patterns a link would be tagged with
    MatchLink { link: String },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
///
/// Without `RUST_LOG` the logger accepts everything and the global max level
/// does the filtering, so `logging.level` can take effect once the config
/// is loaded.
fn init_logging(verbose: bool) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format_timestamp_secs()
        .init();
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }
}

/// Apply the configured level unless `--verbose` or `RUST_LOG` decide it.
fn apply_log_level(level: &str, verbose: bool) {
    if verbose || std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Ok(filter) = level.parse::<log::LevelFilter>() {
        log::set_max_level(filter);
    }
}

fn ids(ids: &[i64]) -> Option<&[i64]> {
    if ids.is_empty() { None } else { Some(ids) }
}

fn run_fold(db: &Database, granularity: Granularity, scope_ids: &[i64]) -> Result<()> {
    pipeline::run_aggregate(db, granularity, ids(scope_ids), time::today())?;
    Ok(())
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    utils::log::set_quiet(cli.quiet);

    let mut config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Config load failed from {}: {}", cli.config.display(), e);
            return Err(e);
        }
    };
    config.apply_env();
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }

    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {}", e);
        return Err(e);
    }
    apply_log_level(&config.logging.level, cli.verbose);

    if let Command::Validate = cli.command {
        log::info!("Config OK ({})", cli.config.display());
        return Ok(());
    }

    let db = Database::from_config(&config.database)?;
    log::debug!("Opened database {}", config.database.path.display());

    match cli.command {
        Command::AggregateLinkTotals(args) => run_fold(&db, aggregate::LINK, &args.collections)?,
        Command::AggregatePageTotals(args) => run_fold(&db, aggregate::PAGE, &args.collections)?,
        Command::AggregateProjectTotals(args) => {
            run_fold(&db, aggregate::PROJECT, &args.collections)?
        }
        Command::AggregateUserTotals(args) => run_fold(&db, aggregate::USER, &args.collections)?,
        Command::AggregatePageprojectTotals(args) => {
            run_fold(&db, aggregate::PAGE_PROJECT, &args.collections)?
        }
        Command::AggregateProgramTopUsers(args) => {
            run_fold(&db, aggregate::PROGRAM_TOP_USERS, &args.programs)?
        }
        Command::AggregateProgramTopProjects(args) => {
            run_fold(&db, aggregate::PROGRAM_TOP_PROJECTS, &args.programs)?
        }
        Command::AggregateProgramTopOrganisations(args) => {
            run_fold(&db, aggregate::PROGRAM_TOP_ORGANISATIONS, &args.programs)?
        }
        Command::AggregateAll => {
            pipeline::run_all(&db, time::today())?;
        }

        Command::Archive {
            action,
            files,
            date,
            output,
            object_storage_only,
        } => {
            let options = ArchiveOptions {
                date,
                output,
                object_storage_only,
            };
            pipeline::run_archive(&config, &db, action, &files, &options).await?;
        }

        Command::MatchLink { link } => {
            let matcher = PatternMatcher::new();
            let patterns = matcher.matches(&db, &link)?;
            if patterns.is_empty() {
                log::info!("{} is not tracked", link);
            }
            for pattern in patterns {
                println!(
                    "{}\t{}\t{}",
                    pattern.id,
                    pattern.url,
                    pattern
                        .collection_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }

        Command::Validate => {}
    }

    Ok(())
}

// src/utils/log.rs

//! Operator-facing reporting with server-style formatting.
//!
//! Every message goes to the `log` facade (the operational log) and is echoed
//! to stdout, or stderr for warnings and errors, so it shows up in cron job
//! output as well.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;

/// Suppresses the stdout/stderr echo; the `log` facade still receives everything.
static QUIET: AtomicBool = AtomicBool::new(false);

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Turn the console echo on or off.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

fn echo_enabled() -> bool {
    !QUIET.load(Ordering::Relaxed)
}

/// Format a log message with timestamp and level
fn format_log(level: LogLevel, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] [{}] {}", timestamp, level.as_str(), message)
}

fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => log::debug!("{}", message),
        LogLevel::Info => log::info!("{}", message),
        LogLevel::Warn => log::warn!("{}", message),
        LogLevel::Error => log::error!("{}", message),
    }

    if !echo_enabled() || level == LogLevel::Debug {
        return;
    }
    if level >= LogLevel::Warn {
        eprintln!("{}", format_log(level, message));
    } else {
        println!("{}", format_log(level, message));
    }
}

/// Report an info message
pub fn info(message: &str) {
    emit(LogLevel::Info, message);
}

/// Report a warning message
pub fn warn(message: &str) {
    emit(LogLevel::Warn, message);
}

/// Report an error message
pub fn error(message: &str) {
    emit(LogLevel::Error, message);
}

/// Report a step in a process
pub fn step(step_num: usize, total: usize, message: &str) {
    emit(
        LogLevel::Info,
        &format!("[STEP {}/{}] {}", step_num, total, message),
    );
}

/// Report a header
pub fn header(title: &str) {
    log::info!("{}", title);
    if echo_enabled() {
        let border = "═".repeat(60);
        println!("{}", format_log(LogLevel::Info, &border));
        println!("{}", format_log(LogLevel::Info, &format!("  {}", title)));
        println!("{}", format_log(LogLevel::Info, &border));
    }
}

/// Report a sub-item (indented)
pub fn sub_item(message: &str) {
    emit(LogLevel::Info, &format!("    {}", message));
}

/// Report a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    emit(LogLevel::Info, &format!("[SUMMARY] {}", title));
    for (key, value) in items {
        emit(LogLevel::Info, &format!("    {}: {}", key, value));
    }
}

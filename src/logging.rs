//! Logging setup for the gateway.
//!
//! Events go to the console and to a daily-rotated file under the log
//! directory. Rotated files carry a `.YYYY-MM-DD` suffix; anything older
//! than the retention window is pruned at startup.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{fmt as std_fmt, fs};

use chrono::{NaiveDate, Utc};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Args;

/// Rolled files are named `<prefix>.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "tunercast.log";

/// Keeps the non-blocking file writer flushing for the process lifetime.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Settings for [`init`], lifted from the CLI/environment surface.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub retention_days: u64,
    pub verbose: bool,
}

impl From<&Args> for LogSettings {
    fn from(args: &Args) -> Self {
        Self {
            dir: args.log_dir.clone(),
            retention_days: args.log_retention_days,
            verbose: args.verbose_logging,
        }
    }
}

/// Initialize logging. `RUST_LOG` overrides the level chosen by the
/// verbose flag. Call once, before anything logs.
pub fn init(settings: &LogSettings) -> io::Result<()> {
    fs::create_dir_all(&settings.dir)?;
    prune_rotated_logs(&settings.dir, settings.retention_days)?;

    let (file_writer, guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(&settings.dir, LOG_FILE_PREFIX),
    );
    let _ = FILE_GUARD.set(guard);

    let default_level = if settings.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Console output stays terse; the file keeps enough context to trace a
    // session across tasks.
    let console = fmt::layer()
        .compact()
        .with_timer(UtcTimer)
        .with_writer(io::stdout);
    let file = fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(UtcTimer)
        .with_writer(file_writer);

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(filter).with(console).with(file),
    )
    .map_err(io::Error::other)?;

    // Route log:: macros through tracing.
    tracing_log::LogTracer::init().map_err(io::Error::other)?;

    Ok(())
}

/// Extract the rotation date from a rolled log file name.
fn rotation_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Delete rolled log files older than the retention window. Files that are
/// not ours, or whose suffix does not parse as a date, are left alone.
fn prune_rotated_logs(dir: &Path, retention_days: u64) -> io::Result<()> {
    let cutoff = Utc::now().date_naive() - chrono::Days::new(retention_days);

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(date) = rotation_date(name) else { continue };
        if date < cutoff {
            if let Err(e) = fs::remove_file(entry.path()) {
                eprintln!("failed to prune old log file {}: {}", name, e);
            }
        }
    }

    Ok(())
}

/// UTC timestamps, millisecond precision.
#[derive(Debug, Clone, Copy)]
struct UtcTimer;

impl fmt::time::FormatTime for UtcTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std_fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_date_parsing() {
        assert_eq!(
            rotation_date("tunercast.log.2026-07-30"),
            NaiveDate::from_ymd_opt(2026, 7, 30)
        );
        assert!(rotation_date("tunercast.log").is_none());
        assert!(rotation_date("other.log.2026-07-30").is_none());
        assert!(rotation_date("tunercast.log.not-a-date").is_none());
    }

    #[test]
    fn test_prune_respects_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();

        let stale = dir.path().join("tunercast.log.2000-01-01");
        let fresh = dir.path().join(format!("tunercast.log.{today}"));
        let unrelated = dir.path().join("notes.txt");
        for path in [&stale, &fresh, &unrelated] {
            fs::write(path, b"x").unwrap();
        }

        prune_rotated_logs(dir.path(), 7).unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}

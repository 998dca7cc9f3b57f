//! Logging setup: reloadable filter, console output and a daily rolling file.
//!
//! Timestamps use the local timezone. Rolled files older than
//! [`LOG_RETENTION_DAYS`] are removed by a background task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "transcoder=info,process_utils=info";

/// Base name of the rolling log file. Rolled files get a `.YYYY-MM-DD` suffix.
pub const LOG_FILE_NAME: &str = "transcoder.log";

/// Log retention period in days.
pub const LOG_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// Current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter, e.g. `"transcoder=debug"`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::config(format!("Invalid filter directive: {e}")))?;

        self.handle
            .reload(filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {e}")))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run retention once now and then daily until `cancel` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let interval = Duration::from_secs(24 * 60 * 60);
            loop {
                match cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Cleaned up old log files"),
                    Err(e) => warn!(error = %e, "Failed to clean up old logs"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Log retention task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}

/// Delete rolled log files whose date suffix is older than `retention_days`.
///
/// Returns the number of files removed. Files not matching the rolled
/// naming scheme are never touched.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
    let prefix = format!("{LOG_FILE_NAME}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }

    Ok(deleted)
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over [`DEFAULT_LOG_FILTER`]. Keep the returned
/// guard alive for the lifetime of the process or buffered file output is lost.
pub fn init_logging(log_dir: impl AsRef<Path>) -> crate::Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_dir = log_dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, handle) = reload::Layer::new(initial);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    Ok((Arc::new(LoggingConfig { handle, log_dir }), guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("transcoder=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_rolled_files() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        let old = today - chrono::Duration::days(30);

        let fresh = dir.path().join(format!("{LOG_FILE_NAME}.{}", today.format("%Y-%m-%d")));
        let stale = dir.path().join(format!("{LOG_FILE_NAME}.{}", old.format("%Y-%m-%d")));
        let unrelated = dir.path().join("notes.2000-01-01");
        let garbage = dir.path().join(format!("{LOG_FILE_NAME}.not-a-date"));
        for path in [&fresh, &stale, &unrelated, &garbage] {
            std::fs::write(path, b"x").unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
        assert!(garbage.exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(cleanup_old_logs(&missing, 7).await.is_err());
    }
}

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Installs the global subscriber: stdout plus a per-run log file.
///
/// `RUST_LOG` wins over `level`; without either the filter is `info`.
/// Calling again after a successful init is a no-op.
pub fn init(path: &Path, level: Option<&str>) -> Result<()> {
    if LOG_PATH.get().is_some() {
        return Ok(());
    }
    let file = open_log_file(path)?;
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(false))
        .with(file_layer(file))
        .try_init()
        .context("install tracing subscriber")?;
    let _ = LOG_PATH.set(path.to_path_buf());
    Ok(())
}

pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
}

// New log file per run (truncate).
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

fn file_layer<S>(file: File) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_truncated_and_written() {
        let tmp = std::env::temp_dir().join("voicecall-rs-log-test");
        let _ = std::fs::remove_dir_all(&tmp);
        let log_path = tmp.join("logs").join("voicecall.log");
        std::fs::create_dir_all(log_path.parent().unwrap()).unwrap();
        std::fs::write(&log_path, "old\n").unwrap();

        let file = open_log_file(&log_path).unwrap();
        let subscriber = tracing_subscriber::registry().with(file_layer(file));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(room = "R1", peers = 2, "joined room");
        });

        let raw = std::fs::read_to_string(&log_path).unwrap();
        assert!(!raw.contains("old"));
        assert!(raw.contains("INFO"));
        assert!(raw.contains("joined room"));
        assert!(raw.contains("peers=2"));
        assert!(!raw.contains('\u{1b}'));
    }
}

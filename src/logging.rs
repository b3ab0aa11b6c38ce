//! Run log: console output plus one append-only file per run.
use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable overriding the log filter, e.g. `SLOW_PEPS_LOG=debug`.
pub const LOG_ENV_VAR: &str = "SLOW_PEPS_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy()
}

/// Console-only dispatch, for what happens before the run log exists.
pub fn console() -> Dispatch {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer());
    Dispatch::new(subscriber)
}

/// Subscriber for one run. Install it with [`tracing::dispatcher::set_default`] for the scope
/// of the run; the file is flushed when the `RunLog` is dropped.
pub struct RunLog {
    dispatch: Dispatch,
    path: PathBuf,
    _guard: WorkerGuard,
}

impl RunLog {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Creating log dir {}", dir.display()))?;

        let prefix = format!("slow-peps_{}", Local::now().format("%Y%m%dT%H%M%S"));
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(&prefix)
            .filename_suffix("log")
            .build(dir)
            .with_context(|| format!("Opening run log in {}", dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer())
            .with(fmt::layer().with_ansi(false).with_writer(writer));

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            path: dir.join(format!("{prefix}.log")),
            _guard: guard,
        })
    }

    pub fn dispatch(self: &Self) -> &Dispatch {
        &self.dispatch
    }

    pub fn path(self: &Self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;

    #[test]
    fn test_run_log_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::create(dir.path().join("logs")).unwrap();
        let path = log.path().to_path_buf();
        tracing::dispatcher::with_default(log.dispatch(), || {
            info!(identifier = "S1A_X", "Product saved");
        });
        drop(log);

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("slow-peps_") && name.ends_with(".log"));
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Product saved"));
        assert!(content.contains("S1A_X"));
    }
}

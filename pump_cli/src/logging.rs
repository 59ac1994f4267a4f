//! Tracing subscriber setup: console layer plus an optional JSON-lines file.
//!
//! Console filter priority: `RUST_LOG`, then `--log-level`. The file layer
//! uses `logging.level` from the config (default `info`).

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::cli::FILE_GUARD;

fn rotation(name: Option<&str>) -> eyre::Result<Rotation> {
    match name.unwrap_or("never").to_ascii_lowercase().as_str() {
        "never" => Ok(Rotation::NEVER),
        "daily" => Ok(Rotation::DAILY),
        "hourly" => Ok(Rotation::HOURLY),
        other => eyre::bail!("logging.rotation must be never|daily|hourly (got {other:?})"),
    }
}

fn console_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Call once, after the config is loaded.
pub fn init(json: bool, level: &str, cfg: &pump_config::Logging) -> eyre::Result<()> {
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter(level))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(console_filter(level))
            .boxed()
    };

    let file = match cfg.file.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file {path:?} has no file name"))?;
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(rotation(cfg.rotation.as_deref())?)
                .filename_prefix(name.to_string_lossy())
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            let filter = EnvFilter::try_new(cfg.level.as_deref().unwrap_or("info"))
                .unwrap_or_else(|_| EnvFilter::new("info"));
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| eyre::eyre!("install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, true)]
    #[case(Some("daily"), true)]
    #[case(Some("HOURLY"), true)]
    #[case(Some("weekly"), false)]
    fn rotation_names(#[case] name: Option<&str>, #[case] ok: bool) {
        assert_eq!(rotation(name).is_ok(), ok);
    }
}

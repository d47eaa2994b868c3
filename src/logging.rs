use std::{
    io::{self, IsTerminal},
    path::Path,
    time::{Duration, SystemTime},
};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::{
    cli::ColorChoice,
    config::{self, MirrorConfig, CONFIG_FILE_NAME},
};

/// Set to any value to skip the log file entirely.
pub const NO_FILE_LOG_VAR: &str = "TESTMIRROR_NO_FILE_LOG";

/// Log files older than this are deleted at startup.
const LOG_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Keeps the non-blocking file writer alive. Buffered lines are flushed when
/// this is dropped.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(
    verbosity: u8,
    color: ColorChoice,
    results_dir: Option<&Path>,
    file_log_level: Option<LevelFilter>,
    command_name: &str,
) -> LogGuard {
    let console_filter = match verbosity {
        0 => "info",
        1 => "info,libtestmirror=debug",
        2 => "info,libtestmirror=trace",
        _ => "trace",
    };

    let console_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_filter));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .without_time()
        .with_target(false)
        .with_thread_names(false)
        .with_level(true)
        .with_filter(console_env_filter);

    let mut file_guard = None;

    let file_layer = match (results_dir, file_log_level) {
        (Some(dir), Some(level)) if std::env::var_os(NO_FILE_LOG_VAR).is_none() => {
            let log_dir = dir.join(".testmirror").join("logs");

            match fs_err::create_dir_all(&log_dir) {
                Ok(()) => {
                    prune_old_logs(&log_dir, command_name, SystemTime::now());

                    let file_appender = tracing_appender::rolling::Builder::new()
                        .rotation(tracing_appender::rolling::Rotation::DAILY)
                        .filename_prefix(command_name)
                        .filename_suffix("log")
                        .build(&log_dir)
                        .expect("Failed to create rolling file appender");

                    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                    file_guard = Some(guard);

                    let layer = fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_timer(UtcTime::rfc_3339())
                        .with_target(true)
                        .with_thread_names(true)
                        .with_level(true)
                        .with_filter(EnvFilter::new(level.to_string()));

                    Some(layer)
                }
                Err(err) => {
                    eprintln!("Warning: could not create log directory: {err}");
                    None
                }
            }
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

/// Deletes `command_name` log files last modified more than a week before
/// `now`.
fn prune_old_logs(log_dir: &Path, command_name: &str, now: SystemTime) {
    let entries = match fs_err::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(command_name) && name.ends_with(".log"));

        if !is_ours {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > LOG_RETENTION);

        if expired {
            let _ = fs_err::remove_file(&path);
        }
    }
}

/// Pre-reads the file log level from a results directory's config, before
/// logging is up. Returns `None` when there is no config file or it doesn't
/// set the level (callers default to trace), and `Some(None)` when file
/// logging is turned off.
pub fn quick_read_file_log_level(dir: &Path) -> Option<Option<LevelFilter>> {
    if !dir.join(CONFIG_FILE_NAME).is_file() {
        return None;
    }

    let config = MirrorConfig::load(dir).ok()?;
    let level = config.file_log_level.as_deref()?;

    Some(config::parse_level(level))
}

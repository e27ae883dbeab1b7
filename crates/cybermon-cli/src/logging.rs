use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::Path;

use cybermon_config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for a component.
///
/// - `component_name`: used for the log file name (`<dir>/<component>.log`)
/// - `config`: level, file output and truncation settings
/// - `debug`: `-d` count from the command line, raises the default level
///
/// `RUST_LOG` takes precedence over both. Returns a guard that must be kept
/// alive for the duration of the program when file logging is enabled.
pub fn init_logging(
    component_name: &str,
    config: &LoggingConfig,
    debug: u8,
) -> io::Result<Option<WorkerGuard>> {
    let level = default_level(&config.level, debug);
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if !config.file {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        return Ok(None);
    }

    fs::create_dir_all(&config.dir)?;
    let log_path = config.dir.join(format!("{}.log", component_name));
    truncate_if_needed(&log_path, config.max_file_bytes)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(io::stderr).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!("Logging to file: {}", log_path.display());
    Ok(Some(guard))
}

/// Filter directive used when `RUST_LOG` is unset
fn default_level(configured: &str, debug: u8) -> &str {
    match debug {
        0 => configured,
        1 => "debug",
        _ => "trace",
    }
}

/// Truncate the log file if it exceeds `max_bytes`
fn truncate_if_needed(log_path: &Path, max_bytes: u64) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > max_bytes {
        File::create(log_path)?.set_len(0)?;
    }
    Ok(())
}

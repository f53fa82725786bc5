//! Logging setup.
//!
//! `tracing` with an env-filter. The MCP stdio transport reserves stdout
//! for protocol frames, so log output always goes to stderr or, when
//! `MCP_LOG_FILE` is set, to a file via a non-blocking appender.
//!
//! Environment variables:
//!
//! - `MCP_LOG_LEVEL` — filter directive (`info`, `semindex=debug`, ...).
//! - `MCP_LOG_FILE` — append logs to this file instead of stderr.
//! - `MCP_DISABLE_CONSOLE_LOGGING` — drop stderr output entirely (used by
//!   MCP hosts that capture stderr).

use tracing_subscriber::EnvFilter;

/// Guard keeping the non-blocking file writer alive; hold it for the
/// process lifetime.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. `level` (from `--log-level`) wins over
/// `MCP_LOG_LEVEL`; both default to `info`.
pub fn init(level: Option<&str>) -> LogGuard {
    let directive = level
        .map(String::from)
        .or_else(|| std::env::var("MCP_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let disable_console = std::env::var("MCP_DISABLE_CONSOLE_LOGGING")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if let Ok(path) = std::env::var("MCP_LOG_FILE") {
        let path = std::path::PathBuf::from(path);
        let directory = path.parent().unwrap_or(std::path::Path::new("."));
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "semindex.log".to_string());
        let appender = tracing_appender::rolling::never(directory, filename);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return LogGuard {
            _file_guard: Some(guard),
        };
    }

    if disable_console {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    LogGuard { _file_guard: None }
}

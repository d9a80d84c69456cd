//! Logging infrastructure - structured tracing across the boundary
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Level and filter from `OSTAR_LOG_*` variables or `[logging]` config
//! - Zero-cost when disabled
//! - Console output (plain or JSON) or a non-blocking log file

use once_cell::sync::OnceCell;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use tracing::{debug, error, info, trace, warn};

/// Global logging state; holds the file writer guard, if any
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // OSTAR_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("OSTAR_LOG_LEVEL") {
            config.level = Self::parse_level(&level_str);
        }

        // OSTAR_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("OSTAR_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("OSTAR_LOG_JSON").is_ok();
        config.show_spans = std::env::var("OSTAR_LOG_SPANS").is_ok();

        config
    }

    /// Unknown names fall back to INFO
    pub fn parse_level(name: &str) -> Level {
        match name.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Verbose config for debugging callback failures
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("ostar_ffi.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber. An already-installed global
/// subscriber (e.g. from the embedding application) is left in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("ostar_ffi={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref().filter(|_| config.file_output) {
            Some(path) => {
                let path = Path::new(path);
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                let file = path.file_name().map_or_else(|| "ostar_ffi.log".into(), |f| f.to_os_string());
                let (w, g) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
                (w, Some(g))
            }
            None => {
                let (w, g) = tracing_appender::non_blocking(std::io::stderr());
                (w, Some(g))
            }
        };

        let layer = if config.json_format {
            fmt::layer()
                .with_writer(writer)
                .json()
                .with_span_events(span_events)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        let installed = tracing_subscriber::registry()
            .with(layer)
            .with(env_filter)
            .try_init()
            .is_ok();

        installed.then_some(guard).flatten()
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Boundary-specific logging functions
// ============================================================================

/// Log a packed function call
#[inline]
pub fn log_packed_call(func: *const core::ffi::c_void, arg_count: usize) {
    debug!(
        event = "packed_call",
        function = ?func,
        args = arg_count,
        "Packed function called"
    );
}

/// Log a bridged callback failure
pub fn log_callback_error(callback_id: usize, error: &str) {
    warn!(
        event = "callback_error",
        callback = callback_id,
        error = error,
        "Host callback failed"
    );
}

/// Log a type tag with no decoder
pub fn log_unknown_tag(tag: i32) {
    error!(
        event = "unknown_tag",
        tag = tag,
        "Unknown type tag, host/native ABI mismatch"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.file_output);

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert!(debug_config.file_output);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(LogConfig::parse_level("WARN"), Level::WARN);
        assert_eq!(LogConfig::parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init(); // Should not panic
        assert!(is_initialized());
    }
}

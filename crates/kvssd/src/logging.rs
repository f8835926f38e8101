//! Logging configuration for KVSSD
//!
//! Engine events (flushes, compactions, GC passes, allocation failures,
//! skipped records) are emitted through `tracing`. This module installs a
//! subscriber for them, on stdout, a daily-rotated file, or both.
//!
//! The configured level applies to the engine crates only; other crates log
//! at `warn`. Single components can be turned up on their own:
//!
//! ```rust,no_run
//! use kvssd::logging::LogConfig;
//!
//! // Trace every GC pass, keep the rest of the engine at info
//! let _guard = LogConfig::info()
//!     .with_target("kvssd_storage::gc", "trace")
//!     .init();
//! ```

use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates the configured level applies to
pub const ENGINE_TARGETS: [&str; 3] = ["kvssd", "kvssd_storage", "kvssd_core"];

/// Filter used when the configured directives do not parse
const FALLBACK_FILTER: &str = "warn,kvssd=info,kvssd_storage=info,kvssd_core=info";

/// Log output destination
#[derive(Debug, Clone)]
pub enum LogOutput {
    /// Output to stdout
    Stdout,
    /// Output to a file with rotation
    File(PathBuf),
    /// Output to both stdout and file
    Both(PathBuf),
}

/// Log format style
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level for the engine crates
    pub level: String,
    /// Per-target overrides, e.g. `("kvssd_storage::compaction", "debug")`
    pub targets: Vec<(String, String)>,
    /// Output destination
    pub output: LogOutput,
    /// Format style
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            targets: Vec::new(),
            output: LogOutput::Stdout,
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Create config with info level and stdout output
    pub fn info() -> Self {
        Self::default()
    }

    /// Create config with debug level
    pub fn debug() -> Self {
        Self::default().with_level("debug")
    }

    /// Create config with warn level
    pub fn warn() -> Self {
        Self::default().with_level("warn")
    }

    /// Set log output to file with rotation
    pub fn with_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.into());
        self
    }

    /// Set log output to both stdout and file
    pub fn with_both<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.into());
        self
    }

    /// Set log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the engine log level
    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self
    }

    /// Override the level of one target, such as a single engine module
    pub fn with_target<T: Into<String>, L: Into<String>>(mut self, target: T, level: L) -> Self {
        self.targets.push((target.into(), level.into()));
        self
    }

    /// Filter directives: `warn` globally, the configured level for the
    /// engine crates, then the per-target overrides
    pub fn directives(&self) -> String {
        let mut directives = String::from("warn");
        for target in ENGINE_TARGETS {
            directives.push_str(&format!(",{}={}", target, self.level));
        }
        for (target, level) in &self.targets {
            directives.push_str(&format!(",{}={}", target, level));
        }
        directives
    }

    /// Filter from `RUST_LOG`, else the configured directives, else the
    /// engine at `info`
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.directives()))
            .unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
    }

    /// Initialize global logging with this configuration
    ///
    /// Returns a guard that must be kept alive for file logging to work.
    /// When the guard is dropped, the logging worker thread is shut down.
    /// If a global subscriber is already installed, the existing one is
    /// kept.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use kvssd::logging::LogConfig;
    ///
    /// // Keep the guard alive for the lifetime of your application
    /// let _guard = LogConfig::info().init();
    /// ```
    pub fn init(self) -> Option<WorkerGuard> {
        let env_filter = self.env_filter();
        let filter = env_filter.to_string();

        let (installed, guard) = match self.output {
            LogOutput::Stdout => {
                let registry = tracing_subscriber::registry().with(env_filter);
                let installed = match self.format {
                    LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
                    LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
                };
                (installed.is_ok(), None)
            }
            LogOutput::File(path) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(&path));
                let registry = tracing_subscriber::registry().with(env_filter);
                let installed = match self.format {
                    LogFormat::Pretty => registry
                        .with(fmt::layer().with_writer(non_blocking).pretty())
                        .try_init(),
                    LogFormat::Compact => registry
                        .with(fmt::layer().with_writer(non_blocking).compact())
                        .try_init(),
                };
                (installed.is_ok(), Some(guard))
            }
            LogOutput::Both(path) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(&path));
                let installed = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer())
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .try_init();
                (installed.is_ok(), Some(guard))
            }
        };
        if installed {
            debug!(%filter, "kvssd logging initialized");
        }
        guard
    }
}

fn file_appender(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    tracing_appender::rolling::daily(
        path.parent().unwrap_or_else(|| Path::new(".")),
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("kvssd.log"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(matches!(config.output, LogOutput::Stdout));
    }

    #[test]
    fn test_log_config_builders() {
        let config = LogConfig::debug()
            .with_file("/tmp/kvssd.log")
            .with_format(LogFormat::Compact);
        assert_eq!(config.level, "debug");
        assert!(matches!(config.output, LogOutput::File(_)));
        assert!(matches!(config.format, LogFormat::Compact));
    }

    #[test]
    fn test_directives_scope_level_to_engine() {
        let config = LogConfig::debug().with_target("kvssd_storage::gc", "trace");
        assert_eq!(
            config.directives(),
            "warn,kvssd=debug,kvssd_storage=debug,kvssd_core=debug,kvssd_storage::gc=trace"
        );
        assert!(EnvFilter::try_new(config.directives()).is_ok());
        assert!(EnvFilter::try_new(FALLBACK_FILTER).is_ok());
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        let _first = LogConfig::warn().with_format(LogFormat::Compact).init();
        let _second = LogConfig::default().with_level("not a [valid filter").init();
    }
}

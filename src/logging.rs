//! Logging setup for the import tool.
//!
//! # Environment Variables
//!
//! - `LDBM_IMPORT_LOG` - Log filter (overrides RUST_LOG)
//! - `LDBM_IMPORT_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `LDBM_IMPORT_LOG_FORMAT` - Output format: pretty, compact, json
//! - `LDBM_IMPORT_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Command-line flags win over all of these.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Multi-line human-readable output
    #[value(alias = "full")]
    Pretty,
    /// One line per event (default)
    #[default]
    Compact,
    /// JSON objects for log collectors
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    /// Same spellings as `--log-format`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(s, true)
            .map_err(|_| format!("unknown log format '{}' (pretty, compact or json)", s))
    }
}

/// Logging configuration, built from the command line then the environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file; stderr is always written.
    pub file_path: Option<PathBuf>,
    /// Filter directive; wins over `level` when set.
    pub filter: Option<String>,
    pub ansi: bool,
    /// Pipeline threads are named (Producer, Foreman, one per index).
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            file_path: None,
            filter: None,
            ansi: true,
            show_thread_names: false,
        }
    }
}

impl LogConfig {
    /// Level from `-v` repetitions and `-q`.
    pub fn for_cli(verbose: u8, quiet: bool) -> Self {
        let level = if quiet {
            Level::WARN
        } else {
            match verbose {
                0 => Level::INFO,
                1 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };
        // An explicit -v/-q must not be overridden by the environment
        let filter = (quiet || verbose > 0).then(|| level.to_string().to_lowercase());
        Self {
            level,
            filter,
            show_thread_names: verbose > 0,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Fill whatever the command line left unset from `LDBM_IMPORT_*` and `RUST_LOG`.
    pub fn with_env_overrides(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    fn with_env_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = var("LDBM_IMPORT_LOG").or_else(|| var("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = var("LDBM_IMPORT_LOG_LEVEL").as_deref().and_then(parse_level)
        {
            self.level = level;
        }
        if let Some(format) = var("LDBM_IMPORT_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.format = format;
        }
        if self.file_path.is_none()
            && let Some(path) = var("LDBM_IMPORT_LOG_FILE")
        {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("ignoring unparsable log filter '{}'", filter);
                fallback()
            }),
            None => fallback(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    if s.eq_ignore_ascii_case("warning") {
        return Some(Level::WARN);
    }
    s.parse().ok()
}

/// One formatting layer in the configured format.
fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_names(config.show_thread_names);
    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}

fn file_appender(path: &Path) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("ldbm-import.log");
    RollingFileAppender::new(Rotation::NEVER, parent, file_name)
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();
    let stderr = fmt_layer(&config, std::io::stderr, config.ansi);
    let file = config
        .file_path
        .as_deref()
        .map(|path| fmt_layer(&config, file_appender(path), false));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_format_names_match_the_flag() {
        assert_eq!("full".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().unwrap_err().contains("xml"));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_cli_levels() {
        assert_eq!(LogConfig::for_cli(0, false).level, Level::INFO);
        assert!(LogConfig::for_cli(0, false).filter.is_none());
        assert_eq!(LogConfig::for_cli(1, false).level, Level::DEBUG);
        assert_eq!(LogConfig::for_cli(3, false).level, Level::TRACE);
        let quiet = LogConfig::for_cli(2, true);
        assert_eq!(quiet.level, Level::WARN);
        assert_eq!(quiet.filter.as_deref(), Some("warn"));
    }

    #[test]
    fn test_env_fills_unset_fields() {
        let config = LogConfig::for_cli(0, false).with_env_from(env(&[
            ("RUST_LOG", "ldbm_import=debug"),
            ("LDBM_IMPORT_LOG_FORMAT", "json"),
            ("LDBM_IMPORT_LOG_FILE", "/tmp/import.log"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("ldbm_import=debug"));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/import.log")));
    }

    #[test]
    fn test_cli_wins_over_env() {
        let config = LogConfig::for_cli(1, false)
            .with_file(PathBuf::from("/var/log/cli.log"))
            .with_env_from(env(&[
                ("LDBM_IMPORT_LOG", "error"),
                ("LDBM_IMPORT_LOG_LEVEL", "error"),
                ("LDBM_IMPORT_LOG_FILE", "/tmp/env.log"),
            ]));
        assert_eq!(config.filter.as_deref(), Some("debug"));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.file_path, Some(PathBuf::from("/var/log/cli.log")));
    }

    #[test]
    fn test_level_from_env_without_filter() {
        let config =
            LogConfig::default().with_env_from(env(&[("LDBM_IMPORT_LOG_LEVEL", "debug")]));
        assert_eq!(config.level, Level::DEBUG);
    }
}

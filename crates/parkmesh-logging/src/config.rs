//! Configuration types for the logging system

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log level (can be overridden by RUST_LOG)
    pub default_level: String,

    /// Per-target overrides appended to the default level, e.g.
    /// `parkmesh_transport=info`
    pub directives: Vec<String>,

    /// Console output configuration
    pub console: ConsoleConfig,

    /// File output configuration
    pub file: Option<FileConfig>,

    /// JSONL output configuration
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            directives: Vec::new(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Verbose human-readable console output
    ///
    /// Per-frame transport logging and redb internals stay at info.
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            directives: vec!["parkmesh_transport=info".to_string(), "redb=info".to_string()],
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: true,
            },
            ..Default::default()
        }
    }

    /// JSONL to daily-rotated files under `log_dir`, no console
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            default_level: "info".to_string(),
            directives: vec!["redb=warn".to_string()],
            console: ConsoleConfig {
                enabled: false,
                pretty: false,
                ansi: false,
            },
            file: Some(FileConfig {
                directory: log_dir,
                ..FileConfig::default()
            }),
            jsonl: JsonlConfig::default(),
        }
    }

    /// Minimal output for tests; dispatch errors still show
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            directives: vec!["parkmesh_node=error".to_string()],
            console: ConsoleConfig {
                enabled: true,
                pretty: false,
                ansi: false,
            },
            ..Default::default()
        }
    }

    /// Name the log files after one node so several can share a directory
    pub fn for_node(mut self, node_id: &str) -> Self {
        if let Some(file) = self.file.as_mut() {
            file.prefix = format!("parkmesh-{}", node_id);
        }
        self
    }

    /// `EnvFilter` directive string: the default level then every override
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.default_level.as_str())
            .chain(self.directives.iter().map(String::as_str))
            .filter(|d| !d.trim().is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Console output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Enable console output
    pub enabled: bool,
    /// Use pretty (human-readable) format
    pub pretty: bool,
    /// Include ANSI colors
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false, // JSONL by default
            ansi: false,
        }
    }
}

/// File output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory for log files
    pub directory: PathBuf,
    /// File name prefix
    pub prefix: String,
    /// Rotation strategy
    pub rotation: RotationStrategy,
    /// Maximum rotated files to retain
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "parkmesh".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(14),
        }
    }
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// Single file, truncated at startup
    Never,
}

/// JSONL formatting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Flatten event fields to root level
    pub flatten_events: bool,
    /// Include span list in events
    pub include_spans: bool,
    /// Include current span details
    pub include_current_span: bool,
    /// Include file/line information
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_current_span: true,
            include_location: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.default_level, "info");
        assert!(config.console.enabled);
        assert!(!config.console.pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_development_config() {
        let config = LogConfig::development();
        assert_eq!(config.default_level, "debug");
        assert!(config.console.pretty);
        assert!(config.console.ansi);
    }

    #[test]
    fn test_production_config() {
        let config = LogConfig::production(PathBuf::from("/var/log/parkmesh"));
        assert!(!config.console.enabled);
        let file = config.file.unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/parkmesh"));
        assert_eq!(file.rotation, RotationStrategy::Daily);
    }

    #[test]
    fn test_filter_directives_join_overrides() {
        assert_eq!(LogConfig::default().filter_directives(), "info");
        assert_eq!(
            LogConfig::development().filter_directives(),
            "debug,parkmesh_transport=info,redb=info"
        );

        let mut config = LogConfig::testing();
        config.directives.push(String::new());
        assert_eq!(config.filter_directives(), "warn,parkmesh_node=error");
    }

    #[test]
    fn test_node_file_prefix() {
        let config = LogConfig::production(PathBuf::from("/var/log/parkmesh")).for_node("central-1");
        assert_eq!(config.file.unwrap().prefix, "parkmesh-central-1");

        // No file output, nothing to rename
        assert!(LogConfig::development().for_node("central-1").file.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LogConfig =
            serde_json::from_str(r#"{"default_level":"trace","console":{"pretty":true}}"#).unwrap();
        assert_eq!(config.default_level, "trace");
        assert!(config.console.enabled);
        assert!(config.console.pretty);
        assert!(config.jsonl.flatten_events);
    }
}

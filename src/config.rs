use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted init or scan timeout (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration loaded from probe.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ProbeConfig {
    pub session: SessionConfig,
    pub scanner: ScannerConfig,
    pub target: TargetConfig,
    pub timeouts: TimeoutConfig,
    pub markers: MarkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub iterations: u32,
    pub output_file: PathBuf,
    pub report_file: Option<PathBuf>,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// Scan target, substituted into `{mac}`, `{interval}` and `{window}` args.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub mac: String,
    pub interval: u32,
    pub window: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub init_secs: u64,
    pub scan_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub init: String,
    pub error: String,
    pub expected_tokens: usize,
    pub tokenize: TokenizeFrom,
}

/// Which part of the captured output is split into tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizeFrom {
    /// Text following the init marker.
    AfterInit,
    /// Everything the scanner printed since spawn.
    Full,
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            output_file: PathBuf::from("output.txt"),
            report_file: None,
            max_delay_ms: 1000,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            command: "sudo".to_string(),
            args: vec![
                "stdbuf".to_string(),
                "-oL".to_string(),
                "./exe/scanner".to_string(),
                "-i".to_string(),
                "{interval}".to_string(),
                "-w".to_string(),
                "{window}".to_string(),
                "-m".to_string(),
                "{mac}".to_string(),
            ],
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            mac: "1C:34:F1:DE:25:74".to_string(),
            interval: 178,
            window: 8,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_secs: 5,
            scan_secs: 100,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            init: "Using".to_string(),
            error: "ERROR:".to_string(),
            expected_tokens: 7,
            tokenize: TokenizeFrom::AfterInit,
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A resolved setting is out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl ProbeConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_toml(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.iterations == 0 {
            return Err(ConfigError::Invalid(
                "session.iterations must be greater than 0".to_string(),
            ));
        }
        if self.scanner.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scanner.command is empty".to_string(),
            ));
        }
        if self.timeouts.init_secs == 0 || self.timeouts.scan_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be at least 1 second".to_string(),
            ));
        }
        if self.timeouts.init_secs > MAX_TIMEOUT_SECS
            || self.timeouts.scan_secs > MAX_TIMEOUT_SECS
        {
            return Err(ConfigError::Invalid(format!(
                "timeouts must be at most {MAX_TIMEOUT_SECS} seconds"
            )));
        }
        if self.markers.expected_tokens < 2 {
            return Err(ConfigError::Invalid(
                "markers.expected_tokens must be at least 2".to_string(),
            ));
        }
        if self.markers.init.is_empty() || self.markers.error.is_empty() {
            return Err(ConfigError::Invalid("markers must not be empty".to_string()));
        }
        Ok(())
    }

    /// Scanner arguments with target placeholders filled in.
    pub fn scanner_args(&self) -> Vec<String> {
        build_args(&self.scanner, &self.target)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.init_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.scan_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.session.max_delay_ms)
    }
}

/// Replace `{mac}`, `{interval}` and `{window}` placeholders with target values.
fn build_args(scanner: &ScannerConfig, target: &TargetConfig) -> Vec<String> {
    let interval = target.interval.to_string();
    let window = target.window.to_string();
    scanner
        .args
        .iter()
        .map(|arg| {
            arg.replace("{mac}", &target.mac)
                .replace("{interval}", &interval)
                .replace("{window}", &window)
        })
        .collect()
}

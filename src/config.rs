//! Configuration for the S7 exporter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default poll interval when no target configures `cycle_runtime`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// PLCs to poll.
    pub targets: Vec<TargetConfig>,

    /// Prometheus HTTP endpoint settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for a single S7 PLC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// PLC address (IP or hostname).
    pub ip: String,

    /// Value of the `target` label on every metric from this PLC.
    pub label: String,

    /// Rack number (0-7).
    #[serde(default)]
    pub rack: u16,

    /// Slot number (0-31).
    #[serde(default = "default_slot")]
    pub slot: u16,

    /// ISO-on-TCP port (default: 102).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Poll interval, e.g. "15000ms" or a bare number of seconds.
    /// Only the first target's setting is honored (one cycle covers all
    /// targets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_runtime: Option<CycleRuntime>,

    /// Data blocks to read.
    #[serde(default)]
    pub db: Vec<BlockConfig>,
}

fn default_slot() -> u16 {
    1
}

fn default_port() -> u16 {
    102
}

/// A numbered data block on a PLC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    /// DB number.
    pub number: u16,

    /// Values to decode out of this block.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

/// A single value to read, decode and publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Metric name; becomes the Prometheus gauge name.
    pub name: String,

    /// Data type: "int", "float", "bool" or "string". Unknown strings are
    /// kept as-is and rejected at decode time, not at load time.
    #[serde(rename = "type")]
    pub value_type: ValueType,

    /// Byte offset within the block; "B.b" notation carries a bit index
    /// for bool values.
    pub offset: Offset,

    /// Help text for the gauge.
    #[serde(default)]
    pub help: String,

    /// Bytes to read for string values (default: 10).
    #[serde(default = "default_string_len")]
    pub bytes_to_read: usize,
}

fn default_string_len() -> usize {
    10
}

/// Declared data type of a metric.
///
/// Parsing never fails: an unrecognized token is preserved in `Other` so the
/// decoder can report it per metric instead of the whole file failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Int,
    Float,
    Bool,
    Str,
    Other(String),
}

impl ValueType {
    /// The configuration token for this type.
    pub fn as_str(&self) -> &str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::Str => "string",
            ValueType::Other(s) => s,
        }
    }
}

impl From<String> for ValueType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "int" => ValueType::Int,
            "float" => ValueType::Float,
            "bool" => ValueType::Bool,
            "string" => ValueType::Str,
            _ => ValueType::Other(s),
        }
    }
}

impl From<ValueType> for String {
    fn from(t: ValueType) -> Self {
        t.as_str().to_string()
    }
}

/// Byte offset within a block, with an optional sub-byte bit index.
///
/// Accepts a plain integer (`4`), a fractional number (`4.2`), or the same
/// forms as a string (`"4.2"`). The fractional part is a bit position 0-7,
/// 0 being the least significant bit; absence implies bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOffset", into = "RawOffset")]
pub struct Offset {
    pub byte: u32,
    pub bit: u8,
}

impl Offset {
    /// Offset with bit index 0.
    pub fn byte(byte: u32) -> Self {
        Self { byte, bit: 0 }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bit == 0 {
            write!(f, "{}", self.byte)
        } else {
            write!(f, "{}.{}", self.byte, self.bit)
        }
    }
}

/// Wire form of [`Offset`] as it appears in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawOffset {
    Number(f64),
    Text(String),
}

impl TryFrom<RawOffset> for Offset {
    type Error = String;

    fn try_from(raw: RawOffset) -> Result<Self, Self::Error> {
        match raw {
            RawOffset::Number(n) => {
                if n < 0.0 {
                    return Err(format!("offset must not be negative: {}", n));
                }
                if n.fract() == 0.0 {
                    Ok(Offset::byte(n as u32))
                } else {
                    parse_offset(&format!("{}", n))
                }
            }
            RawOffset::Text(s) => parse_offset(&s),
        }
    }
}

impl From<Offset> for RawOffset {
    fn from(offset: Offset) -> Self {
        RawOffset::Text(offset.to_string())
    }
}

fn parse_offset(s: &str) -> Result<Offset, String> {
    let (byte_part, bit_part) = match s.split_once('.') {
        Some((b, i)) => (b, Some(i)),
        None => (s, None),
    };

    let byte: u32 = byte_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid offset '{}'", s))?;

    let bit: u8 = match bit_part {
        Some(i) => i
            .trim()
            .parse()
            .map_err(|_| format!("invalid bit index in offset '{}'", s))?,
        None => 0,
    };

    if bit > 7 {
        return Err(format!("bit index must be 0-7, got {} in '{}'", bit, s));
    }

    Ok(Offset { byte, bit })
}

/// Poll interval as written in the config: "15000ms" or bare seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CycleRuntime {
    Seconds(u64),
    Text(String),
}

impl CycleRuntime {
    /// Resolve to a concrete duration.
    pub fn as_duration(&self) -> Result<Duration, String> {
        match self {
            CycleRuntime::Seconds(s) => Ok(Duration::from_secs(*s)),
            CycleRuntime::Text(s) => {
                let s = s.trim();
                if let Some(ms) = s.strip_suffix("ms") {
                    ms.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|_| format!("invalid cycle_runtime '{}'", s))
                } else {
                    s.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| format!("invalid cycle_runtime '{}'", s))
                }
            }
        }
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9712").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9712".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Validation(
                "At least one target must be configured".to_string(),
            ));
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        for target in &self.targets {
            if target.ip.is_empty() {
                return Err(ConfigError::Validation(
                    "Target ip cannot be empty".to_string(),
                ));
            }
            if target.label.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Target '{}': label cannot be empty",
                    target.ip
                )));
            }
            if target.rack > 7 {
                return Err(ConfigError::Validation(format!(
                    "Target '{}': rack must be 0-7",
                    target.ip
                )));
            }
            if target.slot > 31 {
                return Err(ConfigError::Validation(format!(
                    "Target '{}': slot must be 0-31",
                    target.ip
                )));
            }

            if let Some(runtime) = &target.cycle_runtime {
                runtime.as_duration().map_err(|e| {
                    ConfigError::Validation(format!("Target '{}': {}", target.ip, e))
                })?;
            }

            for block in &target.db {
                for metric in &block.metrics {
                    if !is_valid_metric_name(&metric.name) {
                        return Err(ConfigError::Validation(format!(
                            "Target '{}': invalid metric name '{}'",
                            target.ip, metric.name
                        )));
                    }

                    // Sub-byte addressing only makes sense for bool reads.
                    if metric.offset.bit != 0 && metric.value_type != ValueType::Bool {
                        return Err(ConfigError::Validation(format!(
                            "Metric '{}': bit offset '{}' requires type bool",
                            metric.name, metric.offset
                        )));
                    }

                    if metric.value_type == ValueType::Str && metric.bytes_to_read == 0 {
                        return Err(ConfigError::Validation(format!(
                            "Metric '{}': bytes_to_read must be > 0",
                            metric.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Poll interval for the cycle loop.
    ///
    /// Taken from the first target's `cycle_runtime`, falling back to
    /// [`DEFAULT_POLL_INTERVAL`].
    pub fn poll_interval(&self) -> Duration {
        self.targets
            .first()
            .and_then(|t| t.cycle_runtime.as_ref())
            .and_then(|c| c.as_duration().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}

/// Check a name against the Prometheus metric name charset
/// `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

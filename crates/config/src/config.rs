//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but holds values that cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Length unit used for caller-supplied label dimensions.
///
/// Deserializes from any string; anything that is not `cm` or `in` is read as
/// millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Unit {
    #[default]
    Mm,
    Cm,
    In,
}

impl Unit {
    /// Millimeters per one of this unit.
    pub fn mm_factor(self) -> f64 {
        match self {
            Unit::Mm => 1.0,
            Unit::Cm => 10.0,
            Unit::In => 25.4,
        }
    }

    /// Convert a value expressed in this unit to millimeters.
    pub fn to_mm(self, value: f64) -> f64 {
        value * self.mm_factor()
    }

    /// Lossy parse: unknown units fall back to millimeters.
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "cm" => Unit::Cm,
            "in" | "inch" | "inches" => Unit::In,
            _ => Unit::Mm,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Mm => "mm",
            Unit::Cm => "cm",
            Unit::In => "in",
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Unit {
    fn from(s: String) -> Self {
        Unit::parse_lossy(&s)
    }
}

impl From<Unit> for String {
    fn from(u: Unit) -> Self {
        u.as_str().to_string()
    }
}

/// Folder watching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Folder to watch for incoming label files
    pub folder: Option<PathBuf>,
    /// Accepted file extensions, without the dot (case-insensitive)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Pause after a notification before the file is read
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Pick up files already present when watching starts
    #[serde(default = "default_true")]
    pub scan_existing: bool,
}

fn default_extensions() -> Vec<String> {
    vec!["txt".to_string(), "prn".to_string()]
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            folder: None,
            extensions: default_extensions(),
            settle_delay_ms: default_settle_delay_ms(),
            scan_existing: true,
        }
    }
}

/// Label size configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelConfig {
    /// Explicit width; together with `height` this enables fixed dimensions
    pub width: Option<f64>,
    /// Explicit height
    pub height: Option<f64>,
    /// Unit of `width` and `height`
    #[serde(default)]
    pub unit: Unit,
    /// Print density in dots per inch
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

fn default_dpi() -> u32 {
    203
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            unit: Unit::Mm,
            dpi: default_dpi(),
        }
    }
}

impl LabelConfig {
    /// True when both explicit dimensions are set, i.e. the daemon applies
    /// them to every label regardless of content.
    pub fn is_fixed(&self) -> bool {
        self.width.is_some() && self.height.is_some()
    }
}

/// Processing queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum files converted in parallel (0 = auto-derive)
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: u32,
    /// Lock-conflict retries before a file is given up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before a locked file is tried again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Dispatch loop sleep when the intake buffer is empty
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_max_concurrent_files() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_idle_poll_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

/// Background daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Directory holding the PID/record file (platform default if None)
    pub pid_dir: Option<PathBuf>,
    /// How long `start` waits for the spawned process to record itself
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Grace period between a terminate request and a forced kill
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_start_timeout_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    5
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_dir: None,
            start_timeout_secs: default_start_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// External rendering and PDF assembly programs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConverterConfig {
    /// Program that turns one label (stdin) into one page image (stdout)
    #[serde(default = "default_renderer_program")]
    pub renderer_program: String,
    /// Renderer arguments; `{width_mm}`, `{height_mm}` and `{dpi}` are substituted
    #[serde(default = "default_renderer_args")]
    pub renderer_args: Vec<String>,
    /// Program that joins page images into a PDF
    #[serde(default = "default_assembler_program")]
    pub assembler_program: String,
    /// Assembler arguments; `{pages}` expands to the page files, `{output}` to the PDF path
    #[serde(default = "default_assembler_args")]
    pub assembler_args: Vec<String>,
    /// Where PDFs are written (next to the source file if None)
    pub output_folder: Option<PathBuf>,
}

fn default_renderer_program() -> String {
    "zpl2png".to_string()
}

fn default_renderer_args() -> Vec<String> {
    ["--width-mm", "{width_mm}", "--height-mm", "{height_mm}", "--dpi", "{dpi}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_assembler_program() -> String {
    "img2pdf".to_string()
}

fn default_assembler_args() -> Vec<String> {
    ["{pages}", "-o", "{output}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            renderer_program: default_renderer_program(),
            renderer_args: default_renderer_args(),
            assembler_program: default_assembler_program(),
            assembler_args: default_assembler_args(),
            output_folder: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub label: LabelConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LABEL_WATCH_FOLDER -> watch.folder
    /// - LABEL_WIDTH / LABEL_HEIGHT -> label.width / label.height
    /// - LABEL_UNIT -> label.unit
    /// - LABEL_DPI -> label.dpi
    /// - LABEL_MAX_CONCURRENT_FILES -> queue.max_concurrent_files
    /// - LABEL_MAX_RETRIES -> queue.max_retries
    /// - LABEL_RETRY_DELAY_MS -> queue.retry_delay_ms
    /// - LABEL_PID_DIR -> daemon.pid_dir
    /// - LABEL_OUTPUT_FOLDER -> converter.output_folder
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LABEL_WATCH_FOLDER") {
            if !val.trim().is_empty() {
                self.watch.folder = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("LABEL_WIDTH") {
            if let Ok(width) = val.parse::<f64>() {
                self.label.width = Some(width);
            }
        }

        if let Ok(val) = env::var("LABEL_HEIGHT") {
            if let Ok(height) = val.parse::<f64>() {
                self.label.height = Some(height);
            }
        }

        if let Ok(val) = env::var("LABEL_UNIT") {
            self.label.unit = Unit::parse_lossy(&val);
        }

        if let Ok(val) = env::var("LABEL_DPI") {
            if let Ok(dpi) = val.parse::<u32>() {
                self.label.dpi = dpi;
            }
        }

        if let Ok(val) = env::var("LABEL_MAX_CONCURRENT_FILES") {
            if let Ok(n) = val.parse::<u32>() {
                self.queue.max_concurrent_files = n;
            }
        }

        if let Ok(val) = env::var("LABEL_MAX_RETRIES") {
            if let Ok(n) = val.parse::<u32>() {
                self.queue.max_retries = n;
            }
        }

        if let Ok(val) = env::var("LABEL_RETRY_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.queue.retry_delay_ms = ms;
            }
        }

        if let Ok(val) = env::var("LABEL_PID_DIR") {
            if !val.trim().is_empty() {
                self.daemon.pid_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("LABEL_OUTPUT_FOLDER") {
            if !val.trim().is_empty() {
                self.converter.output_folder = Some(PathBuf::from(val));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an optional file; without one, defaults plus environment.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label.dpi == 0 {
            return Err(ConfigError::Invalid("dpi must be greater than 0".into()));
        }

        match (self.label.width, self.label.height) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "width and height must be given together".into(),
                ));
            }
            (Some(w), Some(h)) if !(w > 0.0 && h > 0.0) => {
                return Err(ConfigError::Invalid(format!(
                    "width and height must be positive (got {} x {})",
                    w, h
                )));
            }
            _ => {}
        }

        if self.watch.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one watched extension is required".into(),
            ));
        }

        Ok(())
    }

    /// The listen folder, or an error naming how to set it.
    pub fn require_folder(&self) -> Result<&Path, ConfigError> {
        self.watch.folder.as_deref().ok_or_else(|| {
            ConfigError::Invalid(
                "no listen folder configured (use -l, [watch].folder or LABEL_WATCH_FOLDER)"
                    .into(),
            )
        })
    }
}

use serde::{Deserialize, Serialize};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TLEMU_CONFIG";

/// Top-level layer configuration, loaded from tlemu.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing EnvFilter directive, overridden by TLEMU_LOG
    #[serde(default = "default_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fan out a point's signal with one submit per signaling queue instead
    /// of one submit per consuming semaphore.
    #[serde(default = "default_true")]
    pub batch_serializing_submits: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_serializing_submits: true,
        }
    }
}

impl LayerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, crate::error::LayerError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, crate::error::LayerError> {
        let config: LayerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    /// A file that exists but fails to parse is reported through the error slot.
    pub fn load_or_default(path: &str) -> (Self, Option<crate::error::LayerError>) {
        if !std::path::Path::new(path).exists() {
            return (Self::default(), None);
        }
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }
}

/// Returns the config file path based on platform conventions.
/// Search order:
/// 1. `TLEMU_CONFIG` if set
/// 2. System-wide config: `%PROGRAMDATA%\TLEMU\tlemu.toml` (Windows) or `/etc/tlemu/tlemu.toml` (Linux/macOS)
/// 3. Local fallback: `./tlemu.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return path;
    }
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\TLEMU\tlemu.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/tlemu/tlemu.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "tlemu.toml".to_string()
}

fn default_filter() -> String {
    "warn".to_string()
}

fn default_true() -> bool {
    true
}

use std::time::Duration;
use std::{env, fmt, fs, path};

use logger::LogSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheTtls;
use crate::database::models::Target;
use crate::limiter::RateLimiter;
use crate::monitoring::executor::RetryPolicy;
use crate::monitoring::state::TransitionPolicy;

/// Shortest and longest allowed cycle interval, in seconds
pub const MIN_CYCLE_INTERVAL_SECS: u64 = 10;
pub const MAX_CYCLE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: std::io::Error },

    #[error("failed to write {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: std::io::Error },

    #[error("failed to parse {path}: {source}")]
    ParseFailed { path: path::PathBuf, source: toml::de::Error },

    #[error("failed to serialize configuration: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("no configuration directory available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitoring: MonitoringSection,
    pub probe: ProbeSection,
    pub limits: LimitsSection,
    pub transitions: TransitionSection,
    pub cache: CacheSection,
    pub bus: BusSection,
    pub shutdown: ShutdownSection,
    pub database: DatabaseSection,
    pub server: ServerSection,
    pub log: LogSettings,
    /// Targets inserted into the store on startup when missing
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub cycle_interval_secs: u64,
    pub target_reload_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self { cycle_interval_secs: 30, target_reload_secs: 300, error_backoff_secs: 5 }
    }
}

impl MonitoringSection {
    /// Configured interval clamped to the supported range
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(
            self.cycle_interval_secs.clamp(MIN_CYCLE_INTERVAL_SECS, MAX_CYCLE_INTERVAL_SECS),
        )
    }

    pub fn target_reload(&self) -> Duration {
        Duration::from_secs(self.target_reload_secs.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl ProbeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_concurrent: usize,
    pub max_per_window: usize,
    pub window_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self { max_concurrent: 20, max_per_window: 50, window_ms: 1000 }
    }
}

impl LimitsSection {
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::new(self.max_concurrent, self.max_per_window, Duration::from_millis(self.window_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionSection {
    pub debounce_secs: u64,
    pub flap_window: usize,
    pub max_flips: usize,
    pub stabilization_count: u32,
}

impl Default for TransitionSection {
    fn default() -> Self {
        Self { debounce_secs: 60, flap_window: 10, max_flips: 4, stabilization_count: 5 }
    }
}

impl TransitionSection {
    pub fn policy(&self) -> TransitionPolicy {
        TransitionPolicy {
            debounce: Duration::from_secs(self.debounce_secs),
            flap_window: self.flap_window,
            max_flips: self.max_flips,
            stabilization_count: self.stabilization_count.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub online_ttl_secs: u64,
    pub offline_ttl_secs: u64,
    pub error_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { online_ttl_secs: 60, offline_ttl_secs: 30, error_ttl_secs: 15 }
    }
}

impl CacheSection {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            online: Duration::from_secs(self.online_ttl_secs),
            offline: Duration::from_secs(self.offline_ttl_secs),
            error: Duration::from_secs(self.error_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub subscriber_capacity: usize,
    pub history_size: usize,
    /// Keep-alive interval of the HTTP event stream
    pub heartbeat_secs: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self { subscriber_capacity: 100, history_size: 50, heartbeat_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    /// How long background tasks get to finish after cancellation
    pub grace_secs: u64,
    pub task_timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self { grace_secs: 10, task_timeout_secs: 30 }
    }
}

impl ShutdownSection {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Persist targets and snapshots; when off everything lives in memory
    pub enabled: bool,
    pub path: path::PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self { enabled: true, path: path::PathBuf::from("vigil.db") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8771 }
    }
}

/// The part of the configuration the monitoring engine reads
///
/// Swapped as a whole on reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub monitoring: MonitoringSection,
    pub probe: ProbeSection,
    pub limits: LimitsSection,
    pub transitions: TransitionSection,
    pub cache: CacheSection,
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/vigil/config.toml or
/// $HOME/.config/...)
pub fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("vigil/config.toml"))
}

/// Config path from an explicit argument, `VIGIL_CONFIG`, or the default
pub fn resolve_config_path(
    optional_path: Option<impl AsRef<path::Path>>,
) -> Result<path::PathBuf, ConfigError> {
    if let Some(path) = optional_path {
        return Ok(normalize_toml_path(path.as_ref()));
    }
    match env::var("VIGIL_CONFIG") {
        Ok(path) if !path.is_empty() => Ok(normalize_toml_path(path::Path::new(&path))),
        _ => default_config_path(),
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;

        write_title_1(f, "Monitoring")?;
        write_1(f, "Cycle Interval (s)", &self.monitoring.cycle_interval().as_secs())?;
        write_1(f, "Target Reload (s)", &self.monitoring.target_reload_secs)?;
        write_1(f, "Error Backoff (s)", &self.monitoring.error_backoff_secs)?;

        write_title_1(f, "Probe")?;
        write_1(f, "Timeout (ms)", &self.probe.timeout_ms)?;
        write_1(f, "Max Attempts", &self.probe.max_attempts)?;
        write_1(f, "Base Delay (ms)", &self.probe.base_delay_ms)?;
        write_1(f, "Multiplier", &self.probe.multiplier)?;
        write_1(f, "Max Delay (ms)", &self.probe.max_delay_ms)?;
        write_1(f, "Jitter", &self.probe.jitter)?;

        write_title_1(f, "Limits")?;
        write_1(f, "Max Concurrent", &self.limits.max_concurrent)?;
        write_1(f, "Max Per Window", &self.limits.max_per_window)?;
        write_1(f, "Window (ms)", &self.limits.window_ms)?;

        write_title_1(f, "Transitions")?;
        write_1(f, "Debounce (s)", &self.transitions.debounce_secs)?;
        write_1(f, "Flap Window", &self.transitions.flap_window)?;
        write_1(f, "Max Flips", &self.transitions.max_flips)?;
        write_1(f, "Stabilization Count", &self.transitions.stabilization_count)?;

        write_title_1(f, "Cache")?;
        write_1(f, "Online TTL (s)", &self.cache.online_ttl_secs)?;
        write_1(f, "Offline TTL (s)", &self.cache.offline_ttl_secs)?;
        write_1(f, "Error TTL (s)", &self.cache.error_ttl_secs)?;

        write_title_1(f, "Event Bus")?;
        write_1(f, "Subscriber Capacity", &self.bus.subscriber_capacity)?;
        write_1(f, "History Size", &self.bus.history_size)?;
        write_1(f, "Heartbeat (s)", &self.bus.heartbeat_secs)?;

        write_title_1(f, "Shutdown")?;
        write_1(f, "Grace (s)", &self.shutdown.grace_secs)?;
        write_1(f, "Task Timeout (s)", &self.shutdown.task_timeout_secs)?;

        write_title_1(f, "Database")?;
        write_1(f, "Enabled", &self.database.enabled)?;
        write_1(f, "Path", &self.database.path.display())?;

        write_title_1(f, "Server")?;
        write_1(f, "Bind Address", &self.server.bind)?;
        write_1(f, "Port", &self.server.port)?;

        write_title_1(f, "Log")?;
        write_1(f, "Level", &self.log.level)?;
        write_1(f, "Format", &self.log.format)?;

        write_1(f, "Seed Targets", &self.targets.len())?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/vigil/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,no_run
    /// use std::path;
    /// use vigil_service::config;
    ///
    /// let cfg = config::Config::from_config(None::<&path::Path>).unwrap();
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path = resolve_config_path(optional_path)?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Read an existing config file without creating one
    pub fn load(path: &path::Path) -> Result<Self, ConfigError> {
        let raw_string = fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFailed { path: path.to_path_buf(), source })?;
        Self::parse(&raw_string)
            .map_err(|source| ConfigError::ParseFailed { path: path.to_path_buf(), source })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            monitoring: self.monitoring.clone(),
            probe: self.probe.clone(),
            limits: self.limits.clone(),
            transitions: self.transitions.clone(),
            cache: self.cache.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::parse(
            r#"
            [monitoring]
            cycle_interval_secs = 5

            [probe]
            max_attempts = 1

            [[targets]]
            key = "gate-1"
            address = "10.0.0.1"
            label = "North gate"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitoring.cycle_interval(), Duration::from_secs(MIN_CYCLE_INTERVAL_SECS));
        assert_eq!(config.monitoring.target_reload_secs, 300);
        assert_eq!(config.probe.retry_policy().max_attempts, 1);
        assert_eq!(config.probe.timeout(), Duration::from_millis(3000));
        assert_eq!(config.targets.len(), 1);
        assert!(config.targets[0].enabled);
        assert_eq!(config.server.port, 8771);
    }

    #[test]
    fn test_interval_clamped_high() {
        let section = MonitoringSection { cycle_interval_secs: 3600, ..Default::default() };
        assert_eq!(section.cycle_interval(), Duration::from_secs(MAX_CYCLE_INTERVAL_SECS));
    }

    #[test]
    fn test_from_config_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/vigil");

        let config = Config::from_config(Some(&path)).unwrap();
        let written = dir.path().join("nested/vigil.toml");
        assert!(written.exists());
        assert_eq!(config.limits, LimitsSection::default());

        let reread = Config::load(&written).unwrap();
        assert_eq!(reread.engine_settings(), config.engine_settings());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[monitoring\ncycle_interval_secs = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn test_display_lists_sections() {
        let rendered = Config::default().to_string();
        assert!(rendered.contains("Monitoring"));
        assert!(rendered.contains("Cycle Interval (s): 30"));
        assert!(rendered.contains("Port: 8771"));
    }
}

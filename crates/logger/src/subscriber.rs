use std::env::var;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// `[log]` section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive, `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Compact }
    }
}

pub fn init() {
    init_with(&LogSettings::default());
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG_FORMAT=json` overrides the configured format so container
/// deployments can switch without touching the config file.
pub fn init_with(settings: &LogSettings) {
    let level = settings.level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let format = match var("RUST_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok("compact") => LogFormat::Compact,
        Ok(other) => {
            eprintln!("Unknown RUST_LOG_FORMAT '{other}', using configured format");
            settings.format
        }
        Err(_) => settings.format,
    };

    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_filter(env_filter)
            .boxed(),
    };

    if tracing_subscriber::registry().with(log_layer).try_init().is_err() {
        warn!("Tracing subscriber already installed, keeping the existing one");
    }
}

/// Install a subscriber that writes through the libtest capture.
/// Safe to call from every test; only the first call wins.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! Logging setup. Same shape as the teacher's `telemetry::init_telemetry`
//! (env-driven config, `tracing-subscriber` with an `EnvFilter`), with the
//! OpenTelemetry export layer removed: this is a standalone cluster CLI,
//! not a traced service, and there is no collector downstream to ship
//! spans to.

use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: Level,
    pub banner: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            log_level: Level::INFO,
            banner: std::env::var("NO_OO_LOGO").is_err(),
        }
    }
}

/// Initializes the global `tracing` subscriber. Safe to call once per
/// process; a second call is a no-op error that callers may ignore.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}

/// CI runners set `CI=1` (or any non-empty value); interactive rendering
/// such as progress banners should be suppressed there.
pub fn is_ci() -> bool {
    std::env::var("CI").map(|v| !v.is_empty()).unwrap_or(false)
}

pub const BANNER: &str = r"
   ___   ____ ____
  / _ \ / ___/ ___|
 | | | | |  | |
 | |_| | |__| |___
  \___/ \____\____|  hyperparameter orchestrator
";

pub fn print_banner_if_enabled(config: &TelemetryConfig) {
    if config.banner && !is_ci() {
        println!("{BANNER}");
    }
}

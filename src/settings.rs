use std::{path::PathBuf, time::Duration};
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::monitor::MonitorSettings;

pub const ANALYZE_VAR: &str = "CSB_ANALYZE";
pub const FLAMEGRAPH_VAR: &str = "FLAMEGRAPH";

const TRUE_VALUES: [&str; 4] = ["true", "1", "yes", "on"];

/// Environment switches that override the campaign file. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toggles {
    /// Run the configured monitors. On by default.
    pub analyze: bool,
    /// Directory holding the FlameGraph scripts.
    pub flamegraph_dir: Option<PathBuf>,
}
impl Default for Toggles {
    fn default() -> Self {
        Toggles {
            analyze: true,
            flamegraph_dir: None,
        }
    }
}
impl Toggles {
    pub fn from_env() -> Self {
        Toggles::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Toggles::default();
        let flag = |name: &str, default: bool| match lookup(name) {
            Some(value) => is_true(&value),
            None => default,
        };

        Toggles {
            analyze: flag(ANALYZE_VAR, defaults.analyze),
            flamegraph_dir: lookup(FLAMEGRAPH_VAR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Monitor settings, with monitors off if either the environment or the command line
    /// disabled them.
    pub fn monitor_settings(&self, no_monitors: bool, stop_timeout: Duration) -> MonitorSettings {
        MonitorSettings {
            enabled: self.analyze && !no_monitors,
            flamegraph_dir: self.flamegraph_dir.clone(),
            stop_timeout,
        }
    }
}

/// Any value other than `true`, `1`, `yes` or `on` (case-insensitive) is false.
pub fn is_true(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    TRUE_VALUES.contains(&value.as_str())
}

/// Log subscriber honouring `RUST_LOG`, falling back to `info` (or `debug` when verbose).
pub fn subscriber(verbose: bool) -> impl Subscriber + Send + Sync {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

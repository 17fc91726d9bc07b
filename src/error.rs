use std::path::PathBuf;
use thiserror::Error;

/// Malformed sweep specs, unresolvable ranges and bad templates. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid range min={min} max={max} step={step}")]
    InvalidRange { min: i64, max: i64, step: i64 },

    #[error("unknown placeholder {{{name}}} in template \"{template}\"")]
    UnknownPlaceholder { name: String, template: String },

    #[error("unbalanced braces in template \"{0}\"")]
    MalformedTemplate(String),

    #[error("unable to find executable {name}")]
    MissingExecutable { name: String },

    #[error("unable to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// Not enough cores, IPs or IRQ cores for the requested unit count.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{units} unit(s) requested but only {available} core affinity offset(s) configured")]
    InsufficientCores { units: usize, available: usize },

    #[error("{units} unit(s) requested but only {available} IP address(es) configured")]
    InsufficientIps { units: usize, available: usize },

    #[error("{units} unit(s) requested but only {available} IRQ core offset(s) configured")]
    InsufficientIrqCores { units: usize, available: usize },

    #[error("core {core} is assigned to both unit {first} and unit {second}")]
    OverlappingCores {
        core: usize,
        first: usize,
        second: usize,
    },

    #[error("core {core} of unit {unit} is beyond the {available} available core(s)")]
    CoreOutOfRange {
        core: usize,
        unit: usize,
        available: usize,
    },

    #[error("IP address {ip} is assigned to more than one unit")]
    DuplicateIp { ip: String },

    #[error("port {base} + {unit} is not a valid port")]
    PortOutOfRange { base: u16, unit: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures starting or driving a unit or a plugin. Fatal to the current run only, except
/// for pre-hook plugins.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("\"{command}\" exited immediately with {status}")]
    ImmediateExit { command: String, status: String },

    #[error("command string is not POSIX compliant: {0}")]
    InvalidCommand(String),

    #[error("unit {unit} cannot move from {from:?} to {to:?}")]
    IllegalState {
        unit: usize,
        from: crate::execution_unit::UnitState,
        to: crate::execution_unit::UnitState,
    },

    #[error("image {image} is unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("container error: {0}")]
    Container(#[from] bollard::errors::Error),

    #[error("plugin {name} failed to launch: {reason}")]
    Plugin { name: String, reason: String },

    #[error("network setup for {nic} failed: {reason}")]
    Network { nic: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Telemetry failures. Everything except an unsupported tag degrades to an empty metric line.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("unsupported monitor type \"{0}\"")]
    UnsupportedVariant(String),

    #[error("monitor {monitor} requires {tool}, which could not be found")]
    MissingTool { monitor: String, tool: String },

    #[error("monitor {monitor} needs argument: {expected}")]
    MissingArgument { monitor: String, expected: String },

    #[error("monitor {monitor} failed to spawn: {source}")]
    Spawn {
        monitor: String,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor {monitor} produced unusable output: {reason}")]
    Output { monitor: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top level outcome of a campaign.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("resource exhaustion: {0}")]
    Resources(#[from] ResourceError),

    #[error("pre-hook failed: {0}")]
    PreHook(LaunchError),

    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("campaign aborted by operator")]
    Aborted,

    #[error("{} already exists, choose another campaign name or overwrite it", .0.display())]
    ResultsExist(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

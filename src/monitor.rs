/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod flame_graph;
mod noop;
mod redis_bench;
mod sar_net;
mod sys_stats;

pub use flame_graph::FlameGraph;
pub use noop::NoopMonitor;
pub use redis_bench::{AggregationPolicy, RedisStats};
pub use sar_net::SarNetStats;
pub use sys_stats::SystemStats;

use crate::{
    error::{LaunchError, MonitorError},
    metrics::MetricLine,
    process_control::{self, GroupChild, Redirect},
    template::Placeholders,
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Telemetry collected next to an execution unit for the length of one run.
#[async_trait]
pub trait Monitor: Send {
    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<(), MonitorError>;

    async fn stop(&mut self) -> Result<(), MonitorError>;

    /// Never fails. Returns an empty line when nothing usable was recorded.
    fn collect_results(&self) -> MetricLine;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    SystemStats,
    FlameGraph,
    RedisStats,
    SarNetStats,
}
impl MonitorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MonitorKind::SystemStats => "mpstat",
            MonitorKind::FlameGraph => "perf",
            MonitorKind::RedisStats => "redis_benchmark",
            MonitorKind::SarNetStats => "sar_net",
        }
    }
}
impl FromStr for MonitorKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpstat" => Ok(MonitorKind::SystemStats),
            "perf" => Ok(MonitorKind::FlameGraph),
            "redis_benchmark" => Ok(MonitorKind::RedisStats),
            "sar_net" => Ok(MonitorKind::SarNetStats),
            other => Err(MonitorError::UnsupportedVariant(other.to_string())),
        }
    }
}
impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// When false every monitor is a [`NoopMonitor`].
    pub enabled: bool,
    /// Directory holding `stackcollapse-perf.pl` and `flamegraph.pl`.
    pub flamegraph_dir: Option<PathBuf>,
    /// How long a stopped monitor may take to exit before it is killed.
    pub stop_timeout: Duration,
}
impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            enabled: true,
            flamegraph_dir: None,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of a monitor. Results are only read from a monitor that was stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Running,
    Stopped,
    Failed,
}

/// A sampling tool running in the background until interrupted.
#[derive(Debug)]
pub(crate) struct SampledCommand {
    monitor: &'static str,
    child: Option<GroupChild>,
}
impl SampledCommand {
    pub(crate) fn new(monitor: &'static str) -> Self {
        SampledCommand {
            monitor,
            child: None,
        }
    }

    pub(crate) async fn start(
        &mut self,
        words: &[String],
        cwd: &Path,
        envs: &[(&str, &str)],
        redirect: &Redirect,
    ) -> Result<(), MonitorError> {
        info!("Running {}", words.join(" "));
        let mut child = process_control::spawn_in_group(words, Some(cwd), envs, redirect)
            .map_err(|e| self.launch_error(e))?;
        child
            .ensure_launched()
            .await
            .map_err(|e| self.launch_error(e))?;
        self.child = Some(child);
        Ok(())
    }

    /// Interrupts the tool like Ctrl-C would, killing it if it does not exit in time.
    pub(crate) async fn interrupt(&mut self, timeout: Duration) -> Result<(), MonitorError> {
        if let Some(mut child) = self.child.take() {
            let status = child.shutdown(libc::SIGINT, false, timeout).await?;
            debug!("{} exited with {}", child.command, status);
        }
        Ok(())
    }

    fn launch_error(&self, e: LaunchError) -> MonitorError {
        match e {
            LaunchError::Spawn { source, .. } => MonitorError::Spawn {
                monitor: self.monitor.to_string(),
                source,
            },
            other => MonitorError::Output {
                monitor: self.monitor.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct MonitorSpec {
    kind: MonitorKind,
    args: Vec<String>,
}

/// Builds the configured monitors of every execution unit. Tags, tools and arguments are
/// validated once, when the orchestrator is created.
#[derive(Debug, Clone)]
pub struct MonitorOrchestrator {
    specs: Vec<MonitorSpec>,
    settings: MonitorSettings,
}
impl MonitorOrchestrator {
    pub fn new(
        monitors: &BTreeMap<String, Vec<String>>,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        let specs = monitors
            .iter()
            .map(|(tag, args)| {
                Ok(MonitorSpec {
                    kind: tag.parse()?,
                    args: args.clone(),
                })
            })
            .collect::<Result<Vec<_>, MonitorError>>()?;

        if settings.enabled {
            for spec in specs.iter() {
                check_requirements(spec, &settings)?;
            }
        }

        Ok(MonitorOrchestrator { specs, settings })
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn kinds(&self) -> impl Iterator<Item = MonitorKind> + '_ {
        self.specs.iter().map(|s| s.kind)
    }

    /// Monitors for one unit, writing into `dir` with their arguments rendered through the
    /// unit's placeholders.
    pub fn create(&self, dir: &Path, ph: &Placeholders) -> Result<MonitorSet, MonitorError> {
        let mut monitors: Vec<Box<dyn Monitor>> = Vec::with_capacity(self.specs.len());
        for spec in self.specs.iter() {
            let args = spec
                .args
                .iter()
                .map(|a| ph.render(a))
                .collect::<Result<Vec<_>, _>>()?;
            monitors.push(self.instantiate(spec.kind, dir, args)?);
        }
        Ok(MonitorSet { monitors })
    }

    fn instantiate(
        &self,
        kind: MonitorKind,
        dir: &Path,
        args: Vec<String>,
    ) -> Result<Box<dyn Monitor>, MonitorError> {
        if !self.settings.enabled {
            return Ok(Box::new(NoopMonitor::new(kind.tag())));
        }
        let timeout = self.settings.stop_timeout;
        let monitor: Box<dyn Monitor> = match kind {
            MonitorKind::SystemStats => Box::new(SystemStats::new(dir, args, timeout)),
            MonitorKind::FlameGraph => {
                let fg_dir = self.settings.flamegraph_dir.clone().ok_or_else(|| {
                    MonitorError::MissingTool {
                        monitor: kind.tag().to_string(),
                        tool: "FLAMEGRAPH".to_string(),
                    }
                })?;
                Box::new(FlameGraph::new(dir, args, fg_dir, timeout))
            }
            MonitorKind::RedisStats => Box::new(RedisStats::new(dir, &args)?),
            MonitorKind::SarNetStats => Box::new(SarNetStats::new(dir, &args, timeout)?),
        };
        Ok(monitor)
    }
}

fn check_requirements(spec: &MonitorSpec, settings: &MonitorSettings) -> Result<(), MonitorError> {
    let missing_tool = |tool: &str| MonitorError::MissingTool {
        monitor: spec.kind.tag().to_string(),
        tool: tool.to_string(),
    };
    let missing_arg = |expected: &str| MonitorError::MissingArgument {
        monitor: spec.kind.tag().to_string(),
        expected: expected.to_string(),
    };

    let tools: &[&str] = match spec.kind {
        MonitorKind::SystemStats => &["mpstat"],
        MonitorKind::FlameGraph => &["perf"],
        MonitorKind::RedisStats => &[],
        MonitorKind::SarNetStats => &["sar", "sadf"],
    };
    if let Some(tool) = tools.iter().find(|t| !process_control::tool_exists(t)) {
        return Err(missing_tool(tool));
    }

    match spec.kind {
        MonitorKind::FlameGraph if settings.flamegraph_dir.is_none() => {
            Err(missing_tool("FLAMEGRAPH (path to the FlameGraph scripts)"))
        }
        MonitorKind::RedisStats if spec.args.is_empty() => Err(missing_arg("csv file name")),
        MonitorKind::SarNetStats if spec.args.len() < 2 => {
            Err(missing_arg("network namespace and interface"))
        }
        _ => Ok(()),
    }
}

/// The monitors of one execution unit.
pub struct MonitorSet {
    monitors: Vec<Box<dyn Monitor>>,
}
impl MonitorSet {
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Starts every monitor. A monitor that fails to start contributes an empty line.
    pub async fn start_all(&mut self) {
        for monitor in self.monitors.iter_mut() {
            if let Err(e) = monitor.start().await {
                warn!("Monitor {} failed to start: {}", monitor.name(), e);
            }
        }
    }

    pub async fn stop_all(&mut self) {
        for monitor in self.monitors.iter_mut() {
            if let Err(e) = monitor.stop().await {
                warn!("Monitor {} failed to stop: {}", monitor.name(), e);
            }
        }
    }

    /// The lines of all monitors, concatenated in monitor order.
    pub fn collect_all(&self) -> MetricLine {
        let mut line = MetricLine::new();
        for monitor in self.monitors.iter() {
            line.extend(monitor.collect_results());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitors(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(tag, args)| (tag.to_string(), args.iter().map(|a| a.to_string()).collect()))
            .collect()
    }

    fn disabled() -> MonitorSettings {
        MonitorSettings {
            enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn tags_map_to_kinds() -> anyhow::Result<()> {
        for kind in [
            MonitorKind::SystemStats,
            MonitorKind::FlameGraph,
            MonitorKind::RedisStats,
            MonitorKind::SarNetStats,
        ] {
            assert_eq!(kind.tag().parse::<MonitorKind>()?, kind);
        }
        Ok(())
    }

    #[test]
    fn unknown_tag_is_rejected_even_when_disabled() {
        let res = MonitorOrchestrator::new(&monitors(&[("iostat", &[])]), disabled());
        assert!(matches!(res, Err(MonitorError::UnsupportedVariant(tag)) if tag == "iostat"));
    }

    #[test]
    fn redis_needs_a_file_argument() {
        let res = MonitorOrchestrator::new(
            &monitors(&[("redis_benchmark", &[])]),
            MonitorSettings::default(),
        );
        assert!(matches!(res, Err(MonitorError::MissingArgument { .. })));
    }

    #[test]
    fn perf_needs_the_flamegraph_scripts() {
        let res = MonitorOrchestrator::new(&monitors(&[("perf", &[])]), MonitorSettings::default());
        assert!(matches!(res, Err(MonitorError::MissingTool { .. })));
    }

    #[tokio::test]
    async fn disabled_monitors_collect_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let orchestrator = MonitorOrchestrator::new(
            &monitors(&[("mpstat", &["-P", "{cores}"]), ("perf", &[])]),
            disabled(),
        )?;
        let ph = Placeholders::new().with("cores", "0,1");
        let mut set = orchestrator.create(dir.path(), &ph)?;
        assert_eq!(set.len(), 2);

        set.start_all().await;
        set.stop_all().await;
        assert!(set.collect_all().is_empty());
        Ok(())
    }

    #[test]
    fn monitor_args_are_rendered_per_unit() {
        let orchestrator =
            MonitorOrchestrator::new(&monitors(&[("mpstat", &["-P", "{nope}"])]), disabled())
                .expect("valid monitors");
        let res = orchestrator.create(Path::new("/tmp"), &Placeholders::new());
        assert!(matches!(res, Err(MonitorError::Config(_))));
    }

    #[tokio::test]
    async fn redis_results_are_aggregated_after_stop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("redis.csv"),
            "test,rps,avg_latency_ms,min_latency_ms,p50_latency_ms,p95_latency_ms,p99_latency_ms,max_latency_ms\n\
             SET,1000,0.5,0.1,0.4,0.9,1.2,2.0\n\
             GET,3000,0.3,0.2,0.2,0.7,1.5,3.0\n",
        )?;
        let orchestrator = MonitorOrchestrator::new(
            &monitors(&[("redis_benchmark", &["redis.csv"])]),
            MonitorSettings::default(),
        )?;
        let mut set = orchestrator.create(dir.path(), &Placeholders::new())?;

        assert!(set.collect_all().is_empty());
        set.start_all().await;
        set.stop_all().await;

        let line = set.collect_all();
        assert_eq!(line.get("rps"), Some("2000.0"));
        assert_eq!(line.get("min_latency_ms"), Some("0.1"));
        assert_eq!(line.get("p99_latency_ms"), Some("1.5"));
        assert_eq!(line.get("max_latency_ms"), Some("3.0"));
        Ok(())
    }
}

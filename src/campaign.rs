/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{ApplicationConfig, CampaignConfig, Hook},
    error::{CampaignError, ConfigError, LaunchError},
    execution_unit::{ContainerSettings, ExecutionUnit, UnitState, FAILED_MARKER},
    metrics::MetricLine,
    monitor::{MonitorOrchestrator, MonitorSet, MonitorSettings},
    plugin::PluginRunner,
    process_control,
    resources::ResourcePlan,
    settings::Toggles,
    sweep::{RunDescriptor, SweepPlan},
    template::Placeholders,
};
use anyhow::Context;
use colored::Colorize;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const RESULTS_FILE: &str = "results.txt";
pub const METRICS_FILE: &str = "metrics.txt";

/// Directory searched for adapter scripts before `<home>/scripts/adapters` and `PATH`.
pub const ADAPTER_DIR_VAR: &str = "CSB_ADAPTERS";
const ADAPTER_DEFAULT_DIR: &str = "scripts/adapters";

/// Everything a campaign needs besides its configuration file.
#[derive(Debug, Clone)]
pub struct CampaignOptions {
    /// Absolute campaign home on the host.
    pub home: PathBuf,
    /// Name of the campaign directory under the results directory. Defaults to a timestamp.
    pub name: Option<String>,
    /// Copied into the campaign directory when set.
    pub config_path: Option<PathBuf>,
    /// Replace an existing campaign directory of the same name instead of refusing to run.
    pub overwrite: bool,
    pub monitors: MonitorSettings,
    /// Grace period of a unit between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    pub available_cores: usize,
}
impl CampaignOptions {
    pub fn new(home: &Path) -> Self {
        let monitors = Toggles::default().monitor_settings(false, Duration::from_secs(10));
        CampaignOptions {
            home: home.to_path_buf(),
            name: None,
            config_path: None,
            overwrite: false,
            monitors,
            stop_grace: Duration::from_secs(5),
            available_cores: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: RunDescriptor,
    pub status: RunStatus,
    /// One line per unit.
    pub lines: Vec<MetricLine>,
}

#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub root: PathBuf,
    pub outcomes: Vec<RunOutcome>,
}
impl CampaignReport {
    pub fn failed_runs(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, RunStatus::Failed(_)))
            .count()
    }
}

enum RunError {
    /// Ends the campaign.
    Fatal(CampaignError),
    /// Ends the current run only.
    Failed(String),
}
impl From<LaunchError> for RunError {
    fn from(e: LaunchError) -> Self {
        RunError::Failed(e.to_string())
    }
}

/// The units and monitors of a run in flight.
struct RunState {
    units: Vec<ExecutionUnit>,
    monitors: Vec<MonitorSet>,
}

/// A fully validated campaign. Creating one checks the sweep, the resources, the monitors
/// and the plugins, so that nothing is launched for a campaign that cannot complete.
pub struct Campaign {
    config: CampaignConfig,
    options: CampaignOptions,
    plan: SweepPlan,
    resources: ResourcePlan,
    monitors: MonitorOrchestrator,
    plugins: PluginRunner,
    container: ContainerSettings,
    root_rel: PathBuf,
    cancel: CancellationToken,
}
impl Campaign {
    pub fn new(
        mut config: CampaignConfig,
        options: CampaignOptions,
    ) -> Result<Self, CampaignError> {
        resolve_adapters(&mut config.applications, &options.home)?;
        let plan = SweepPlan::new(&config.applications, &config.benchmark, &config.containers)?;
        let resources = ResourcePlan::new(
            &config.containers,
            config.nics.as_ref(),
            plan.max_units(),
            options.available_cores,
        )?;
        let monitors =
            MonitorOrchestrator::new(&config.benchmark.monitors, options.monitors.clone())?;
        let plugins = PluginRunner::new(&config.plugins, &options.home)?;
        let container = ContainerSettings::from(&config.containers);

        let name = options
            .name
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
        let root_rel = config.results_dir.join(name);
        let root = options.home.join(&root_rel);
        if root.exists() && !options.overwrite {
            return Err(CampaignError::ResultsExist(root));
        }

        let campaign = Campaign {
            config,
            options,
            plan,
            resources,
            monitors,
            plugins,
            container,
            root_rel,
            cancel: CancellationToken::new(),
        };
        campaign.validate_templates()?;
        Ok(campaign)
    }

    /// Renders every template once per application and execution kind with the first run
    /// of the sweep.
    fn validate_templates(&self) -> Result<(), CampaignError> {
        let runs = self.plan.runs();
        let Some(first) = runs.first() else {
            return Ok(());
        };
        let home = &self.options.home;
        self.plugins
            .validate(&self.plugin_placeholders(first, &home.join(&self.root_rel)))?;

        let assignment = self.resources.assign(1)?[0].clone();
        for (app_index, app) in self.config.applications.iter().enumerate() {
            for kind in self.plan.exec_envs() {
                let run = RunDescriptor {
                    app_index,
                    application: app.display_name().to_string(),
                    exec_kind: *kind,
                    ..first.clone()
                };
                let mut unit = ExecutionUnit::new(
                    *kind,
                    assignment.clone(),
                    home,
                    self.root_rel.clone(),
                    &self.container,
                );
                let ph = unit.placeholders(&run);
                unit.build_command(&run, app).map_err(|e| match e {
                    LaunchError::Config(e) => CampaignError::Config(e),
                    other => CampaignError::Other(other.into()),
                })?;
                self.monitors.create(home, &ph)?;
            }
        }
        Ok(())
    }

    /// Cancelling the token aborts the campaign at the next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Campaign directory on the host.
    pub fn root(&self) -> PathBuf {
        self.options.home.join(&self.root_rel)
    }

    fn plugin_placeholders(&self, run: &RunDescriptor, run_dir: &Path) -> Placeholders {
        run.placeholders()
            .with("homedir", self.options.home.display())
            .with("res_dir", run_dir.display())
    }

    fn prepare_root(&self) -> Result<(), CampaignError> {
        let root = self.root();
        if root.exists() {
            if !self.options.overwrite {
                return Err(CampaignError::ResultsExist(root));
            }
            info!("Removing previous results in {}", root.display());
            fs::remove_dir_all(&root)
                .with_context(|| format!("Unable to clean {}", root.display()))?;
        }
        fs::create_dir_all(&root).with_context(|| format!("Unable to create {}", root.display()))?;

        match &self.options.config_path {
            Some(path) => {
                let file_name = path.file_name().unwrap_or(path.as_os_str());
                fs::copy(path, root.join(file_name))
                    .with_context(|| format!("Unable to copy {}", path.display()))?;
            }
            None => {
                let json = serde_json::to_string_pretty(&self.config)
                    .context("Unable to serialize the campaign")?;
                fs::write(root.join("campaign.json"), json)
                    .context("Unable to write campaign.json")?;
            }
        }
        Ok(())
    }

    /// Executes every run of the sweep in order.
    pub async fn run(&mut self) -> Result<CampaignReport, CampaignError> {
        self.prepare_root()?;
        let root = self.root();
        info!("Results of this campaign go to {}", root.display());

        let runs = self.plan.runs();
        let mut outcomes = Vec::with_capacity(runs.len());
        for run in runs.iter() {
            if self.cancel.is_cancelled() {
                return Err(CampaignError::Aborted);
            }
            println!(
                "> running {} - {} x{} - run {}/{}",
                run.application.green(),
                run.exec_kind,
                run.unit_count,
                run.index + 1,
                runs.len()
            );
            let outcome = self.execute_run(run).await?;
            if let RunStatus::Failed(reason) = &outcome.status {
                error!("Run {} failed: {}", run.index, reason);
            }
            outcomes.push(outcome);
        }

        Ok(CampaignReport { root, outcomes })
    }

    async fn execute_run(&mut self, run: &RunDescriptor) -> Result<RunOutcome, CampaignError> {
        let app = self
            .config
            .applications
            .get(run.app_index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("run {} has no application", run.index))?;
        let run_rel = self
            .root_rel
            .join(&run.application)
            .join(run.index.to_string());
        let run_dir = self.options.home.join(&run_rel);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Unable to create {}", run_dir.display()))?;

        let units = self
            .resources
            .assign(run.unit_count)?
            .iter()
            .map(|a| {
                ExecutionUnit::new(
                    run.exec_kind,
                    a.clone(),
                    &self.options.home,
                    run_rel.join(a.unit_index.to_string()),
                    &self.container,
                )
            })
            .collect();
        let mut state = RunState {
            units,
            monitors: vec![],
        };
        let ph = self.plugin_placeholders(run, &run_dir);

        let res = self.drive_run(run, &app, &ph, &run_dir, &mut state).await;

        // release whatever the run still holds, then clean up exactly once
        let aborted = matches!(
            res,
            Err(RunError::Fatal(CampaignError::Aborted))
                | Err(RunError::Fatal(CampaignError::PreHook(_)))
        );
        for unit in state.units.iter_mut() {
            // a failed start may still hold a container
            if matches!(unit.state(), UnitState::CommandBuilt | UnitState::Started) {
                unit.discard(self.options.stop_grace).await;
            }
        }
        for set in state.monitors.iter_mut() {
            set.stop_all().await;
        }
        if aborted {
            self.plugins.terminate(Hook::Pre).await;
        } else {
            self.plugins.stop(Hook::Pre).await;
        }
        self.plugins
            .run_to_completion(Hook::Cleanup, &ph, &run_dir)
            .await;

        match res {
            Ok(lines) => Ok(RunOutcome {
                run: run.clone(),
                status: RunStatus::Completed,
                lines,
            }),
            Err(RunError::Failed(reason)) => {
                write_marker(&run_dir, &reason);
                for unit in state.units.iter() {
                    unit.mark_failed(&reason);
                }
                Ok(RunOutcome {
                    run: run.clone(),
                    status: RunStatus::Failed(reason),
                    lines: vec![],
                })
            }
            Err(RunError::Fatal(e)) => {
                let reason = e.to_string();
                write_marker(&run_dir, &reason);
                for unit in state.units.iter() {
                    unit.mark_failed(&reason);
                }
                Err(e)
            }
        }
    }

    async fn drive_run(
        &mut self,
        run: &RunDescriptor,
        app: &ApplicationConfig,
        ph: &Placeholders,
        run_dir: &Path,
        state: &mut RunState,
    ) -> Result<Vec<MetricLine>, RunError> {
        let cancel = self.cancel.clone();

        // pre hooks, each launched before the next
        tokio::select! {
            res = self.plugins.launch(Hook::Pre, ph, run_dir) => {
                res.map_err(|e| RunError::Fatal(CampaignError::PreHook(e)))?
            }
            _ = cancel.cancelled() => return Err(RunError::Fatal(CampaignError::Aborted)),
        }

        for unit in state.units.iter_mut() {
            fs::create_dir_all(unit.results_dir()).map_err(LaunchError::from)?;
            unit.build_command(run, app)?;
            let set = self
                .monitors
                .create(&unit.results_dir(), &unit.placeholders(run))
                .map_err(|e| RunError::Failed(e.to_string()))?;
            state.monitors.push(set);
        }
        for set in state.monitors.iter_mut() {
            set.start_all().await;
        }

        // a start is never interrupted halfway, the unit must know what it has to release
        for unit in state.units.iter_mut() {
            unit.start().await?;
            if cancel.is_cancelled() {
                return Err(RunError::Fatal(CampaignError::Aborted));
            }
        }

        let deadline =
            (!app.self_terminating).then(|| Instant::now() + Duration::from_secs(run.duration));
        let wait_all = async {
            for unit in state.units.iter_mut() {
                let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                if !unit.wait(timeout).await? {
                    debug!("Unit {} reached the run duration", unit.index());
                }
            }
            Ok::<(), LaunchError>(())
        };
        tokio::select! {
            res = wait_all => res?,
            _ = cancel.cancelled() => return Err(RunError::Fatal(CampaignError::Aborted)),
        }

        for unit in state.units.iter_mut() {
            if let Err(e) = unit.stop(self.options.stop_grace).await {
                warn!("Unit {} did not stop cleanly: {}", unit.index(), e);
            }
        }

        let mut monitor_lines = Vec::with_capacity(state.monitors.len());
        for set in state.monitors.iter_mut() {
            set.stop_all().await;
            monitor_lines.push(set.collect_all());
        }

        let lines = record_run(
            run,
            &mut state.units,
            monitor_lines,
            &self.root().join(RESULTS_FILE),
        )?;

        self.plugins.stop(Hook::Pre).await;

        tokio::select! {
            _ = self.plugins.run_to_completion(Hook::Post, ph, run_dir) => {}
            _ = cancel.cancelled() => return Err(RunError::Fatal(CampaignError::Aborted)),
        }

        Ok(lines)
    }
}

/// Points every adapter at the executable it resolves to, so that a missing adapter fails
/// the campaign before anything is launched.
fn resolve_adapters(apps: &mut [ApplicationConfig], home: &Path) -> Result<(), ConfigError> {
    for app in apps.iter_mut() {
        let Some(adapter) = &app.adapter else {
            continue;
        };
        let path = process_control::find_executable(
            &adapter.to_string_lossy(),
            None,
            Some(ADAPTER_DIR_VAR),
            Path::new(ADAPTER_DEFAULT_DIR),
            home,
        )?;
        debug!("Adapter of {} resolved to {}", app.display_name(), path.display());
        app.adapter = Some(path);
    }
    Ok(())
}

/// Builds the metric line of every unit of a run. The campaign results only receive the
/// lines once all units are collected, a run appears there completely or not at all.
fn record_run(
    run: &RunDescriptor,
    units: &mut [ExecutionUnit],
    monitor_lines: Vec<MetricLine>,
    results: &Path,
) -> Result<Vec<MetricLine>, RunError> {
    let mut lines = Vec::with_capacity(units.len());
    for (unit, monitor_line) in units.iter_mut().zip(monitor_lines) {
        let mut line = run.metric_fields();
        line.push("index", unit.index());
        line.extend(unit.collect_results()?);
        line.extend(monitor_line);

        let unit_metrics = unit.results_dir().join(METRICS_FILE);
        write_metrics(&unit_metrics, std::slice::from_ref(&line), false)
            .map_err(|e| RunError::Failed(e.to_string()))?;
        lines.push(line);
    }
    write_metrics(results, &lines, true).map_err(|e| RunError::Failed(e.to_string()))?;
    Ok(lines)
}

fn write_metrics(path: &Path, lines: &[MetricLine], append: bool) -> std::io::Result<()> {
    let mut out = String::new();
    for line in lines {
        out.push_str(&format!("{}\n", line));
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    file.write_all(out.as_bytes())
}

fn write_marker(dir: &Path, reason: &str) {
    if let Err(e) = fs::write(dir.join(FAILED_MARKER), format!("{}\n", reason)) {
        warn!("Unable to mark {} as failed: {}", dir.display(), e);
    }
}

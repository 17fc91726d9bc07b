/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod container;
mod process;

pub use container::{ContainerSettings, ContainerUnit};
pub use process::ProcessUnit;

use crate::{
    config::{ApplicationConfig, ExecKind},
    error::{ConfigError, LaunchError},
    metrics::MetricLine,
    resources::ResourceAssignment,
    sweep::RunDescriptor,
    template::Placeholders,
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::Duration,
};
use subprocess::{Exec, Redirection};
use tracing::{debug, info, warn};

/// Home directory of the campaign as seen from inside a container.
pub const CONTAINER_HOME: &str = "/home";

pub const STDOUT_LOG: &str = "stdout.log";
pub const FAILED_MARKER: &str = "FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    CommandBuilt,
    Started,
    Stopped,
    ResultsCollected,
}

enum Backend {
    Process(ProcessUnit),
    Container(ContainerUnit),
}

/// One instance of the application under test, running as a host process or inside a
/// container, bound to its own cores and results directory for the duration of one run.
pub struct ExecutionUnit {
    index: usize,
    kind: ExecKind,
    state: UnitState,
    host_home: PathBuf,
    results_rel: PathBuf,
    assignment: ResourceAssignment,
    command: Option<String>,
    adapter: Option<PathBuf>,
    backend: Backend,
}
impl ExecutionUnit {
    /// * `host_home` - absolute campaign home on the host
    /// * `results_rel` - the unit's results directory, relative to `host_home`
    pub fn new(
        kind: ExecKind,
        assignment: ResourceAssignment,
        host_home: &Path,
        results_rel: PathBuf,
        container: &ContainerSettings,
    ) -> Self {
        let backend = match kind {
            ExecKind::Process => Backend::Process(ProcessUnit::new()),
            ExecKind::Container => Backend::Container(ContainerUnit::new(
                container.clone(),
                assignment.unit_index,
            )),
        };

        ExecutionUnit {
            index: assignment.unit_index,
            kind,
            state: UnitState::Created,
            host_home: host_home.to_path_buf(),
            results_rel,
            assignment,
            command: None,
            adapter: None,
            backend,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> ExecKind {
        self.kind
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn assignment(&self) -> &ResourceAssignment {
        &self.assignment
    }

    /// Results directory on the host.
    pub fn results_dir(&self) -> PathBuf {
        self.host_home.join(&self.results_rel)
    }

    /// Campaign home as seen by the application.
    pub fn homedir(&self) -> String {
        match self.kind {
            ExecKind::Process => self.host_home.display().to_string(),
            ExecKind::Container => CONTAINER_HOME.to_string(),
        }
    }

    /// Results directory as seen by the application.
    pub fn res_dir(&self) -> String {
        Path::new(&self.homedir())
            .join(&self.results_rel)
            .display()
            .to_string()
    }

    /// Run placeholders extended with the ones specific to this unit.
    pub fn placeholders(&self, run: &RunDescriptor) -> Placeholders {
        let mut ph = run
            .placeholders()
            .with("index", self.index)
            .with("homedir", self.homedir())
            .with("res_dir", self.res_dir())
            .with("cores", self.assignment.core_list());
        if let Some(port) = self.assignment.port {
            ph.set("port", port);
        }
        ph
    }

    fn advance(&mut self, from: UnitState, to: UnitState) -> Result<(), LaunchError> {
        if self.state != from {
            return Err(LaunchError::IllegalState {
                unit: self.index,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Renders the wrappers, binary and arguments of `app` into the command line this unit
    /// will execute.
    pub fn build_command(
        &mut self,
        run: &RunDescriptor,
        app: &ApplicationConfig,
    ) -> Result<&str, LaunchError> {
        if self.state != UnitState::Created {
            return Err(LaunchError::IllegalState {
                unit: self.index,
                from: self.state,
                to: UnitState::CommandBuilt,
            });
        }

        let ph = self.placeholders(run);
        let mut parts = Vec::with_capacity(app.wrappers.len() + 2);
        for wrapper in app.wrappers.iter() {
            parts.push(ph.render(wrapper)?);
        }
        parts.push(ph.render(&app.binary)?);
        parts.push(ph.render(&app.args)?);

        let command = parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if command.is_empty() {
            return Err(ConfigError::Invalid("application command is empty".to_string()).into());
        }
        debug!("Unit {} command: {}", self.index, command);

        self.adapter = app.adapter.clone();
        self.command = Some(command);
        self.advance(UnitState::Created, UnitState::CommandBuilt)?;
        Ok(self.command.as_deref().unwrap_or_default())
    }

    pub async fn start(&mut self) -> Result<(), LaunchError> {
        if self.state != UnitState::CommandBuilt {
            return Err(LaunchError::IllegalState {
                unit: self.index,
                from: self.state,
                to: UnitState::Started,
            });
        }
        let command = self.command.clone().unwrap_or_default();
        let results_dir = self.results_dir();
        fs::create_dir_all(&results_dir)?;
        let log = results_dir.join(STDOUT_LOG);

        info!(
            "Starting {} unit {} on cores {}",
            self.kind,
            self.index,
            self.assignment.core_list()
        );
        match &mut self.backend {
            Backend::Process(unit) => {
                unit.start(&command, &self.assignment, &self.host_home, &log)
                    .await?
            }
            Backend::Container(unit) => {
                unit.start(&command, &self.assignment, &self.host_home, &log)
                    .await?
            }
        }

        self.advance(UnitState::CommandBuilt, UnitState::Started)
    }

    /// Waits for the application to exit on its own. Returns `false` if it was still
    /// running when `timeout` expired.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, LaunchError> {
        if self.state != UnitState::Started {
            return Err(LaunchError::IllegalState {
                unit: self.index,
                from: self.state,
                to: UnitState::Stopped,
            });
        }
        match &mut self.backend {
            Backend::Process(unit) => unit.wait(timeout).await,
            Backend::Container(unit) => unit.wait(timeout).await,
        }
    }

    /// Terminates the application if it is still running and releases its container.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError> {
        if self.state != UnitState::Started {
            return Err(LaunchError::IllegalState {
                unit: self.index,
                from: self.state,
                to: UnitState::Stopped,
            });
        }
        let res = match &mut self.backend {
            Backend::Process(unit) => unit.stop(grace).await,
            Backend::Container(unit) => unit.stop(grace).await,
        };
        // the unit is considered stopped even if tearing it down reported an error
        self.state = UnitState::Stopped;
        res
    }

    /// Best effort release of whatever a failed or interrupted unit still holds.
    pub async fn discard(&mut self, grace: Duration) {
        let res = match &mut self.backend {
            Backend::Process(unit) => unit.stop(grace).await,
            Backend::Container(unit) => unit.stop(grace).await,
        };
        if let Err(e) = res {
            warn!("Failed to release unit {}: {}", self.index, e);
        }
        if self.state == UnitState::Started {
            self.state = UnitState::Stopped;
        }
    }

    /// The application's metric line: the last non-empty line of its output, after the
    /// output went through the adapter if one is configured.
    pub fn collect_results(&mut self) -> Result<MetricLine, LaunchError> {
        self.advance(UnitState::Stopped, UnitState::ResultsCollected)?;

        let log = self.results_dir().join(STDOUT_LOG);
        let output = match &self.adapter {
            Some(adapter) => {
                let adapter = self.host_home.join(adapter);
                debug!("Piping {} through {}", log.display(), adapter.display());
                let capture = Exec::cmd(&adapter)
                    .cwd(&self.host_home)
                    .stdin(File::open(&log)?)
                    .stdout(Redirection::Pipe)
                    .stderr(Redirection::Merge)
                    .capture()
                    .map_err(|e| LaunchError::Spawn {
                        command: adapter.display().to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e),
                    })?;
                capture.stdout_str()
            }
            None => fs::read_to_string(&log)?,
        };

        let last = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or_default();
        Ok(MetricLine::parse(last))
    }

    /// Marks the unit's results directory as belonging to a failed run.
    pub fn mark_failed(&self, reason: &str) {
        let dir = self.results_dir();
        let res = fs::create_dir_all(&dir)
            .and_then(|_| fs::write(dir.join(FAILED_MARKER), format!("{}\n", reason)));
        if let Err(e) = res {
            warn!("Unable to write failure marker in {}: {}", dir.display(), e);
        }
    }
}

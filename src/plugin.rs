/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{Hook, PluginConfig},
    error::{ConfigError, LaunchError},
    process_control::{self, GroupChild, Redirect},
    template::Placeholders,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Directory searched for plugin executables before `<home>/scripts/plugins` and `PATH`.
pub const PLUGIN_DIR_VAR: &str = "CSB_PLUGINS";
const PLUGIN_DEFAULT_DIR: &str = "scripts/plugins";

/// Grace period a forcefully stopped plugin gets before it is killed.
const FORCE_STOP_GRACE: Duration = Duration::from_secs(5);

/// A helper process launched around the benchmark, e.g. a client for a server benchmark.
#[derive(Debug)]
pub struct Plugin {
    config: PluginConfig,
    executable: PathBuf,
    child: Option<GroupChild>,
    log: Option<PathBuf>,
}
impl Plugin {
    /// Fails if the executable cannot be found.
    pub fn new(config: &PluginConfig, home: &Path) -> Result<Plugin, ConfigError> {
        let executable = process_control::find_executable(
            &config.name,
            config.path.as_deref(),
            Some(PLUGIN_DIR_VAR),
            Path::new(PLUGIN_DEFAULT_DIR),
            home,
        )?;
        debug!("Plugin {} resolved to {}", config.name, executable.display());
        Ok(Plugin {
            config: config.clone(),
            executable,
            child: None,
            log: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn hook(&self) -> Hook {
        self.config.hook
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// The output file of the last launch.
    pub fn log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    pub fn render_args(&self, ph: &Placeholders) -> Result<Vec<String>, ConfigError> {
        self.config.args.iter().map(|arg| ph.render(arg)).collect()
    }

    /// Launches the plugin in its own process group with its output in a new file under
    /// `run_dir`.
    pub async fn launch(&mut self, ph: &Placeholders, run_dir: &Path) -> Result<(), LaunchError> {
        let plugin_err = |reason: String| LaunchError::Plugin {
            name: self.config.name.clone(),
            reason,
        };

        let mut words = vec![self.executable.display().to_string()];
        words.extend(self.render_args(ph)?);

        let (_, log) = process_control::unique_log_file(run_dir, &self.config.name)
            .map_err(|e| plugin_err(e.to_string()))?;
        let mut child = process_control::spawn_in_group(&words, None, &[], &Redirect::File(log.clone()))
            .map_err(|e| plugin_err(e.to_string()))?;
        child
            .ensure_launched()
            .await
            .map_err(|e| plugin_err(e.to_string()))?;

        info!("Launched {} -> Output file: {}", child.command, log.display());
        self.child = Some(child);
        self.log = Some(log);
        Ok(())
    }

    /// Kills the plugin's process group if `force_stop` is set, otherwise waits for it to
    /// exit. Does nothing if the plugin is not running.
    pub async fn stop(&mut self) -> Result<(), LaunchError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = if self.config.force_stop {
            info!("Killing {}, with PID = {}", self.config.name, child.pid);
            child
                .shutdown(libc::SIGTERM, true, FORCE_STOP_GRACE)
                .await?
        } else {
            info!(
                "Waiting for {}, with PID = {} to terminate",
                self.config.name, child.pid
            );
            child.wait().await?
        };
        debug!("Plugin {} exited with {}", self.config.name, status);
        Ok(())
    }

    /// Kills the plugin's process group regardless of `force_stop`.
    pub async fn terminate(&mut self) -> Result<(), LaunchError> {
        if let Some(mut child) = self.child.take() {
            info!("Killing {}, with PID = {}", self.config.name, child.pid);
            child
                .shutdown(libc::SIGTERM, true, FORCE_STOP_GRACE)
                .await?;
        }
        Ok(())
    }
}

/// All plugins of a campaign, driven hook by hook.
#[derive(Debug, Default)]
pub struct PluginRunner {
    plugins: Vec<Plugin>,
}
impl PluginRunner {
    pub fn new(configs: &[PluginConfig], home: &Path) -> Result<PluginRunner, ConfigError> {
        let plugins = configs
            .iter()
            .map(|cfg| Plugin::new(cfg, home))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PluginRunner { plugins })
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    /// Checks that every plugin's arguments render with `ph`.
    pub fn validate(&self, ph: &Placeholders) -> Result<(), ConfigError> {
        for plugin in self.plugins.iter() {
            plugin.render_args(ph)?;
        }
        Ok(())
    }

    /// Launches the plugins of `hook` one after the other. Stops at the first failure.
    pub async fn launch(
        &mut self,
        hook: Hook,
        ph: &Placeholders,
        run_dir: &Path,
    ) -> Result<(), LaunchError> {
        for plugin in self.plugins.iter_mut().filter(|p| p.hook() == hook) {
            plugin.launch(ph, run_dir).await?;
        }
        Ok(())
    }

    /// Stops every running plugin of `hook`. Failures are logged.
    pub async fn stop(&mut self, hook: Hook) {
        for plugin in self.plugins.iter_mut().filter(|p| p.hook() == hook) {
            if let Err(e) = plugin.stop().await {
                warn!("Failed to stop {} plugin {}: {}", hook, plugin.name(), e);
            }
        }
    }

    /// Kills every running plugin of `hook`, used when the campaign is aborted.
    pub async fn terminate(&mut self, hook: Hook) {
        for plugin in self.plugins.iter_mut().filter(|p| p.hook() == hook) {
            if let Err(e) = plugin.terminate().await {
                warn!("Failed to kill {} plugin {}: {}", hook, plugin.name(), e);
            }
        }
    }

    /// Launches the plugins of `hook` and waits for (or stops) them. Failures are logged.
    pub async fn run_to_completion(&mut self, hook: Hook, ph: &Placeholders, run_dir: &Path) {
        if let Err(e) = self.launch(hook, ph, run_dir).await {
            warn!("A {} plugin failed: {}", hook, e);
        }
        self.stop(hook).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(name: &str, hook: Hook, args: &[&str], force_stop: bool) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            hook,
            path: None,
            args: args.iter().map(|a| a.to_string()).collect(),
            force_stop,
        }
    }

    #[test]
    fn missing_plugin_is_a_config_error() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let res = Plugin::new(
            &plugin("no-such-plugin.sh", Hook::Pre, &[], false),
            home.path(),
        );
        assert!(matches!(res, Err(ConfigError::MissingExecutable { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn output_goes_to_a_file_in_the_run_dir() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let ph = Placeholders::new().with("threads", 8);
        let mut p = Plugin::new(
            &plugin("sh", Hook::Post, &["-c", "echo threads={threads}"], false),
            home.path(),
        )?;
        p.launch(&ph, home.path()).await?;
        p.stop().await?;
        assert!(!p.is_running());

        let log = p.log().expect("log should be set");
        assert!(log.starts_with(home.path()));
        assert_eq!(std::fs::read_to_string(log)?.trim(), "threads=8");
        Ok(())
    }

    #[tokio::test]
    async fn force_stop_kills_the_plugin() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let mut p = Plugin::new(&plugin("sleep", Hook::Pre, &["60"], true), home.path())?;
        p.launch(&Placeholders::new(), home.path()).await?;
        assert!(p.is_running());

        tokio::time::timeout(Duration::from_secs(10), p.stop()).await??;
        assert!(!p.is_running());
        // a second stop is a no-op
        p.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn immediate_failure_is_a_plugin_error() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let mut p = Plugin::new(&plugin("sh", Hook::Pre, &["-c", "exit 1"], false), home.path())?;
        let res = p.launch(&Placeholders::new(), home.path()).await;
        assert!(matches!(res, Err(LaunchError::Plugin { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn runner_only_touches_the_requested_hook() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let mut runner = PluginRunner::new(
            &[
                plugin("sleep", Hook::Pre, &["60"], true),
                plugin("sh", Hook::Cleanup, &["-c", "echo done"], false),
            ],
            home.path(),
        )?;
        runner.launch(Hook::Pre, &Placeholders::new(), home.path()).await?;
        assert!(runner.plugins()[0].is_running());
        assert!(!runner.plugins()[1].is_running());

        runner.stop(Hook::Pre).await;
        assert!(!runner.plugins()[0].is_running());
        Ok(())
    }
}

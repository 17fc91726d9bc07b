use super::{Monitor, Phase, SampledCommand};
use crate::{error::MonitorError, metrics::MetricLine, process_control::Redirect};
use async_trait::async_trait;
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use subprocess::{Exec, Redirection};
use tracing::{error, info};

const NAME: &str = "perf";

/// Records call stacks with `perf` while the benchmark runs and renders them as
/// `flamegraph.svg` once stopped. Contributes no metrics.
pub struct FlameGraph {
    dir: PathBuf,
    args: Vec<String>,
    scripts: PathBuf,
    stop_timeout: Duration,
    cmd: SampledCommand,
    phase: Phase,
}
impl FlameGraph {
    /// `scripts` is the directory holding `stackcollapse-perf.pl` and `flamegraph.pl`.
    pub fn new(dir: &Path, args: Vec<String>, scripts: PathBuf, stop_timeout: Duration) -> Self {
        FlameGraph {
            dir: dir.to_path_buf(),
            args,
            scripts,
            stop_timeout,
            cmd: SampledCommand::new(NAME),
            phase: Phase::Idle,
        }
    }
}

/// `perf script | stackcollapse-perf.pl > flamegraph.stacks`, then
/// `flamegraph.pl < flamegraph.stacks > flamegraph.svg`. Errors of every step go to
/// `flamegraph.errors`.
fn render(dir: &Path, scripts: &Path) -> Result<(), MonitorError> {
    let errors = File::create(dir.join("flamegraph.errors"))?;
    let stacks_path = dir.join("flamegraph.stacks");
    let render_err = |step: &str, reason: String| MonitorError::Output {
        monitor: NAME.to_string(),
        reason: format!("{}: {}", step, reason),
    };

    let collapse = Exec::cmd("sudo")
        .args(&["perf", "script", "-i", "perf.data"])
        .cwd(dir)
        .stderr(Redirection::File(errors.try_clone()?))
        | Exec::cmd(scripts.join("stackcollapse-perf.pl"))
            .stderr(Redirection::File(errors.try_clone()?));
    let status = collapse
        .stdout(File::create(&stacks_path)?)
        .join()
        .map_err(|e| render_err("stackcollapse", e.to_string()))?;
    if !status.success() {
        return Err(render_err("stackcollapse", format!("{:?}", status)));
    }

    let status = Exec::cmd(scripts.join("flamegraph.pl"))
        .stdin(File::open(&stacks_path)?)
        .stdout(File::create(dir.join("flamegraph.svg"))?)
        .stderr(Redirection::File(errors))
        .join()
        .map_err(|e| render_err("flamegraph", e.to_string()))?;
    if !status.success() {
        return Err(render_err("flamegraph", format!("{:?}", status)));
    }

    info!("Flame graph written to {}", dir.join("flamegraph.svg").display());
    Ok(())
}

#[async_trait]
impl Monitor for FlameGraph {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&mut self) -> Result<(), MonitorError> {
        let mut words = ["sudo", "perf", "record", "-F", "99", "-g"]
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>();
        words.extend(self.args.iter().cloned());

        let res = self
            .cmd
            .start(&words, &self.dir, &[], &Redirect::Null)
            .await;
        self.phase = if res.is_ok() {
            Phase::Running
        } else {
            Phase::Failed
        };
        res
    }

    async fn stop(&mut self) -> Result<(), MonitorError> {
        if self.phase != Phase::Running {
            return Ok(());
        }
        if let Err(e) = self.cmd.interrupt(self.stop_timeout).await {
            self.phase = Phase::Failed;
            return Err(e);
        }
        self.phase = Phase::Stopped;

        let dir = self.dir.clone();
        let scripts = self.scripts.clone();
        match tokio::task::spawn_blocking(move || render(&dir, &scripts)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Failed to generate flamegraph: {}", e);
                Err(e)
            }
            Err(e) => Err(MonitorError::Output {
                monitor: NAME.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn collect_results(&self) -> MetricLine {
        MetricLine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_start_does_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fg = FlameGraph::new(
            dir.path(),
            vec!["-a".to_string()],
            PathBuf::from("/opt/FlameGraph"),
            Duration::from_secs(1),
        );
        fg.stop().await?;
        assert!(fg.collect_results().is_empty());
        assert!(!dir.path().join("flamegraph.errors").exists());
        Ok(())
    }
}

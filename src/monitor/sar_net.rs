use super::{Monitor, Phase, SampledCommand};
use crate::{
    error::MonitorError,
    metrics::{Aggregation, MetricLine, Table},
    process_control::Redirect,
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use subprocess::{Exec, NullFile, Redirection};
use tracing::warn;

const NAME: &str = "sar_net";
const OUTPUT_FILE: &str = "netstats.sar";

const RATE_COLUMNS: [&str; 17] = [
    "rxpck/s",
    "txpck/s",
    "rxkB/s",
    "txkB/s",
    "rxcmp/s",
    "txcmp/s",
    "rxmcst/s",
    "%ifutil[...]",
    "rxerr/s",
    "txerr/s",
    "rxdrop/s",
    "txdrop/s",
    "coll/s",
    "txcarr/s",
    "rxfram/s",
    "rxfifo/s",
    "txfifo/s[...]",
];

/// Network and network error rates of one interface, sampled by `sar` inside a network
/// namespace. Arguments: the namespace, then the interface.
pub struct SarNetStats {
    dir: PathBuf,
    netns: String,
    iface: String,
    stop_timeout: Duration,
    cmd: SampledCommand,
    phase: Phase,
}
impl SarNetStats {
    pub fn new(dir: &Path, args: &[String], stop_timeout: Duration) -> Result<Self, MonitorError> {
        let [netns, iface, ..] = args else {
            return Err(MonitorError::MissingArgument {
                monitor: NAME.to_string(),
                expected: "network namespace and interface".to_string(),
            });
        };
        Ok(SarNetStats {
            dir: dir.to_path_buf(),
            netns: netns.clone(),
            iface: iface.clone(),
            stop_timeout,
            cmd: SampledCommand::new(NAME),
            phase: Phase::Idle,
        })
    }

    fn iface_arg(&self) -> String {
        format!("--iface={}", self.iface)
    }

    fn read_report(&self) -> Result<MetricLine, String> {
        let iface = self.iface_arg();
        let capture = Exec::cmd("sadf")
            .args(&["-dh", OUTPUT_FILE, "--", "-n", "DEV,EDEV", iface.as_str()])
            .cwd(&self.dir)
            .stdout(Redirection::Pipe)
            .stderr(NullFile)
            .capture()
            .map_err(|e| e.to_string())?;
        if !capture.exit_status.success() {
            return Err(format!("sadf exited with {:?}", capture.exit_status));
        }
        Ok(aggregate_report(&capture.stdout_str()))
    }
}

fn aggregate_report(report: &str) -> MetricLine {
    let policy = RATE_COLUMNS
        .iter()
        .map(|c| (c.to_string(), Aggregation::Mean))
        .collect::<Vec<_>>();
    match Table::from_reader(report.as_bytes(), b';') {
        Ok(table) => table.aggregate(&policy),
        Err(e) => {
            warn!("Unable to parse sadf output: {}", e);
            MetricLine::new()
        }
    }
}

#[async_trait]
impl Monitor for SarNetStats {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&mut self) -> Result<(), MonitorError> {
        let iface = self.iface_arg();
        let words = [
            "sudo",
            "ip",
            "netns",
            "exec",
            self.netns.as_str(),
            "sar",
            "-n",
            "DEV,EDEV",
            "-o",
            OUTPUT_FILE,
            iface.as_str(),
            "1",
        ]
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>();

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
        let res = self.cmd.interrupt(self.stop_timeout).await;
        self.phase = if res.is_ok() {
            Phase::Stopped
        } else {
            Phase::Failed
        };
        res
    }

    fn collect_results(&self) -> MetricLine {
        if self.phase != Phase::Stopped {
            warn!("{} has no results to collect", NAME);
            return MetricLine::new();
        }
        self.read_report().unwrap_or_else(|e| {
            warn!("Unable to read {} report: {}", NAME, e);
            MetricLine::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_namespace_and_interface() {
        let res = SarNetStats::new(Path::new("/tmp"), &["ns0".to_string()], Duration::from_secs(1));
        assert!(matches!(res, Err(MonitorError::MissingArgument { .. })));
    }

    #[test]
    fn rates_are_averaged() {
        let report = "\
# hostname;interval;timestamp;IFACE;rxpck/s;txpck/s;rxkB/s;txkB/s;rxcmp/s;txcmp/s;rxmcst/s;%ifutil[...]
bench;1;2026-01-01 10:00:01 UTC;eth0;100.00;50.00;10.00;5.00;0.00;0.00;0.00;1.00
bench;1;2026-01-01 10:00:02 UTC;eth0;300.00;150.00;30.00;15.00;0.00;0.00;0.00;3.00
";
        let line = aggregate_report(report);
        assert_eq!(line.get("rxpck/s"), Some("200.0"));
        assert_eq!(line.get("txkB/s"), Some("10.0"));
        assert_eq!(line.get("%ifutil[...]"), Some("2.0"));
        // the EDEV columns are absent from this report
        assert!(line.get("rxerr/s").is_none());
    }

    #[test]
    fn nothing_is_collected_before_start() -> anyhow::Result<()> {
        let monitor = SarNetStats::new(
            Path::new("/tmp"),
            &["ns0".to_string(), "eth0".to_string()],
            Duration::from_secs(1),
        )?;
        assert!(monitor.collect_results().is_empty());
        Ok(())
    }
}

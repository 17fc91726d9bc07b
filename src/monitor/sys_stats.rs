use super::{Monitor, Phase, SampledCommand};
use crate::{error::MonitorError, metrics::MetricLine, process_control::Redirect};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

const NAME: &str = "mpstat";
const OUTPUT_FILE: &str = "mpstat.json";
const INTERVAL_SECS: &str = "1";

/// Per CPU load and interrupt statistics sampled by `mpstat` every second.
pub struct SystemStats {
    dir: PathBuf,
    args: Vec<String>,
    stop_timeout: Duration,
    cmd: SampledCommand,
    phase: Phase,
}
impl SystemStats {
    pub fn new(dir: &Path, args: Vec<String>, stop_timeout: Duration) -> Self {
        SystemStats {
            dir: dir.to_path_buf(),
            args,
            stop_timeout,
            cmd: SampledCommand::new(NAME),
            phase: Phase::Idle,
        }
    }
}

#[async_trait]
impl Monitor for SystemStats {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&mut self) -> Result<(), MonitorError> {
        let mut words = vec!["mpstat".to_string(), "-o".to_string(), "JSON".to_string()];
        words.extend(self.args.iter().cloned());
        words.push(INTERVAL_SECS.to_string());

        let envs = [("LANG", "en_US.UTF-8"), ("LC_ALL", "en_US.UTF-8")];
        let redirect = Redirect::Stdout(self.dir.join(OUTPUT_FILE));
        match self.cmd.start(&words, &self.dir, &envs, &redirect).await {
            Ok(()) => {
                self.phase = Phase::Running;
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Failed;
                Err(e)
            }
        }
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
        let path = self.dir.join(OUTPUT_FILE);
        let res = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| parse_report(&text));
        match res {
            Ok(line) => line,
            Err(e) => {
                warn!("Unable to read {}: {}", path.display(), e);
                MetricLine::new()
            }
        }
    }
}

/// Running mean of every numeric field, per CPU. CPUs and columns keep the order in which
/// mpstat first reported them.
#[derive(Default)]
struct PerCpu {
    sums: Vec<(String, Vec<(String, f64, usize)>)>,
}
impl PerCpu {
    fn add(&mut self, cpu: &str, column: &str, value: f64) {
        let pos = match self.sums.iter().position(|(c, _)| c == cpu) {
            Some(pos) => pos,
            None => {
                self.sums.push((cpu.to_string(), vec![]));
                self.sums.len() - 1
            }
        };
        let columns = &mut self.sums[pos].1;
        match columns.iter_mut().find(|(c, ..)| c == column) {
            Some((_, sum, n)) => {
                *sum += value;
                *n += 1;
            }
            None => columns.push((column.to_string(), value, 1)),
        }
    }

    /// `<column>_c<cpu>=<mean>` for every CPU and column.
    fn flatten(&self) -> MetricLine {
        let mut line = MetricLine::new();
        for (cpu, columns) in self.sums.iter() {
            for (column, sum, n) in columns.iter() {
                line.push_number(format!("{}_c{}", column, cpu), sum / *n as f64);
            }
        }
        line
    }
}

fn cpu_of(entry: &Value) -> Option<String> {
    match entry.get("cpu")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Flattens an `mpstat -o JSON` report: the per CPU means of `cpu-load`, then of
/// `sum-interrupts`, then of every soft interrupt.
fn parse_report(text: &str) -> Result<MetricLine, String> {
    let report: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let hosts = report
        .pointer("/sysstat/hosts")
        .and_then(Value::as_array)
        .ok_or_else(|| "no sysstat hosts in report".to_string())?;

    let mut load = PerCpu::default();
    let mut interrupts = PerCpu::default();
    let mut soft = PerCpu::default();

    let statistics = hosts
        .iter()
        .filter_map(|h| h.get("statistics").and_then(Value::as_array))
        .flatten();
    for stat in statistics {
        let entries = |key: &str| {
            stat.get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        for entry in entries("cpu-load").iter().chain(entries("sum-interrupts").iter()) {
            let Some(cpu) = cpu_of(entry) else { continue };
            let Some(fields) = entry.as_object() else { continue };
            let target = if fields.contains_key("intr") {
                &mut interrupts
            } else {
                &mut load
            };
            for (column, value) in fields.iter().filter(|(k, _)| k.as_str() != "cpu") {
                if let Some(v) = value.as_f64() {
                    target.add(&cpu, column, v);
                }
            }
        }

        for entry in entries("soft-interrupts").iter() {
            let Some(cpu) = cpu_of(entry) else { continue };
            let intrs = entry
                .get("intr")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for intr in intrs.iter() {
                let name = intr.get("name").and_then(Value::as_str);
                let value = intr.get("value").and_then(Value::as_f64);
                if let (Some(name), Some(value)) = (name, value) {
                    soft.add(&cpu, name, value);
                }
            }
        }
    }

    let mut line = load.flatten();
    line.extend(interrupts.flatten());
    line.extend(soft.flatten());
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{"sysstat": {"hosts": [{
        "nodename": "bench",
        "statistics": [
            {
                "timestamp": "10:00:01 AM",
                "cpu-load": [
                    {"cpu": "all", "usr": 10.0, "sys": 2.0},
                    {"cpu": "0", "usr": 20.0, "sys": 4.0}
                ],
                "sum-interrupts": [{"cpu": "0", "intr": 100.0}],
                "soft-interrupts": [
                    {"cpu": "0", "intr": [{"name": "NET_RX", "value": 5.0}, {"name": "HI", "value": 0.0}]}
                ]
            },
            {
                "timestamp": "10:00:02 AM",
                "cpu-load": [
                    {"cpu": "all", "usr": 30.0, "sys": 4.0},
                    {"cpu": "0", "usr": 40.0, "sys": 8.0}
                ],
                "sum-interrupts": [{"cpu": "0", "intr": 300.0}],
                "soft-interrupts": [
                    {"cpu": "0", "intr": [{"name": "NET_RX", "value": 15.0}, {"name": "HI", "value": 1.0}]}
                ]
            }
        ]
    }]}}"#;

    #[test]
    fn report_is_averaged_per_cpu() -> anyhow::Result<()> {
        let line = parse_report(REPORT).map_err(anyhow::Error::msg)?;
        assert_eq!(line.get("usr_c0"), Some("30.0"));
        assert_eq!(line.get("sys_call"), Some("3.0"));
        assert_eq!(line.get("intr_c0"), Some("200.0"));
        assert_eq!(line.get("NET_RX_c0"), Some("10.0"));
        assert_eq!(line.get("HI_c0"), Some("0.5"));
        assert!(line.get("cpu_c0").is_none());
        Ok(())
    }

    #[test]
    fn columns_keep_the_mpstat_order() -> anyhow::Result<()> {
        let line = parse_report(REPORT).map_err(anyhow::Error::msg)?;
        let keys = line.keys().collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["usr_call", "sys_call", "usr_c0", "sys_c0", "intr_c0", "NET_RX_c0", "HI_c0"]
        );
        Ok(())
    }

    #[test]
    fn broken_report_is_an_error() {
        assert!(parse_report("{\"sysstat\": {\"hosts\": [").is_err());
        assert!(parse_report("{}").is_err());
    }

    #[test]
    fn nothing_is_collected_before_start() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(OUTPUT_FILE), REPORT)?;
        let monitor = SystemStats::new(dir.path(), vec![], Duration::from_secs(1));
        assert!(monitor.collect_results().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires mpstat"]
    async fn samples_the_host() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut monitor = SystemStats::new(dir.path(), vec!["-A".to_string()], Duration::from_secs(5));
        monitor.start().await?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        monitor.stop().await?;
        assert!(!monitor.collect_results().is_empty());
        Ok(())
    }
}

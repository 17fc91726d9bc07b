use super::{Monitor, Phase};
use crate::{
    error::{ConfigError, MonitorError},
    metrics::{Aggregation, MetricLine, Table},
};
use async_trait::async_trait;
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing::warn;

const NAME: &str = "redis_benchmark";

/// How each `redis-benchmark --csv` column is reduced to a single number.
///
/// Averaging or taking the maximum of percentiles over several tests is an approximation;
/// override the entries with `column=agg` arguments where that matters.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPolicy {
    columns: Vec<(String, Aggregation)>,
}
impl Default for AggregationPolicy {
    fn default() -> Self {
        let columns = [
            ("rps", Aggregation::Mean),
            ("avg_latency_ms", Aggregation::Mean),
            ("min_latency_ms", Aggregation::Min),
            ("p50_latency_ms", Aggregation::Mean),
            ("p95_latency_ms", Aggregation::Max),
            ("p99_latency_ms", Aggregation::Max),
            ("max_latency_ms", Aggregation::Max),
        ];
        AggregationPolicy {
            columns: columns
                .into_iter()
                .map(|(c, a)| (c.to_string(), a))
                .collect(),
        }
    }
}
impl AggregationPolicy {
    /// Applies `column=agg` overrides. Unknown columns are appended.
    pub fn with_overrides<S: AsRef<str>>(mut self, overrides: &[S]) -> Result<Self, ConfigError> {
        for entry in overrides {
            let entry = entry.as_ref();
            let (column, agg) = entry.split_once('=').ok_or_else(|| {
                ConfigError::Invalid(format!("expected column=aggregation, got \"{}\"", entry))
            })?;
            let agg: Aggregation = agg.trim().parse().map_err(ConfigError::Invalid)?;
            let column = column.trim();
            match self.columns.iter_mut().find(|(c, _)| c == column) {
                Some(existing) => existing.1 = agg,
                None => self.columns.push((column.to_string(), agg)),
            }
        }
        Ok(self)
    }

    pub fn get(&self, column: &str) -> Option<Aggregation> {
        self.columns
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, a)| *a)
    }

    pub fn columns(&self) -> &[(String, Aggregation)] {
        &self.columns
    }
}

/// Aggregates the CSV report `redis-benchmark` wrote into the unit's results directory.
/// The first argument names the file, the others override the aggregation policy.
pub struct RedisStats {
    file: PathBuf,
    policy: AggregationPolicy,
    phase: Phase,
}
impl RedisStats {
    pub fn new(dir: &Path, args: &[String]) -> Result<Self, MonitorError> {
        let (file, overrides) = args.split_first().ok_or_else(|| MonitorError::MissingArgument {
            monitor: NAME.to_string(),
            expected: "csv file name".to_string(),
        })?;
        Ok(RedisStats {
            file: dir.join(file),
            policy: AggregationPolicy::default().with_overrides(overrides)?,
            phase: Phase::Idle,
        })
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }
}

#[async_trait]
impl Monitor for RedisStats {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&mut self) -> Result<(), MonitorError> {
        self.phase = Phase::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), MonitorError> {
        if self.phase == Phase::Running {
            self.phase = Phase::Stopped;
        }
        Ok(())
    }

    fn collect_results(&self) -> MetricLine {
        if self.phase != Phase::Stopped {
            warn!("{} has no results to collect", NAME);
            return MetricLine::new();
        }
        let table = File::open(&self.file)
            .map_err(|e| e.to_string())
            .and_then(|f| Table::from_reader(f, b',').map_err(|e| e.to_string()));
        match table {
            Ok(table) => table.aggregate(self.policy.columns()),
            Err(e) => {
                warn!("Unable to read {}: {}", self.file.display(), e);
                MetricLine::new()
            }
        }
    }
}

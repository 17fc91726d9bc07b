use itertools::Itertools;
use std::{fmt, io::Read, str::FromStr};
use tracing::{debug, warn};

/// An ordered set of `key=value` pairs, rendered as `key=value;key=value;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricLine {
    pairs: Vec<(String, String)>,
}
impl MetricLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.pairs.push((key.into(), value.to_string()));
    }

    pub fn push_number(&mut self, key: impl Into<String>, value: f64) {
        self.pairs.push((key.into(), format_number(value)));
    }

    pub fn extend(&mut self, other: MetricLine) {
        self.pairs.extend(other.pairs);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    /// Parses `key=value;` (or adapter style `key:value;`) text. Segments without a
    /// separator are dropped.
    pub fn parse(text: &str) -> MetricLine {
        let mut line = MetricLine::new();
        for segment in text.trim().split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match segment.split_once('=').or_else(|| segment.split_once(':')) {
                Some((k, v)) => line.push(k.trim(), v.trim()),
                None => debug!("Ignoring metric segment without a value: {}", segment),
            }
        }
        line
    }
}
impl fmt::Display for MetricLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in self.pairs.iter() {
            write!(f, "{}={};", k, v)?;
        }
        Ok(())
    }
}

/// Floats keep a decimal point (`12.0`, `0.5`) so that downstream tooling reads every
/// aggregated metric as a float.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Min,
    Max,
}
impl Aggregation {
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let res = match self {
            Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Some(res)
    }
}
impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" | "avg" => Ok(Aggregation::Mean),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            other => Err(format!("unknown aggregation \"{}\"", other)),
        }
    }
}

/// A delimited text table with a header row, as written by `redis-benchmark --csv` or
/// `sadf -d`.
#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}
impl Table {
    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Table, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns = rdr.headers()?.iter().map(str::to_string).collect_vec();
        let mut rows = vec![];
        for record in rdr.records() {
            let record = record?;
            // repeated header lines show up when the producing tool restarts its output
            if record.iter().zip(columns.iter()).all(|(a, b)| a == b) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect_vec());
        }

        Ok(Table { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// All numeric values of a column. Cells that do not parse as numbers are skipped.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(
            self.rows
                .iter()
                .filter_map(|row| row.get(idx))
                .filter_map(|cell| cell.parse::<f64>().ok())
                .collect(),
        )
    }

    /// Reduces each listed column with its aggregation. Missing or empty columns are
    /// reported and left out of the line.
    pub fn aggregate(&self, policy: &[(String, Aggregation)]) -> MetricLine {
        let mut line = MetricLine::new();
        for (column, agg) in policy {
            match self.numeric_column(column).and_then(|v| agg.apply(&v)) {
                Some(value) => line.push_number(column.as_str(), value),
                None => warn!("Column {} has no numeric data, skipping it", column),
            }
        }
        line
    }
}

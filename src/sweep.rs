use crate::{
    config::{ApplicationConfig, BenchmarkConfig, ContainersConfig, ExecKind},
    error::ConfigError,
    metrics::MetricLine,
    template::Placeholders,
    value_domain::{DomainSpec, ValueDomain},
};
use itertools::{iproduct, Itertools};

/// One point of the sweep. `index` is the position in the ordered run sequence and, under
/// the application's directory, names the run's results directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    pub index: usize,
    /// Position of the application in the campaign's application list.
    pub app_index: usize,
    pub application: String,
    pub exec_kind: ExecKind,
    pub unit_count: usize,
    pub threads: i64,
    pub duration: u64,
    pub initial_size: i64,
    pub noise: i64,
    pub repeat_index: u32,
}
impl RunDescriptor {
    /// Run-level placeholders, shared by every unit and plugin of the run.
    pub fn placeholders(&self) -> Placeholders {
        Placeholders::new()
            .with("threads", self.threads)
            .with("duration", self.duration)
            .with("noise", self.noise)
            .with("initial_size", self.initial_size)
            .with("n_units", self.unit_count)
    }

    pub fn metric_fields(&self) -> MetricLine {
        let mut line = MetricLine::new();
        line.push("run", self.index);
        line.push("application", &self.application);
        line.push("execution_unit", self.exec_kind);
        line.push("container_cnt", self.unit_count);
        line.push("threads", self.threads);
        line.push("duration", self.duration);
        line.push("initial_size", self.initial_size);
        line.push("noise", self.noise);
        line.push("repeat", self.repeat_index);
        line
    }
}

/// The expanded axes of a campaign. Runs are produced outer to inner in the order
/// application, exec_env, unit_count, threads, initial_size, noise, repeat.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    applications: Vec<String>,
    exec_envs: Vec<ExecKind>,
    unit_counts: ValueDomain<i64>,
    threads: ValueDomain<i64>,
    initial_sizes: ValueDomain<i64>,
    noises: ValueDomain<i64>,
    duration: u64,
    repeat: u32,
}
impl SweepPlan {
    pub fn new(
        applications: &[ApplicationConfig],
        bench: &BenchmarkConfig,
        containers: &ContainersConfig,
    ) -> Result<Self, ConfigError> {
        if applications.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one application is required".to_string(),
            ));
        }
        let threads = match &bench.threads {
            Some(spec) => spec.expand()?,
            None => DomainSpec::literal(vec![1]).expand()?,
        };
        let unit_counts = containers.container_list.expand()?;

        ensure_positive("threads", &threads)?;
        ensure_positive("container_list", &unit_counts)?;
        if bench.repeat == 0 {
            return Err(ConfigError::Invalid("repeat must be at least 1".to_string()));
        }

        let plan = SweepPlan {
            applications: applications
                .iter()
                .map(|app| app.display_name().to_string())
                .collect(),
            exec_envs: bench.exec_env.iter().copied().unique().collect(),
            unit_counts,
            threads,
            initial_sizes: bench.initial_size.expand()?,
            noises: bench.noise.expand()?,
            duration: bench.duration,
            repeat: bench.repeat,
        };
        ensure_non_empty("initial_size", &plan.initial_sizes)?;
        ensure_non_empty("noise", &plan.noises)?;

        Ok(plan)
    }

    pub fn applications(&self) -> &[String] {
        &self.applications
    }

    pub fn exec_envs(&self) -> &[ExecKind] {
        &self.exec_envs
    }

    /// The unit count axis of an execution kind. Processes run a single unit.
    pub fn unit_counts(&self, exec_kind: ExecKind) -> Vec<usize> {
        match exec_kind {
            ExecKind::Process => vec![1],
            ExecKind::Container => self.unit_counts.iter().map(|n| *n as usize).collect(),
        }
    }

    /// Largest number of units any run of this plan starts.
    pub fn max_units(&self) -> usize {
        self.exec_envs
            .iter()
            .flat_map(|kind| self.unit_counts(*kind))
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        let per_kind = self.threads.len()
            * self.initial_sizes.len()
            * self.noises.len()
            * self.repeat as usize;
        let per_app: usize = self
            .exec_envs
            .iter()
            .map(|kind| self.unit_counts(*kind).len() * per_kind)
            .sum();
        self.applications.len() * per_app
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn runs(&self) -> Vec<RunDescriptor> {
        let mut runs = Vec::with_capacity(self.len());
        for ((app_index, application), exec_kind) in
            iproduct!(self.applications.iter().enumerate(), self.exec_envs.iter().copied())
        {
            for (unit_count, threads, initial_size, noise, repeat_index) in iproduct!(
                self.unit_counts(exec_kind),
                self.threads.iter().copied(),
                self.initial_sizes.iter().copied(),
                self.noises.iter().copied(),
                0..self.repeat
            ) {
                runs.push(RunDescriptor {
                    index: runs.len(),
                    app_index,
                    application: application.clone(),
                    exec_kind,
                    unit_count,
                    threads,
                    duration: self.duration,
                    initial_size,
                    noise,
                    repeat_index,
                });
            }
        }
        runs
    }
}

fn ensure_non_empty(axis: &str, domain: &ValueDomain<i64>) -> Result<(), ConfigError> {
    if domain.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", axis)));
    }
    Ok(())
}

fn ensure_positive(axis: &str, domain: &ValueDomain<i64>) -> Result<(), ConfigError> {
    ensure_non_empty(axis, domain)?;
    match domain.iter().find(|v| **v < 1) {
        Some(v) => Err(ConfigError::Invalid(format!(
            "{} values must be at least 1, found {}",
            axis, v
        ))),
        None => Ok(()),
    }
}

use crate::{
    error::ConfigError,
    value_domain::{AxisSpec, DomainSpec},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs,
    path::{Path, PathBuf},
};

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct CampaignConfig {
    /// Campaign working directory. Defaults to the current directory.
    #[serde(default)]
    pub home_dir: Option<PathBuf>,

    /// Results root, relative to the home directory so that containers can see it.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    #[serde(default, rename = "benchmark_config", alias = "benchmark")]
    pub benchmark: BenchmarkConfig,

    #[serde(default)]
    pub containers: ContainersConfig,

    #[serde(default)]
    pub nics: Option<NicsConfig>,

    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    /// Applications under test, each swept over the full benchmark configuration.
    /// Accepts a single `application` table or an `applications` list.
    #[serde(alias = "application", deserialize_with = "one_or_many")]
    pub applications: Vec<ApplicationConfig>,
}
impl CampaignConfig {
    /// Loads a campaign from a `.json` or `.toml` file, chosen by extension.
    pub fn try_from_path(path: &Path) -> Result<CampaignConfig, ConfigError> {
        let conf_str = fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let res = if is_json {
            CampaignConfig::try_from_json(&conf_str)
        } else {
            CampaignConfig::try_from_str(&conf_str)
        };

        res.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?
        .validated()
    }

    pub fn try_from_str(conf_str: &str) -> Result<CampaignConfig, String> {
        toml::from_str::<CampaignConfig>(conf_str).map_err(|e| format!("TOML parsing error: {}", e))
    }

    pub fn try_from_json(conf_str: &str) -> Result<CampaignConfig, String> {
        serde_json::from_str::<CampaignConfig>(conf_str)
            .map_err(|e| format!("JSON parsing error: {}", e))
    }

    fn validated(self) -> Result<CampaignConfig, ConfigError> {
        if self.applications.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one application is required".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for app in self.applications.iter() {
            if app.binary.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "application binary must not be empty".to_string(),
                ));
            }
            let name = app.display_name();
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "\"{}\" cannot name a results directory",
                    name
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "application name {} is used twice, set `name` to tell them apart",
                    name
                )));
            }
        }
        if self.benchmark.exec_env.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one execution environment is required".to_string(),
            ));
        }
        if self.containers.core_count == 0 {
            return Err(ConfigError::Invalid(
                "containers.core_count must be at least 1".to_string(),
            ));
        }
        if self.results_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "results_dir {} must be relative to the home directory",
                self.results_dir.display()
            )));
        }
        Ok(self)
    }

    /// The campaign home, resolved to an absolute host path.
    pub fn resolve_home(&self) -> std::io::Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        Ok(match &self.home_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => cwd,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(ApplicationConfig),
    Many(Vec<ApplicationConfig>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<ApplicationConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(app) => vec![app],
        OneOrMany::Many(apps) => apps,
    })
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Execution environment of the benchmark.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum ExecKind {
    /// Launches the benchmark directly on the host OS.
    #[serde(rename = "native", alias = "process")]
    Process,
    /// Launches the benchmark inside a container.
    #[serde(rename = "container")]
    Container,
}
impl fmt::Display for ExecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecKind::Process => write!(f, "native"),
            ExecKind::Container => write!(f, "container"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BenchmarkConfig {
    /// Duration of one benchmark run in seconds.
    #[serde(default = "default_duration")]
    pub duration: u64,

    #[serde(default = "default_repeat")]
    pub repeat: u32,

    #[serde(default)]
    pub initial_size: AxisSpec,

    #[serde(default)]
    pub noise: AxisSpec,

    #[serde(default = "default_exec_env")]
    pub exec_env: Vec<ExecKind>,

    /// Monitor tag to monitor arguments, e.g. `mpstat = ["-A"]`.
    #[serde(default)]
    pub monitors: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub threads: Option<DomainSpec>,
}
impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            repeat: default_repeat(),
            initial_size: AxisSpec::default(),
            noise: AxisSpec::default(),
            exec_env: default_exec_env(),
            monitors: BTreeMap::new(),
            threads: None,
        }
    }
}

fn default_duration() -> u64 {
    3
}

fn default_repeat() -> u32 {
    1
}

fn default_exec_env() -> Vec<ExecKind> {
    vec![ExecKind::Process, ExecKind::Container]
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ContainersConfig {
    /// How many containers to run side by side.
    #[serde(default = "default_container_list")]
    pub container_list: DomainSpec,

    /// First core of each unit's core set. Defaults to `core_count * i`.
    #[serde(default)]
    pub core_affinity_offsets: Option<DomainSpec>,

    #[serde(default = "default_core_count")]
    pub core_count: usize,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_image")]
    pub image: String,

    /// Port published by the first container; later containers use the following ports.
    #[serde(default)]
    pub port: Option<u16>,
}
impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            container_list: default_container_list(),
            core_affinity_offsets: None,
            core_count: default_core_count(),
            name: String::new(),
            image: default_image(),
            port: None,
        }
    }
}

fn default_container_list() -> DomainSpec {
    DomainSpec::literal(vec![1])
}

fn default_core_count() -> usize {
    1
}

fn default_image() -> String {
    "hub.oepkgs.net/openeuler/openeuler".to_string()
}

/// Assignment of NICs (or their virtual functions) to containers.
#[derive(Debug, Deserialize, Serialize)]
pub struct NicsConfig {
    /// NIC name of unit `i`, e.g. `"enp1s0f0v{i}"`.
    pub nic_format: String,
    pub ips: DomainSpec,
    pub netmask: u8,
    /// Cores that handle the NIC IRQs, assigned in ascending order.
    #[serde(default)]
    pub core_affinity_offsets: Option<DomainSpec>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Hook {
    /// Launched before the benchmark starts.
    Pre,
    /// Launched after the benchmark finished.
    Post,
    /// Launched when the run ends, whether it finished, failed or was interrupted.
    Cleanup,
}
impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Pre => write!(f, "pre"),
            Hook::Post => write!(f, "post"),
            Hook::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PluginConfig {
    pub name: String,
    #[serde(alias = "exec_time")]
    pub hook: Hook,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub force_stop: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub binary: String,
    /// Static arguments, may contain placeholders such as `{threads}`.
    #[serde(default)]
    pub args: String,
    /// Commands wrapped around the application invocation, e.g. `strace -o {res_dir}/s.log`.
    #[serde(default)]
    pub wrappers: Vec<String>,
    /// Script that turns the application output into a `key=value;` line.
    #[serde(default)]
    pub adapter: Option<PathBuf>,
    /// When false the run is terminated once `duration` has elapsed.
    #[serde(default = "default_self_terminating")]
    pub self_terminating: bool,
}
impl ApplicationConfig {
    pub fn new(binary: &str, args: &str) -> Self {
        Self {
            name: None,
            binary: binary.to_string(),
            args: args.to_string(),
            wrappers: vec![],
            adapter: None,
            self_terminating: true,
        }
    }

    /// The configured name, or the file name of the binary. Names the application's
    /// results directory.
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.name.as_deref() {
            return name.trim();
        }
        let program = self.binary.split_whitespace().next().unwrap_or_default();
        Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program)
    }
}

fn default_self_terminating() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_load_toml_config_file() -> anyhow::Result<()> {
        let cfg = CampaignConfig::try_from_path(Path::new("./fixtures/campaign.toml"))?;
        assert_eq!(cfg.benchmark.duration, 2);
        assert_eq!(cfg.benchmark.exec_env, vec![ExecKind::Process]);
        assert_eq!(cfg.plugins.len(), 2);
        assert_eq!(cfg.plugins[0].hook, Hook::Pre);
        assert_eq!(cfg.applications.len(), 1);
        assert_eq!(cfg.applications[0].binary, "sh");
        assert_eq!(cfg.applications[0].display_name(), "echo-bench");
        Ok(())
    }

    #[test]
    fn can_load_json_config_file() -> anyhow::Result<()> {
        let cfg = CampaignConfig::try_from_path(Path::new("./fixtures/campaign.json"))?;
        assert_eq!(
            cfg.benchmark.exec_env,
            vec![ExecKind::Process, ExecKind::Container]
        );
        assert_eq!(cfg.containers.core_count, 2);
        let nics = cfg.nics.expect("nics should be configured");
        assert_eq!(nics.netmask, 24);
        assert!(cfg.benchmark.monitors.contains_key("mpstat"));
        Ok(())
    }

    #[test]
    fn defaults_match_a_minimal_campaign() -> anyhow::Result<()> {
        let cfg = CampaignConfig::try_from_str(
            r#"
            [application]
            binary = "ls"
            "#,
        )
        .map_err(anyhow::Error::msg)?;
        assert_eq!(cfg.benchmark.duration, 3);
        assert_eq!(cfg.benchmark.repeat, 1);
        assert_eq!(cfg.containers.core_count, 1);
        assert_eq!(cfg.results_dir, PathBuf::from("results"));
        assert!(cfg.applications[0].self_terminating);
        Ok(())
    }

    #[test]
    fn empty_binary_is_rejected() {
        let cfg = CampaignConfig::try_from_str(
            r#"
            [application]
            binary = " "
            "#,
        )
        .expect("should parse");
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let res = CampaignConfig::try_from_path(Path::new("./fixtures/nope.toml"));
        assert!(matches!(res, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn several_applications_share_the_sweep() -> anyhow::Result<()> {
        let cfg = CampaignConfig::try_from_str(
            r#"
            [[applications]]
            binary = "/usr/bin/redis-benchmark"
            args = "-t set"

            [[applications]]
            name = "memtier"
            binary = "memtier_benchmark"
            "#,
        )
        .map_err(anyhow::Error::msg)?
        .validated()?;
        let names = cfg
            .applications
            .iter()
            .map(|app| app.display_name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["redis-benchmark", "memtier"]);
        Ok(())
    }

    #[test]
    fn application_names_must_be_unique() -> anyhow::Result<()> {
        let cfg = CampaignConfig::try_from_str(
            r#"
            [[applications]]
            binary = "sh"
            args = "-c 'echo a=1'"

            [[applications]]
            binary = "/bin/sh"
            "#,
        )
        .map_err(anyhow::Error::msg)?;
        assert!(matches!(cfg.validated(), Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn wrapped_binary_is_named_after_its_program() {
        let app = ApplicationConfig::new("strace -f ./bench", "");
        assert_eq!(app.display_name(), "strace");
    }
}

use super::CONTAINER_HOME;
use crate::{
    config::ContainersConfig,
    error::LaunchError,
    process_control::LAUNCH_SETTLE,
    resources::{NicAssignment, ResourceAssignment},
};
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker,
};
use futures_util::stream::StreamExt;
use nanoid::nanoid;
use std::{collections::HashMap, fs, io, path::Path, time::Duration};
use subprocess::{Exec, Redirection};
use tokio::{io::AsyncWriteExt, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub image: String,
    pub name_prefix: String,
}
impl Default for ContainerSettings {
    fn default() -> Self {
        ContainerSettings::from(&ContainersConfig::default())
    }
}
impl From<&ContainersConfig> for ContainerSettings {
    fn from(cfg: &ContainersConfig) -> Self {
        let name_prefix = if cfg.name.trim().is_empty() {
            "bm-runner".to_string()
        } else {
            cfg.name.trim().to_string()
        };
        ContainerSettings {
            image: cfg.image.clone(),
            name_prefix,
        }
    }
}

type ExecTask = JoinHandle<Result<Option<i64>, LaunchError>>;

/// The application running inside a container. The container idles until the command is
/// executed in it, so that its NIC can be configured first.
pub struct ContainerUnit {
    settings: ContainerSettings,
    name: String,
    docker: Option<Docker>,
    id: Option<String>,
    exec_task: Option<ExecTask>,
}
impl ContainerUnit {
    pub fn new(settings: ContainerSettings, unit_index: usize) -> Self {
        let name = format!("{}-{}-{}", settings.name_prefix, unit_index, nanoid!(5));
        ContainerUnit {
            settings,
            name,
            docker: None,
            id: None,
            exec_task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn docker(&mut self) -> Result<Docker, LaunchError> {
        match &self.docker {
            Some(docker) => Ok(docker.clone()),
            None => {
                let docker = Docker::connect_with_defaults()?;
                self.docker = Some(docker.clone());
                Ok(docker)
            }
        }
    }

    pub async fn start(
        &mut self,
        command: &str,
        assignment: &ResourceAssignment,
        host_home: &Path,
        log: &Path,
    ) -> Result<(), LaunchError> {
        let docker = self.docker()?;
        ensure_image(&docker, &self.settings.image).await?;

        // stop() removes whatever is recorded here, record it before the next await
        let id = self.create(&docker, assignment, host_home).await?;
        self.id = Some(id.clone());
        docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;
        info!(
            "Container {} started on cores {}",
            self.name,
            assignment.core_list()
        );

        if let Some(nic) = &assignment.nic {
            let pid = container_pid(&docker, &id).await?;
            attach_nic(nic, pid)?;
        }

        let mut task = spawn_exec(&docker, &id, command, log).await?;
        tokio::time::sleep(LAUNCH_SETTLE).await;
        if task.is_finished() {
            let exit_code = join_exec(&mut task).await?;
            if let Some(code) = exit_code.filter(|c| *c != 0) {
                return Err(LaunchError::ImmediateExit {
                    command: command.to_string(),
                    status: format!("exit status: {}", code),
                });
            }
        } else {
            self.exec_task = Some(task);
        }
        Ok(())
    }

    async fn create(
        &self,
        docker: &Docker,
        assignment: &ResourceAssignment,
        host_home: &Path,
    ) -> Result<String, LaunchError> {
        let mut host_config = HostConfig {
            binds: Some(vec![format!("{}:{}", host_home.display(), CONTAINER_HOME)]),
            cpuset_cpus: Some(assignment.core_list()),
            ..Default::default()
        };
        let mut container_config = Config {
            image: Some(self.settings.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(CONTAINER_HOME.to_string()),
            ..Default::default()
        };

        if let Some(port) = assignment.port {
            let key = format!("{}/tcp", port);
            container_config.exposed_ports = Some(HashMap::from([(key.clone(), HashMap::new())]));
            host_config.port_bindings = Some(HashMap::from([(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            )]));
        }
        container_config.host_config = Some(host_config);

        let create_options = CreateContainerOptions {
            name: self.name.clone(),
            platform: None,
        };
        let container = docker
            .create_container(Some(create_options), container_config)
            .await?;
        debug!("Created container {} ({})", self.name, container.id);
        Ok(container.id)
    }

    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, LaunchError> {
        let Some(task) = self.exec_task.as_mut() else {
            return Ok(true);
        };
        let res = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, join_exec(task)).await {
                Ok(res) => res,
                Err(_) => return Ok(false),
            },
            None => join_exec(task).await,
        };
        // the task has completed and must not be polled again
        self.exec_task = None;
        debug!("Command in {} exited with {:?}", self.name, res?);
        Ok(true)
    }

    /// Stops (SIGTERM, then SIGKILL after `grace`) and removes the container.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        let docker = self.docker()?;

        docker
            .stop_container(
                &id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .unwrap_or_else(|e| warn!("Failed to stop container {}: {}", self.name, e));

        if let Some(task) = self.exec_task.take() {
            // output ends with the container, give the writer a moment to flush
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Output of {} was not fully drained", self.name);
            }
        }

        docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        debug!("Container {} removed", self.name);
        Ok(())
    }
}

async fn ensure_image(docker: &Docker, image: &str) -> Result<(), LaunchError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    info!("Image {} not found locally, pulling it", image);
    let mut image_stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(info) = image_stream.next().await {
        if let Err(err) = info {
            return Err(LaunchError::ImageUnavailable {
                image: image.to_string(),
                reason: err.to_string(),
            });
        }
    }
    Ok(())
}

async fn container_pid(docker: &Docker, id: &str) -> Result<i64, LaunchError> {
    let inspect = docker
        .inspect_container(id, None::<InspectContainerOptions>)
        .await?;
    inspect
        .state
        .and_then(|s| s.pid)
        .filter(|pid| *pid > 0)
        .ok_or_else(|| LaunchError::Network {
            nic: id.to_string(),
            reason: "container has no running process".to_string(),
        })
}

/// Runs the command in the container, streaming its output into `log`. The task yields the
/// exit code of the command.
async fn spawn_exec(
    docker: &Docker,
    id: &str,
    command: &str,
    log: &Path,
) -> Result<ExecTask, LaunchError> {
    let exec = docker
        .create_exec(
            id,
            CreateExecOptions {
                cmd: Some(vec!["/bin/sh", "-c", command]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                working_dir: Some(CONTAINER_HOME),
                ..Default::default()
            },
        )
        .await?;

    let StartExecResults::Attached { mut output, .. } = docker.start_exec(&exec.id, None).await?
    else {
        return Err(LaunchError::InvalidCommand(format!(
            "exec of \"{}\" was detached",
            command
        )));
    };

    let docker = docker.clone();
    let log = log.to_path_buf();
    Ok(tokio::spawn(async move {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .await?;
        while let Some(msg) = output.next().await {
            match msg {
                Ok(msg) => file.write_all(&msg.into_bytes()).await?,
                Err(e) => {
                    warn!("Output stream ended with an error: {}", e);
                    break;
                }
            }
        }
        file.flush().await?;
        let inspect = docker.inspect_exec(&exec.id).await?;
        Ok::<_, LaunchError>(inspect.exit_code)
    }))
}

async fn join_exec(task: &mut ExecTask) -> Result<Option<i64>, LaunchError> {
    match task.await {
        Ok(res) => res,
        Err(e) => Err(LaunchError::Io(io::Error::new(io::ErrorKind::Other, e))),
    }
}

/// Moves the NIC into the network namespace of `pid`, assigns its address and pins its IRQs.
fn attach_nic(nic: &NicAssignment, pid: i64) -> Result<(), LaunchError> {
    let pid = pid.to_string();
    let addr = format!("{}/{}", nic.ip, nic.netmask);
    if let Some(core) = nic.irq_core {
        pin_irqs(nic, core)?;
    }
    host_command(nic, &["ip", "link", "set", &nic.name, "netns", &pid])?;
    host_command(
        nic,
        &["nsenter", "-t", &pid, "-n", "ip", "addr", "add", &addr, "dev", &nic.name],
    )?;
    host_command(
        nic,
        &["nsenter", "-t", &pid, "-n", "ip", "link", "set", &nic.name, "up"],
    )?;
    info!("NIC {} configured with {}", nic.name, addr);
    Ok(())
}

fn host_command(nic: &NicAssignment, words: &[&str]) -> Result<(), LaunchError> {
    let network_err = |reason: String| LaunchError::Network {
        nic: nic.name.clone(),
        reason,
    };
    let (program, args) = words
        .split_first()
        .ok_or_else(|| network_err("empty command".to_string()))?;
    let capture = Exec::cmd(program)
        .args(args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Merge)
        .capture()
        .map_err(|e| network_err(format!("{}: {}", words.join(" "), e)))?;
    if !capture.exit_status.success() {
        return Err(network_err(format!(
            "{} failed: {}",
            words.join(" "),
            capture.stdout_str().trim()
        )));
    }
    Ok(())
}

fn pin_irqs(nic: &NicAssignment, core: usize) -> Result<(), LaunchError> {
    let interrupts = fs::read_to_string("/proc/interrupts")?;
    let irqs = irqs_of(&interrupts, &nic.name);
    if irqs.is_empty() {
        warn!("No IRQs found for {}", nic.name);
    }
    for irq in irqs {
        let path = format!("/proc/irq/{}/smp_affinity_list", irq);
        fs::write(&path, core.to_string()).map_err(|e| LaunchError::Network {
            nic: nic.name.clone(),
            reason: format!("unable to write {}: {}", path, e),
        })?;
        debug!("IRQ {} of {} pinned to core {}", irq, nic.name, core);
    }
    Ok(())
}

/// IRQ numbers whose `/proc/interrupts` line names the NIC.
fn irqs_of(interrupts: &str, nic: &str) -> Vec<u32> {
    interrupts
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .any(|word| word == nic || word.starts_with(&format!("{}-", nic)))
        })
        .filter_map(|line| line.trim_start().split_once(':'))
        .filter_map(|(irq, _)| irq.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERRUPTS: &str = "\
           CPU0       CPU1
  0:         35          0   IO-APIC   2-edge      timer
 57:       1200          3   PCI-MSI 1048576-edge      enp1s0f0v1-TxRx-0
 58:        900          1   PCI-MSI 1048577-edge      enp1s0f0v1-TxRx-1
 59:         12          0   PCI-MSI 1048578-edge      enp1s0f0v10
NMI:          0          0   Non-maskable interrupts
";

    #[test]
    fn irqs_are_matched_by_nic_name() {
        assert_eq!(irqs_of(INTERRUPTS, "enp1s0f0v1"), vec![57, 58]);
        assert_eq!(irqs_of(INTERRUPTS, "enp1s0f0v10"), vec![59]);
        assert!(irqs_of(INTERRUPTS, "eth0").is_empty());
    }

    #[test]
    fn container_names_use_the_configured_prefix() {
        let cfg = ContainersConfig {
            name: "redis".to_string(),
            ..Default::default()
        };
        let unit = ContainerUnit::new(ContainerSettings::from(&cfg), 2);
        assert!(unit.name().starts_with("redis-2-"));

        let unit = ContainerUnit::new(ContainerSettings::default(), 0);
        assert!(unit.name().starts_with("bm-runner-0-"));
    }

    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn container_unit_runs_a_command() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let log = home.path().join("stdout.log");
        let settings = ContainerSettings {
            image: "alpine:latest".to_string(),
            name_prefix: "bm-runner-test".to_string(),
        };
        let mut unit = ContainerUnit::new(settings, 0);
        let assignment = ResourceAssignment {
            unit_index: 0,
            cores: vec![0],
            nic: None,
            port: None,
        };
        unit.start("echo hello=1;", &assignment, home.path(), &log)
            .await?;
        assert!(unit.wait(Some(Duration::from_secs(30))).await?);
        unit.stop(Duration::from_secs(1)).await?;
        assert!(fs::read_to_string(&log)?.contains("hello=1"));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn container_of_a_failed_start_is_removed() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let log = home.path().join("stdout.log");
        let settings = ContainerSettings {
            image: "alpine:latest".to_string(),
            name_prefix: "bm-runner-test".to_string(),
        };
        let mut unit = ContainerUnit::new(settings, 0);
        let assignment = ResourceAssignment {
            unit_index: 0,
            cores: vec![0],
            nic: None,
            port: None,
        };
        let res = unit.start("exit 3", &assignment, home.path(), &log).await;
        assert!(matches!(res, Err(LaunchError::ImmediateExit { .. })));
        assert!(unit.id.is_some());

        unit.stop(Duration::from_secs(1)).await?;
        let docker = Docker::connect_with_defaults()?;
        let inspect = docker
            .inspect_container(unit.name(), None::<InspectContainerOptions>)
            .await;
        assert!(inspect.is_err());
        Ok(())
    }
}

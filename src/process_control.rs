use crate::error::{ConfigError, LaunchError};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

/// How long a freshly spawned process gets before we check that it did not exit with an error.
pub const LAUNCH_SETTLE: Duration = Duration::from_millis(100);

/// Where the combined stdout/stderr of a spawned process goes.
#[derive(Debug, Clone)]
pub enum Redirect {
    Null,
    Parent,
    /// Appends stdout and stderr to the given file.
    File(PathBuf),
    /// Writes stdout to the given file and discards stderr.
    Stdout(PathBuf),
}
impl Redirect {
    fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        match self {
            Redirect::Null => Ok((Stdio::null(), Stdio::null())),
            Redirect::Parent => Ok((Stdio::inherit(), Stdio::inherit())),
            Redirect::File(path) => {
                let out_file = OpenOptions::new().append(true).create(true).open(path)?;
                let err_file = out_file.try_clone()?;
                Ok((Stdio::from(out_file), Stdio::from(err_file)))
            }
            Redirect::Stdout(path) => Ok((Stdio::from(File::create(path)?), Stdio::null())),
        }
    }
}

/// Breaks a command string into POSIX words.
pub fn split_command(command: &str) -> Result<Vec<String>, LaunchError> {
    match shlex::split(command) {
        Some(words) if !words.is_empty() => Ok(words),
        _ => Err(LaunchError::InvalidCommand(command.to_string())),
    }
}

/// A child running as the leader of its own process group.
#[derive(Debug)]
pub struct GroupChild {
    pub child: Child,
    pub pid: u32,
    pub command: String,
}

/// Spawns `words` as the leader of a new process group so that the whole tree can be
/// signalled at once. The child is killed if the handle is dropped.
pub fn spawn_in_group(
    words: &[String],
    cwd: Option<&Path>,
    envs: &[(&str, &str)],
    redirect: &Redirect,
) -> Result<GroupChild, LaunchError> {
    let command = words.join(" ");
    let (program, args) = words
        .split_first()
        .ok_or_else(|| LaunchError::InvalidCommand(command.clone()))?;
    let (stdout, stderr) = redirect.stdio()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    debug!("Spawning {} in a new process group", command);
    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: command.clone(),
        source,
    })?;
    let pid = child.id().ok_or_else(|| LaunchError::ImmediateExit {
        command: command.clone(),
        status: "unknown status".to_string(),
    })?;

    Ok(GroupChild {
        child,
        pid,
        command,
    })
}

impl GroupChild {
    /// Gives the process a moment to fail, e.g. on bad arguments. A non-zero exit within
    /// that window is a launch error; a clean exit is fine.
    pub async fn ensure_launched(&mut self) -> Result<(), LaunchError> {
        tokio::time::sleep(LAUNCH_SETTLE).await;
        match self.child.try_wait()? {
            Some(status) if !status.success() => Err(LaunchError::ImmediateExit {
                command: self.command.clone(),
                status: status.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        signal_group(self.pid, signal)
    }

    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        signal_process(self.pid, signal)
    }

    /// Waits for the child to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Sends `signal` (to the whole group if `group` is set), waits up to `grace` and then
    /// kills the group.
    pub async fn shutdown(
        &mut self,
        signal: libc::c_int,
        group: bool,
        grace: Duration,
    ) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        let res = if group {
            self.signal_group(signal)
        } else {
            self.signal(signal)
        };
        if let Err(e) = res {
            warn!("Failed to signal {} (pid {}): {}", self.command, self.pid, e);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "{} (pid {}) did not exit within {:?}, killing it",
                    self.command, self.pid, grace
                );
                if let Err(e) = self.signal_group(libc::SIGKILL) {
                    trace!("killpg failed: {}", e);
                }
                self.child.kill().await.ok();
                self.child.wait().await
            }
        }
    }
}

pub fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: killpg has no memory safety requirements
    let res = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    check_kill(res)
}

pub fn signal_process(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory safety requirements
    let res = unsafe { libc::kill(pid as libc::pid_t, signal) };
    check_kill(res)
}

fn check_kill(res: libc::c_int) -> io::Result<()> {
    if res == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // the target already exited
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Creates a uniquely named, kept file in `dir` for the output of `name`.
pub fn unique_log_file(dir: &Path, name: &str) -> io::Result<(File, PathBuf)> {
    let stem = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "proc".to_string());
    let file = tempfile::Builder::new()
        .prefix(&format!("{}-", stem))
        .suffix(".log")
        .tempfile_in(dir)?;
    file.keep().map_err(|e| e.error)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locates an executable. Names containing a `/` are taken as paths relative to `home`;
/// otherwise `dir`, the directory named by the `env_var_dir` environment variable,
/// `<home>/<default_dir>` and finally `PATH` are searched in that order.
pub fn find_executable(
    name: &str,
    dir: Option<&Path>,
    env_var_dir: Option<&str>,
    default_dir: &Path,
    home: &Path,
) -> Result<PathBuf, ConfigError> {
    let missing = || ConfigError::MissingExecutable {
        name: name.to_string(),
    };

    if name.contains('/') {
        let path = home.join(name);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(missing())
        };
    }

    let mut candidates: Vec<PathBuf> = vec![];
    if let Some(dir) = dir {
        candidates.push(home.join(dir));
    }
    if let Some(var) = env_var_dir.and_then(|v| std::env::var_os(v)) {
        candidates.push(PathBuf::from(var));
    }
    candidates.push(home.join(default_dir));
    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path));
    }

    candidates
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
        .ok_or_else(missing)
}

/// Checks that a tool is installed, e.g. `mpstat`.
pub fn tool_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name))))
        .unwrap_or(false)
}

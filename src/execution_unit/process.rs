use crate::{
    error::LaunchError,
    process_control::{self, GroupChild, Redirect},
    resources::ResourceAssignment,
};
use std::{path::Path, time::Duration};
use tracing::{debug, warn};

/// The application running directly on the host, pinned with `taskset`.
#[derive(Debug, Default)]
pub struct ProcessUnit {
    child: Option<GroupChild>,
}
impl ProcessUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(
        &mut self,
        command: &str,
        assignment: &ResourceAssignment,
        cwd: &Path,
        log: &Path,
    ) -> Result<(), LaunchError> {
        let mut words = vec![];
        if process_control::tool_exists("taskset") {
            words.extend(["taskset".to_string(), "-c".to_string(), assignment.core_list()]);
        } else {
            warn!("taskset not found, unit {} runs unpinned", assignment.unit_index);
        }
        words.extend(process_control::split_command(command)?);

        let mut child =
            process_control::spawn_in_group(&words, Some(cwd), &[], &Redirect::File(log.into()))?;
        child.ensure_launched().await?;
        debug!("Unit {} running as pid {}", assignment.unit_index, child.pid);
        self.child = Some(child);
        Ok(())
    }

    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, LaunchError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(true);
        };
        let status = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(false),
            },
            None => child.wait().await?,
        };
        debug!("{} exited with {}", child.command, status);
        Ok(true)
    }

    /// SIGTERM to the whole process group, SIGKILL once `grace` ran out.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError> {
        if let Some(mut child) = self.child.take() {
            let status = child.shutdown(libc::SIGTERM, true, grace).await?;
            debug!("{} stopped with {}", child.command, status);
        }
        Ok(())
    }
}

/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::process_control::{CommandLine, Redirect};
use anyhow::{anyhow, bail, Context};
use colored::*;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use subprocess::{Exec, ExitStatus, NullFile, Popen, Redirection};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A process started in the background. The handle returned at launch is the only way the
/// process is ever signalled, so several pipelines can share a host.
pub struct BackgroundProcess {
    name: String,
    pid: u32,
    popen: Popen,
}
impl BackgroundProcess {
    /// Runs the given command as a detached process. This function does not block because the
    /// process is managed by the OS and running separately from this thread.
    ///
    /// # Arguments
    ///
    /// * name - A human readable name used in logs.
    /// * cmd - The command to run.
    /// * redirect - Where stdout and stderr should go.
    pub fn launch(name: &str, cmd: &CommandLine, redirect: &Redirect) -> anyhow::Result<Self> {
        debug!("Running command {} in detached mode", cmd);

        let mut exec = Exec::cmd(cmd.program()).args(cmd.get_args());
        if let Some(dir) = cmd.get_current_dir() {
            exec = exec.cwd(dir);
        }

        let exec = match redirect {
            Redirect::Null => exec.stdout(NullFile).stderr(NullFile),
            Redirect::Parent => exec,
            Redirect::File(path) => {
                let out_file = Redirect::open_log(path)?;
                exec.stdout(Redirection::File(out_file))
                    .stderr(Redirection::Merge)
            }
        };

        let popen = exec
            .detached()
            .popen()
            .context(format!("Failed to spawn detached process, command: {}", cmd))?;
        let pid = popen.pid().context("Process should have a PID")?;

        Ok(Self {
            name: name.to_string(),
            pid,
            popen,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        self.popen.poll().is_none()
    }

    /// Waits for the process to exit by itself. Returns `None` if it is still running once the
    /// timeout has elapsed.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> anyhow::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.popen.poll() {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Sends SIGTERM to this process, escalating to SIGKILL if it hasn't exited within `timeout`.
    pub async fn terminate(mut self, timeout: Duration) -> anyhow::Result<ExitStatus> {
        if let Some(status) = self.popen.poll() {
            debug!("{} ({}) had already exited with {:?}", self.name, self.pid, status);
            return Ok(status);
        }

        print!("> stopping process {}", self.name.green());
        self.popen
            .terminate()
            .context(format!("Failed to signal {} ({})", self.name, self.pid))?;

        if let Some(status) = self.wait_for_exit(timeout).await? {
            println!("\t{}", "✓".green());
            return Ok(status);
        }

        println!();
        warn!(
            "{} ({}) ignored SIGTERM for {:?}, killing it",
            self.name, self.pid, timeout
        );
        self.popen
            .kill()
            .context(format!("Failed to kill {} ({})", self.name, self.pid))?;

        self.wait_for_exit(timeout)
            .await?
            .ok_or_else(|| anyhow!("{} ({}) survived SIGKILL", self.name, self.pid))
    }
}
impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if self.popen.poll().is_none() {
            warn!(
                "Background process {} ({}) outlived its stage, killing it",
                self.name, self.pid
            );
            if let Err(err) = self.popen.kill() {
                warn!("Failed to kill {} ({})\n{}", self.name, self.pid, err);
                return;
            }
            let _ = self.popen.wait_timeout(Duration::from_secs(1));
        }
    }
}

/// Polls until `path` exists, failing early if `process` exits before creating it.
pub async fn wait_for_output(
    process: &mut BackgroundProcess,
    path: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if let Some(status) = process.popen.poll() {
            bail!(
                "{} exited with {:?} before creating {}",
                process.name,
                status,
                path.display()
            );
        }
        if Instant::now() >= deadline {
            bail!(
                "{} did not create {} within {:?}",
                process.name,
                path.display(),
                timeout
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Polls until `path` exists and its size is unchanged across one `interval`. Returns the settled
/// size in bytes.
pub async fn wait_for_stable_file(
    path: &Path,
    interval: Duration,
    timeout: Duration,
) -> anyhow::Result<u64> {
    let deadline = Instant::now() + timeout;
    let mut last_size = None;
    loop {
        let size = tokio::fs::metadata(path).await.ok().map(|meta| meta.len());
        match (last_size, size) {
            (Some(prev), Some(curr)) if prev == curr => return Ok(curr),
            _ => last_size = size,
        }
        if Instant::now() >= deadline {
            bail!("{} did not settle within {:?}", path.display(), timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stable_file_returns_its_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("traffic-10.pcap");
        std::fs::write(&path, b"0123456789")?;

        let size =
            wait_for_stable_file(&path, Duration::from_millis(10), Duration::from_secs(2)).await?;
        assert_eq!(size, 10);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_never_settles() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("traffic-10.pcap");

        let res =
            wait_for_stable_file(&path, Duration::from_millis(10), Duration::from_millis(100))
                .await;
        assert!(res.is_err());
        Ok(())
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;
        use sysinfo::{Pid, System};

        fn is_alive(pid: u32) -> bool {
            let mut system = System::new();
            system.refresh_all();
            system.process(Pid::from_u32(pid)).is_some()
        }

        #[tokio::test]
        async fn terminate_stops_the_launched_process() -> anyhow::Result<()> {
            let cmd = CommandLine::from_prefix("sleep 15")?;
            let mut proc = BackgroundProcess::launch("sleep", &cmd, &Redirect::Null)?;
            let pid = proc.pid();

            assert!(proc.is_running());
            assert!(is_alive(pid));

            let status = proc.terminate(Duration::from_secs(5)).await?;
            assert!(!status.success());
            assert!(!is_alive(pid));
            Ok(())
        }

        #[tokio::test]
        async fn only_the_launched_process_is_signalled() -> anyhow::Result<()> {
            let cmd = CommandLine::from_prefix("sleep 15")?;
            let first = BackgroundProcess::launch("sleep", &cmd, &Redirect::Null)?;
            let mut second = BackgroundProcess::launch("sleep", &cmd, &Redirect::Null)?;

            first.terminate(Duration::from_secs(5)).await?;
            assert!(second.is_running());

            second.terminate(Duration::from_secs(5)).await?;
            Ok(())
        }

        #[tokio::test]
        async fn wait_for_exit_observes_the_exit_status() -> anyhow::Result<()> {
            let cmd = CommandLine::from_prefix("sh -c 'exit 3'")?;
            let mut proc = BackgroundProcess::launch("exit", &cmd, &Redirect::Null)?;

            let status = proc.wait_for_exit(Duration::from_secs(5)).await?;
            assert_eq!(status, Some(ExitStatus::Exited(3)));
            Ok(())
        }

        #[tokio::test]
        async fn dropping_a_handle_kills_the_process() -> anyhow::Result<()> {
            let cmd = CommandLine::from_prefix("sleep 15")?;
            let proc = BackgroundProcess::launch("sleep", &cmd, &Redirect::Null)?;
            let pid = proc.pid();

            drop(proc);
            assert!(!is_alive(pid));
            Ok(())
        }

        #[tokio::test]
        async fn wait_for_output_fails_fast_when_the_process_dies() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let cmd = CommandLine::from_prefix("false")?;
            let mut proc = BackgroundProcess::launch("capture", &cmd, &Redirect::Null)?;

            let res = wait_for_output(
                &mut proc,
                &dir.path().join("traffic-10.pcap"),
                Duration::from_secs(5),
            )
            .await;
            assert!(res.is_err());
            Ok(())
        }
    }
}

//! Starting, signalling and stopping the external downloader.
//!
//! [`ProcessController`] belongs to the task that spawned the child and is the only thing that
//! reaps it. [`ProcessHandle`] is a copyable pid the manager uses for suspend/resume and
//! liveness checks.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::errors::{LauncherError, Result};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

/// How a bounded termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Killed,
    AlreadyExited,
    /// Both bounds ran out; the process is treated as gone for bookkeeping.
    Unconfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn suspend(&self) -> Result<()> {
        platform::suspend(self.pid)
            .map_err(|e| LauncherError::Process(format!("suspend {}: {e}", self.pid)))
    }

    pub fn resume(&self) -> Result<()> {
        platform::resume(self.pid)
            .map_err(|e| LauncherError::Process(format!("resume {}: {e}", self.pid)))
    }

    pub fn is_alive(&self) -> bool {
        platform::is_alive(self.pid)
    }

    /// Signal-based termination for a process this side does not own.
    ///
    /// Liveness is polled, so the owner must keep reaping for `Graceful`/`Killed` to be seen.
    pub async fn terminate(&self, grace: Duration, kill_timeout: Duration) -> Termination {
        if !self.is_alive() {
            return Termination::AlreadyExited;
        }
        if let Err(e) = platform::terminate(self.pid) {
            log::warn!("terminate {} failed: {e}", self.pid);
        }
        if self.wait_dead(grace).await {
            return Termination::Graceful;
        }
        log::warn!("process {} ignored terminate, killing", self.pid);
        if let Err(e) = platform::kill(self.pid) {
            log::warn!("kill {} failed: {e}", self.pid);
        }
        if self.wait_dead(kill_timeout).await {
            return Termination::Killed;
        }
        log::error!(
            "process {} still present after kill; treating as terminated",
            self.pid
        );
        Termination::Unconfirmed
    }

    async fn wait_dead(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

pub struct ProcessController {
    child: Child,
    pid: u32,
    program: String,
}

impl ProcessController {
    pub fn spawn(program: &Path, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        let program_name = program.to_string_lossy().to_string();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        #[cfg(windows)]
        cmd.creation_flags(platform::CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(|source| LauncherError::Spawn {
            program: program_name.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| {
            LauncherError::Process(format!("{program_name} exited before its pid was read"))
        })?;
        log::info!("spawned {program_name} (pid {pid})");

        Ok(Self {
            child,
            pid,
            program: program_name,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle::new(self.pid)
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Graceful terminate bounded by `grace`, then a forced kill bounded by `kill_timeout`.
    pub async fn terminate(&mut self, grace: Duration, kill_timeout: Duration) -> Termination {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Termination::AlreadyExited;
        }

        if let Err(e) = platform::terminate(self.pid) {
            log::warn!("terminate {} (pid {}) failed: {e}", self.program, self.pid);
        }
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            log::info!("{} exited after terminate: {status}", self.program);
            return Termination::Graceful;
        }

        log::warn!(
            "{} (pid {}) did not exit within {:?}, killing",
            self.program,
            self.pid,
            grace
        );
        if let Err(e) = self.child.start_kill() {
            log::warn!("kill {} failed: {e}", self.pid);
        }
        if let Ok(Ok(_)) = tokio::time::timeout(kill_timeout, self.child.wait()).await {
            return Termination::Killed;
        }

        log::error!(
            "{} (pid {}) not confirmed dead after kill; treating as terminated",
            self.program,
            self.pid
        );
        Termination::Unconfirmed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessController {
        ProcessController::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = ProcessController::spawn(Path::new("/definitely/not/here"), &[], None)
            .err()
            .unwrap();
        assert!(matches!(err, LauncherError::Spawn { .. }));
    }

    #[tokio::test]
    async fn suspend_and_resume_keep_process_alive() {
        let mut proc = sh("sleep 30");
        let handle = proc.handle();
        assert!(handle.is_alive());

        handle.suspend().unwrap();
        assert!(handle.is_alive());
        handle.resume().unwrap();
        assert!(handle.is_alive());

        let outcome = proc
            .terminate(Duration::from_secs(2), Duration::from_secs(2))
            .await;
        assert_eq!(outcome, Termination::Graceful);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn stopped_process_still_terminates() {
        let mut proc = sh("sleep 30");
        proc.handle().suspend().unwrap();
        let outcome = proc
            .terminate(Duration::from_secs(2), Duration::from_secs(2))
            .await;
        assert_ne!(outcome, Termination::Unconfirmed);
    }

    #[tokio::test]
    async fn ignoring_sigterm_escalates_to_kill() {
        let mut proc = sh("trap '' TERM; while true; do sleep 1; done");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = proc
            .terminate(Duration::from_millis(300), Duration::from_secs(2))
            .await;
        assert_eq!(outcome, Termination::Killed);
    }

    #[tokio::test]
    async fn exited_process_reports_already_exited() {
        let mut proc = sh("exit 0");
        proc.wait().await.unwrap();
        let outcome = proc
            .terminate(Duration::from_millis(100), Duration::from_millis(100))
            .await;
        assert_eq!(outcome, Termination::AlreadyExited);
    }

    #[test]
    fn pid_zero_is_never_signalled() {
        assert!(!ProcessHandle::new(0).is_alive());
        assert!(ProcessHandle::new(0).suspend().is_err());
    }
}

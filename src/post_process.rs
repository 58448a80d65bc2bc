use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::errors::{LauncherError, Result};
use crate::process::ProcessController;
use crate::task::ControlChannel;

pub type ProgressFn<'a> = &'a (dyn Fn(String) + Send + Sync);

/// A step that runs on the install directory after every depot finished.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        install_dir: &Path,
        control: &ControlChannel,
        progress: ProgressFn<'_>,
    ) -> Result<()>;
}

/// Runs a configured external command with the install dir as its last argument.
pub struct CommandPostProcessor {
    program: PathBuf,
    args: Vec<String>,
    grace: Duration,
    kill_timeout: Duration,
}

impl CommandPostProcessor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            grace: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
        }
    }

    /// `None` when post-processing is disabled.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        if !settings.post_process.enabled {
            return Ok(None);
        }
        let mut parts = settings.post_process_command()?.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| LauncherError::Config("post_process.command is empty".to_string()))?;
        let mut processor = Self::new(program, parts.collect());
        processor.grace = settings.graceful_timeout();
        processor.kill_timeout = settings.kill_timeout();
        Ok(Some(processor))
    }
}

#[async_trait]
impl PostProcessor for CommandPostProcessor {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(
        &self,
        install_dir: &Path,
        control: &ControlChannel,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        let mut args = self.args.clone();
        args.push(install_dir.to_string_lossy().to_string());

        let mut proc = ProcessController::spawn(&self.program, &args, Some(install_dir))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = proc.take_stdout() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    let _ = tx.send(line);
                }
            });
        }
        if let Some(stderr) = proc.take_stderr() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    let _ = tx.send(format!("ERROR: {line}"));
                }
            });
        }
        drop(tx);

        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut output_open = true;
        let status = loop {
            tokio::select! {
                line = rx.recv(), if output_open => match line {
                    Some(line) => progress(line),
                    None => output_open = false,
                },
                _ = tick.tick() => {
                    if control.stop_requested() {
                        proc.terminate(self.grace, self.kill_timeout).await;
                        return Err(LauncherError::Process("post-processing cancelled".to_string()));
                    }
                    if let Some(status) = proc.try_wait()? {
                        break status;
                    }
                }
            }
        };
        let drain = async {
            while let Some(line) = rx.recv().await {
                progress(line);
            }
        };
        let _ = tokio::time::timeout(Duration::from_millis(500), drain).await;

        if status.success() {
            Ok(())
        } else {
            Err(LauncherError::Process(format!(
                "post-processing exited with {status}"
            )))
        }
    }
}

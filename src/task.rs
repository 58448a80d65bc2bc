use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Settings;
use crate::errors::{LauncherError, Result};
use crate::game_data::GameData;
use crate::parser::OutputParser;
use crate::post_process::PostProcessor;
use crate::process::ProcessController;

pub const KEYS_FILE_NAME: &str = "keys.vdf";
pub const NO_COMPRESSION_FLAG: &str = "-no-compression";

/// Flags shared between the manager and a running task.
///
/// `stop` is checked between depots and on every poll tick; `paused` mirrors the manager's
/// acknowledged pause so the stall watchdog does not count suspended time.
#[derive(Debug, Clone, Default)]
pub struct ControlChannel {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl ControlChannel {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// What the task reports back. The manager is the only consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    ProcessStarted {
        depot_id: String,
        pid: u32,
    },
    ProcessExited {
        depot_id: String,
        pid: u32,
        code: Option<i32>,
    },
    Progress(String),
    PercentChanged {
        depot_id: String,
        percent: u8,
    },
    BytesChanged {
        downloaded: u64,
        total: u64,
    },
    UnitCompleted(String),
    /// Selected but without a manifest id.
    UnitSkipped(String),
    PostProcess(String),
    Finished {
        install_dir: PathBuf,
    },
    Cancelled,
    /// The downloader died from a signal nobody here sent.
    Terminated(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(PathBuf),
    Cancelled,
}

enum UnitOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub downloader_path: PathBuf,
    /// Session scratch dir; holds the generated credentials file.
    pub work_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub max_downloads: u32,
    pub validate: bool,
    pub no_compression: bool,
    pub extra_args: Vec<String>,
    pub poll_interval: Duration,
    pub graceful_timeout: Duration,
    pub kill_timeout: Duration,
    pub stall_timeout: Option<Duration>,
}

impl TaskOptions {
    pub fn from_settings(settings: &Settings, session_id: &str) -> Result<Self> {
        Ok(Self {
            downloader_path: settings.downloader_path.clone(),
            work_dir: settings.session_work_dir(session_id),
            manifest_dir: settings.manifest_dir.clone(),
            max_downloads: settings.max_downloads,
            validate: settings.validate,
            no_compression: settings.no_compression,
            extra_args: settings.extra_args_vec()?,
            poll_interval: settings.poll_interval(),
            graceful_timeout: settings.graceful_timeout(),
            kill_timeout: settings.kill_timeout(),
            stall_timeout: settings.stall_timeout(),
        })
    }
}

fn spawn_reader<R>(stream: R, is_stderr: bool, tx: mpsc::UnboundedSender<(bool, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send((is_stderr, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Runs DepotDownloaderMod once per selected depot, in order.
pub struct DownloadTask {
    session_id: String,
    game: GameData,
    depots: Vec<String>,
    dest_path: PathBuf,
    options: TaskOptions,
    control: ControlChannel,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl DownloadTask {
    pub fn new(
        session_id: impl Into<String>,
        game: GameData,
        depots: Vec<String>,
        dest_path: impl Into<PathBuf>,
        options: TaskOptions,
        control: ControlChannel,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            game,
            depots,
            dest_path: dest_path.into(),
            options,
            control,
            post_processor: None,
        }
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(processor);
        self
    }

    pub fn keys_file(&self) -> PathBuf {
        self.options.work_dir.join(KEYS_FILE_NAME)
    }

    pub fn manifest_file(&self, depot_id: &str, manifest_id: &str) -> PathBuf {
        self.options
            .manifest_dir
            .join(format!("{depot_id}_{manifest_id}.manifest"))
    }

    /// Drive every depot, then post-process. Always ends with exactly one of
    /// `Finished`, `Cancelled` or `Error` on `events`.
    pub async fn run(&self, events: &mpsc::UnboundedSender<TaskEvent>) -> Result<TaskOutcome> {
        let result = self.execute(events).await;
        let success = matches!(result, Ok(TaskOutcome::Finished(_)));
        self.cleanup_scratch(success);

        let terminal = match &result {
            Ok(TaskOutcome::Finished(dir)) => TaskEvent::Finished {
                install_dir: dir.clone(),
            },
            Ok(TaskOutcome::Cancelled) => TaskEvent::Cancelled,
            Err(e) if self.control.stop_requested() => {
                log::info!("task {} stopped: {e}", self.session_id);
                TaskEvent::Cancelled
            }
            Err(e @ LauncherError::UnexpectedTermination(_)) => {
                log::error!("task {}: {e}", self.session_id);
                TaskEvent::Terminated(e.to_string())
            }
            Err(e) => {
                log::error!("task {} failed: {e}", self.session_id);
                TaskEvent::Error(e.to_string())
            }
        };
        let _ = events.send(terminal);
        result
    }

    async fn execute(&self, events: &mpsc::UnboundedSender<TaskEvent>) -> Result<TaskOutcome> {
        self.game.validate()?;
        if self.depots.is_empty() {
            return Err(LauncherError::validation("no depots selected"));
        }

        let install_dir = self.game.install_dir(&self.dest_path)?;
        std::fs::create_dir_all(&install_dir)?;
        let _ = events.send(TaskEvent::Progress(format!(
            "Download destination set to: {}",
            install_dir.display()
        )));

        let keys_file = self.write_keys_file()?;
        let _ = events.send(TaskEvent::Progress(format!(
            "Generated depot keys file at {}",
            keys_file.display()
        )));
        std::fs::create_dir_all(&self.options.manifest_dir)?;

        let mut parser = OutputParser::new(
            self.game.selected_size(&self.depots),
            self.game.total_size,
        )?;

        for depot_id in &self.depots {
            if self.control.stop_requested() {
                return Ok(TaskOutcome::Cancelled);
            }
            let Some(manifest_id) = self.game.manifest_for(depot_id) else {
                log::warn!("no manifest id for depot {depot_id}, skipping");
                let _ = events.send(TaskEvent::Progress(format!(
                    "Warning: No manifest ID for depot {depot_id}. Skipping."
                )));
                let _ = events.send(TaskEvent::UnitSkipped(depot_id.clone()));
                continue;
            };

            parser.begin_unit();
            let args = self.build_args(depot_id, manifest_id, &keys_file, &install_dir);
            match self.run_depot(depot_id, &args, &mut parser, events).await? {
                UnitOutcome::Completed => {
                    let _ = events.send(TaskEvent::UnitCompleted(depot_id.clone()));
                }
                UnitOutcome::Cancelled => return Ok(TaskOutcome::Cancelled),
            }
        }

        if self.control.stop_requested() {
            return Ok(TaskOutcome::Cancelled);
        }

        if let Some(processor) = &self.post_processor {
            let _ = events.send(TaskEvent::PostProcess(format!(
                "--- Starting {} post-processing ---",
                processor.name()
            )));
            let tx = events.clone();
            let forward = move |line: String| {
                let _ = tx.send(TaskEvent::PostProcess(line));
            };
            match processor.run(&install_dir, &self.control, &forward).await {
                Ok(()) => {
                    let _ = events.send(TaskEvent::PostProcess(
                        "--- Post-processing finished ---".to_string(),
                    ));
                }
                Err(_) if self.control.stop_requested() => return Ok(TaskOutcome::Cancelled),
                Err(e) => {
                    log::warn!("post-processing failed: {e}");
                    let _ = events.send(TaskEvent::PostProcess(format!(
                        "Post-processing failed: {e}"
                    )));
                }
            }
        }

        let _ = events.send(TaskEvent::Progress("--- Download completed ---".to_string()));
        Ok(TaskOutcome::Finished(install_dir))
    }

    fn write_keys_file(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.options.work_dir)?;
        let mut content = String::new();
        for depot_id in &self.depots {
            if let Some(info) = self.game.depots.get(depot_id) {
                content.push_str(&format!("{depot_id};{}\n", info.key));
            }
        }
        let path = self.keys_file();
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn build_args(
        &self,
        depot_id: &str,
        manifest_id: &str,
        keys_file: &Path,
        install_dir: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-app".to_string(),
            self.game.app_id.trim().to_string(),
            "-depot".to_string(),
            depot_id.to_string(),
            "-manifest".to_string(),
            manifest_id.to_string(),
            "-manifestfile".to_string(),
            self.manifest_file(depot_id, manifest_id)
                .to_string_lossy()
                .to_string(),
            "-depotkeys".to_string(),
            keys_file.to_string_lossy().to_string(),
            "-max-downloads".to_string(),
            self.options.max_downloads.to_string(),
            "-dir".to_string(),
            install_dir.to_string_lossy().to_string(),
        ];
        if self.options.validate {
            args.push("-validate".to_string());
        }
        if self.options.no_compression {
            args.push(NO_COMPRESSION_FLAG.to_string());
        }
        args.extend(self.options.extra_args.iter().cloned());
        args
    }

    async fn run_depot(
        &self,
        depot_id: &str,
        args: &[String],
        parser: &mut OutputParser,
        events: &mpsc::UnboundedSender<TaskEvent>,
    ) -> Result<UnitOutcome> {
        let _ = events.send(TaskEvent::Progress(format!(
            "--- Downloading depot {depot_id} ---"
        )));
        let mut proc = ProcessController::spawn(
            &self.options.downloader_path,
            args,
            Some(&self.options.work_dir),
        )?;
        let pid = proc.pid();
        let _ = events.send(TaskEvent::ProcessStarted {
            depot_id: depot_id.to_string(),
            pid,
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<(bool, String)>();
        if let Some(stdout) = proc.take_stdout() {
            spawn_reader(stdout, false, tx.clone());
        }
        if let Some(stderr) = proc.take_stderr() {
            spawn_reader(stderr, true, tx.clone());
        }
        drop(tx);

        let mut tick = tokio::time::interval(self.options.poll_interval);
        let mut last_output = Instant::now();
        let mut output_open = true;

        let status = loop {
            tokio::select! {
                msg = rx.recv(), if output_open => match msg {
                    Some((is_stderr, line)) => {
                        last_output = Instant::now();
                        self.handle_line(depot_id, is_stderr, &line, parser, events);
                    }
                    None => output_open = false,
                },
                _ = tick.tick() => {
                    if self.control.stop_requested() {
                        let outcome = proc
                            .terminate(self.options.graceful_timeout, self.options.kill_timeout)
                            .await;
                        log::info!("depot {depot_id} stopped on request ({outcome:?})");
                        let _ = events.send(TaskEvent::ProcessExited {
                            depot_id: depot_id.to_string(),
                            pid,
                            code: None,
                        });
                        return Ok(UnitOutcome::Cancelled);
                    }
                    if let Some(status) = proc.try_wait()? {
                        break status;
                    }
                    if let Some(limit) = self.options.stall_timeout {
                        if self.control.is_paused() {
                            last_output = Instant::now();
                        } else if last_output.elapsed() >= limit {
                            proc.terminate(self.options.graceful_timeout, self.options.kill_timeout)
                                .await;
                            let _ = events.send(TaskEvent::ProcessExited {
                                depot_id: depot_id.to_string(),
                                pid,
                                code: None,
                            });
                            return Err(LauncherError::Depot {
                                depot_id: depot_id.to_string(),
                                message: format!("no output for {}s, download stalled", limit.as_secs()),
                            });
                        }
                    }
                }
            }
        };

        // Output still buffered in the pipes after exit.
        let drain = async {
            while let Some((is_stderr, line)) = rx.recv().await {
                self.handle_line(depot_id, is_stderr, &line, parser, events);
            }
        };
        let _ = tokio::time::timeout(Duration::from_millis(500), drain).await;

        let _ = events.send(TaskEvent::ProcessExited {
            depot_id: depot_id.to_string(),
            pid,
            code: status.code(),
        });

        if self.control.stop_requested() {
            return Ok(UnitOutcome::Cancelled);
        }
        if !status.success() {
            return Err(match status.code() {
                Some(code) => LauncherError::Depot {
                    depot_id: depot_id.to_string(),
                    message: format!("downloader exited with code {code}"),
                },
                None => LauncherError::UnexpectedTermination(format!(
                    "depot {depot_id} ({status})"
                )),
            });
        }
        log::info!("depot {depot_id} finished");
        Ok(UnitOutcome::Completed)
    }

    fn handle_line(
        &self,
        depot_id: &str,
        is_stderr: bool,
        line: &str,
        parser: &mut OutputParser,
        events: &mpsc::UnboundedSender<TaskEvent>,
    ) {
        if is_stderr {
            log::warn!("DepotDownloader error: {line}");
            let _ = events.send(TaskEvent::Progress(format!("ERROR: {line}")));
        } else {
            log::debug!("DepotDownloader: {line}");
            let _ = events.send(TaskEvent::Progress(line.to_string()));
        }

        let update = parser.parse_line(line);
        if let Some(percent) = update.percent {
            let _ = events.send(TaskEvent::PercentChanged {
                depot_id: depot_id.to_string(),
                percent,
            });
        }
        if let Some(bytes) = update.bytes {
            let _ = events.send(TaskEvent::BytesChanged {
                downloaded: bytes.downloaded,
                total: bytes.total,
            });
        }
    }

    /// Credentials always go; manifest files only once everything downloaded.
    fn cleanup_scratch(&self, include_manifests: bool) {
        if let Err(e) = std::fs::remove_file(self.keys_file()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {e}", self.keys_file().display());
            }
        }
        let _ = std::fs::remove_dir(&self.options.work_dir);

        if !include_manifests {
            return;
        }
        for depot_id in &self.depots {
            if let Some(manifest_id) = self.game.manifest_for(depot_id) {
                let _ = std::fs::remove_file(self.manifest_file(depot_id, manifest_id));
            }
        }
        // Only succeeds when nothing else is left in it.
        let _ = std::fs::remove_dir(&self.options.manifest_dir);
    }
}

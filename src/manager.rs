//! Download coordinator.
//!
//! The manager owns the state machine, the current session and the process handle. A worker task
//! runs [`DownloadTask`] and reports through a channel; a coordinator task applies those events,
//! runs the liveness monitor and is the only place the session's final state is decided (apart
//! from [`DownloadManager::cancel`], which always ends in `Cancelled`).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cleanup::{CleanupEngine, CleanupReport, SweepReport, TempFileSweeper};
use crate::config::Settings;
use crate::errors::{LauncherError, Result};
use crate::game_data::GameData;
use crate::post_process::{CommandPostProcessor, PostProcessor};
use crate::process::{ProcessHandle, Termination};
use crate::progress::{DownloadEvent, EventSink, SpeedMeter};
use crate::session::{DownloadSession, DownloadState, SessionStore, SessionSummary};
use crate::task::{ControlChannel, DownloadTask, TaskEvent, TaskOptions};

const UNEXPECTED_TERMINATION: &str = "Download process terminated unexpectedly";

/// How the install directory was dealt with on cancel.
#[derive(Debug)]
pub enum CleanupOutcome {
    Aggressive(CleanupReport),
    /// The aggressive pass was refused or incomplete; only leftovers were swept.
    Fallback { reason: String, sweep: SweepReport },
}

#[derive(Debug)]
pub struct CancelOutcome {
    pub session_id: String,
    pub termination: Option<Termination>,
    pub cleanup: CleanupOutcome,
}

struct Inner {
    state: DownloadState,
    session: Option<DownloadSession>,
    process: Option<ProcessHandle>,
    control: Option<ControlChannel>,
    worker: Option<JoinHandle<()>>,
    coordinator: Option<JoinHandle<()>>,
    /// Every depot is done; process exits from here on are expected.
    task_finishing: bool,
    skipped: Vec<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: DownloadState::Idle,
            session: None,
            process: None,
            control: None,
            worker: None,
            coordinator: None,
            task_finishing: false,
            skipped: vec![],
        }
    }

    fn is_current(&self, session_id: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.session_id == session_id)
    }
}

struct Shared {
    settings: Settings,
    store: SessionStore,
    sink: Arc<dyn EventSink>,
    cleanup: CleanupEngine,
    post_processor: Option<Arc<dyn PostProcessor>>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DownloadEvent) {
        self.sink.emit(event);
    }

    fn persist(&self, inner: &Inner) {
        if let Some(session) = &inner.session {
            if let Err(e) = self.store.save(session) {
                log::error!("failed to persist session {}: {e}", session.session_id);
            }
        }
    }

    /// Apply a transition if the state machine allows it. Persists and notifies.
    fn set_state(&self, inner: &mut Inner, next: DownloadState) -> bool {
        let current = inner.state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            log::warn!("rejected state transition {current} -> {next}");
            return false;
        }
        log::info!("download state {current} -> {next}");
        inner.state = next;
        if let Some(session) = inner.session.as_mut() {
            session.download_state = next;
        }
        self.persist(inner);
        self.emit(DownloadEvent::StateChanged { state: next });
        true
    }

    fn fail(&self, inner: &mut Inner, message: String) {
        inner.process = None;
        if let Some(session) = inner.session.as_mut() {
            session.error_message = message.clone();
        }
        let next = if LauncherError::looks_cancelled(&message) {
            DownloadState::Cancelled
        } else {
            DownloadState::Error
        };
        self.set_state(inner, next);
        if next == DownloadState::Cancelled {
            self.emit(DownloadEvent::Cancelled);
        } else {
            self.emit(DownloadEvent::Error { message });
        }
    }

    /// The downloader vanished without a stop request. Always ends in `Cancelled`.
    fn end_unexpectedly(&self, inner: &mut Inner, message: String) {
        if let Some(control) = &inner.control {
            control.request_stop();
        }
        inner.process = None;
        if let Some(session) = inner.session.as_mut() {
            session.error_message = message.clone();
        }
        self.set_state(inner, DownloadState::Cancelled);
        self.emit(DownloadEvent::Error { message });
        self.emit(DownloadEvent::Cancelled);
    }

    /// Returns `true` once the coordinator for `session_id` has nothing left to do.
    fn handle_task_event(&self, session_id: &str, event: TaskEvent) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(session_id) {
            log::debug!("dropping event for stale session {session_id}");
            return true;
        }

        match event {
            TaskEvent::ProcessStarted { depot_id, pid } => {
                log::info!("depot {depot_id} running as pid {pid}");
                inner.process = Some(ProcessHandle::new(pid));
                if let Some(session) = inner.session.as_mut() {
                    if let Some(i) = session.selected_depots.iter().position(|d| *d == depot_id) {
                        session.current_depot_index = i;
                    }
                }
                self.persist(&inner);
                false
            }
            TaskEvent::ProcessExited { depot_id, pid, code } => {
                log::info!("depot {depot_id} process {pid} exited ({code:?})");
                if inner.process.map(|h| h.pid()) == Some(pid) {
                    inner.process = None;
                }
                false
            }
            TaskEvent::Progress(message) => {
                self.emit(DownloadEvent::Progress { message });
                false
            }
            TaskEvent::PercentChanged { depot_id, percent } => {
                self.emit(DownloadEvent::PercentChanged { percent, depot_id });
                false
            }
            TaskEvent::BytesChanged { downloaded, total } => {
                let grew = inner
                    .session
                    .as_mut()
                    .is_some_and(|s| s.record_bytes(downloaded, total));
                if grew {
                    self.persist(&inner);
                }
                self.emit(DownloadEvent::BytesChanged { downloaded, total });
                false
            }
            TaskEvent::UnitCompleted(depot_id) => {
                let all_done = match inner.session.as_mut() {
                    Some(session) => {
                        session.mark_depot_completed(&depot_id);
                        session.all_depots_completed()
                    }
                    None => false,
                };
                self.persist(&inner);
                self.emit(DownloadEvent::UnitCompleted {
                    depot_id: depot_id.clone(),
                });
                if all_done {
                    log::info!("all depots completed, liveness monitor stopped");
                    inner.task_finishing = true;
                }
                false
            }
            TaskEvent::UnitSkipped(depot_id) => {
                inner.skipped.push(depot_id);
                false
            }
            TaskEvent::PostProcess(message) => {
                self.emit(DownloadEvent::PostProcess { message });
                false
            }
            TaskEvent::Finished { install_dir } => {
                if !matches!(inner.state, DownloadState::Downloading | DownloadState::Paused) {
                    log::info!("task finished after {}; ignoring", inner.state);
                    return true;
                }
                inner.process = None;
                let complete = inner
                    .session
                    .as_ref()
                    .is_some_and(DownloadSession::all_depots_completed);
                if complete && self.set_state(&mut inner, DownloadState::Completed) {
                    if let Some(control) = &inner.control {
                        control.set_paused(false);
                    }
                    self.emit(DownloadEvent::Finished {
                        session_id: session_id.to_string(),
                        install_path: install_dir.to_string_lossy().to_string(),
                    });
                } else if complete {
                    let message = format!("Download finished while {}", inner.state);
                    self.fail(&mut inner, message);
                } else {
                    let missing = if inner.skipped.is_empty() {
                        inner
                            .session
                            .as_ref()
                            .map(DownloadSession::pending_depots)
                            .unwrap_or_default()
                    } else {
                        inner.skipped.clone()
                    };
                    let message = format!(
                        "Download finished with incomplete depots: {}",
                        missing.join(", ")
                    );
                    log::error!("{message}");
                    self.fail(&mut inner, message);
                }
                true
            }
            TaskEvent::Cancelled => {
                if matches!(inner.state, DownloadState::Cancelling | DownloadState::Cancelled) {
                    return true;
                }
                inner.process = None;
                self.set_state(&mut inner, DownloadState::Cancelled);
                self.emit(DownloadEvent::Cancelled);
                true
            }
            TaskEvent::Terminated(message) => {
                if matches!(inner.state, DownloadState::Cancelling | DownloadState::Cancelled) {
                    return true;
                }
                log::error!("{message}");
                self.end_unexpectedly(&mut inner, message);
                true
            }
            TaskEvent::Error(message) => {
                if matches!(inner.state, DownloadState::Cancelling | DownloadState::Cancelled) {
                    log::debug!("suppressing task error during cancellation: {message}");
                    return true;
                }
                log::error!("download task failed: {message}");
                self.fail(&mut inner, message);
                true
            }
        }
    }

    /// Pid of a tracked process that looks dead while it should be running.
    fn dead_process(&self, session_id: &str) -> Option<u32> {
        let inner = self.lock();
        if !inner.is_current(session_id)
            || inner.state != DownloadState::Downloading
            || inner.task_finishing
        {
            return None;
        }
        inner
            .process
            .filter(|h| !h.is_alive())
            .map(|h| h.pid())
    }

    /// Second look after the confirmation delay. Returns `true` when the session was ended.
    fn confirm_unexpected_termination(&self, session_id: &str, pid: u32) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(session_id) {
            return true;
        }
        if inner.state != DownloadState::Downloading || inner.task_finishing {
            return false;
        }
        let still_dead = inner
            .process
            .is_some_and(|h| h.pid() == pid && !h.is_alive());
        if !still_dead {
            return false;
        }

        log::error!("{UNEXPECTED_TERMINATION} (pid {pid})");
        self.end_unexpectedly(&mut inner, UNEXPECTED_TERMINATION.to_string());
        true
    }

    /// Emit the transfer rate while downloading; pauses restart the measurement.
    fn sample_speed(&self, session_id: &str, meter: &mut SpeedMeter) {
        let inner = self.lock();
        if !inner.is_current(session_id) || inner.state != DownloadState::Downloading {
            meter.reset();
            return;
        }
        let downloaded = inner.session.as_ref().map_or(0, |s| s.downloaded_size);
        if let Some(bytes_per_sec) = meter.sample(std::time::Instant::now(), downloaded) {
            self.emit(DownloadEvent::SpeedChanged { bytes_per_sec });
        }
    }
}

async fn coordinate(
    shared: Arc<Shared>,
    session_id: String,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
) {
    let mut monitor = tokio::time::interval(shared.settings.monitor_interval());
    monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);
    monitor.tick().await;
    let confirm_delay = shared.settings.termination_confirm_delay();
    let mut suspect: Option<(u32, Instant)> = None;
    let mut speed = SpeedMeter::default();

    loop {
        let deadline = suspect.map(|(_, at)| at);
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if shared.handle_task_event(&session_id, event) {
                        break;
                    }
                }
                None => {
                    log::debug!("task channel for {session_id} closed");
                    break;
                }
            },
            _ = monitor.tick() => {
                shared.sample_speed(&session_id, &mut speed);
                if suspect.is_none() {
                    if let Some(pid) = shared.dead_process(&session_id) {
                        log::warn!("process {pid} not alive, confirming in {confirm_delay:?}");
                        suspect = Some((pid, Instant::now() + confirm_delay));
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((pid, _)) = suspect.take() {
                    if shared.confirm_unexpected_termination(&session_id, pid) {
                        break;
                    }
                }
            }
        }
    }
    log::debug!("coordinator for {session_id} finished");
}

/// Top-level entry point: start, pause, resume and cancel depot downloads.
///
/// All methods must be called from within a tokio runtime.
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    pub fn new(settings: Settings, sink: Arc<dyn EventSink>) -> Result<Self> {
        let cleanup = CleanupEngine::from_settings(&settings);
        let post_processor = CommandPostProcessor::from_settings(&settings)?
            .map(|p| Arc::new(p) as Arc<dyn PostProcessor>);
        Ok(Self::with_parts(settings, sink, cleanup, post_processor))
    }

    pub fn with_parts(
        settings: Settings,
        sink: Arc<dyn EventSink>,
        cleanup: CleanupEngine,
        post_processor: Option<Arc<dyn PostProcessor>>,
    ) -> Self {
        let store = SessionStore::new(settings.sessions_file());
        Self {
            shared: Arc::new(Shared {
                settings,
                store,
                sink,
                cleanup,
                post_processor,
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.shared.store
    }

    pub fn state(&self) -> DownloadState {
        self.shared.lock().state
    }

    pub fn current_session(&self) -> Option<DownloadSession> {
        self.shared.lock().session.clone()
    }

    pub fn session_info(&self) -> Option<SessionSummary> {
        self.shared.lock().session.as_ref().map(DownloadSession::summary)
    }

    pub fn process_id(&self) -> Option<u32> {
        self.shared.lock().process.map(|h| h.pid())
    }

    pub fn start_download(
        &self,
        game: GameData,
        selected_depots: Vec<String>,
        dest_path: &Path,
    ) -> Result<String> {
        game.validate()?;
        if selected_depots.is_empty() {
            return Err(LauncherError::validation("no depots selected"));
        }
        if !dest_path.is_dir() {
            return Err(LauncherError::validation(format!(
                "destination {} does not exist",
                dest_path.display()
            )));
        }
        for depot in &selected_depots {
            if !game.depots.contains_key(depot) {
                log::warn!("depot {depot} has no key in the game data");
            }
        }
        let runtime = Handle::try_current().map_err(|_| {
            LauncherError::Runtime("start_download needs a tokio runtime".to_string())
        })?;

        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.state.is_active() {
            return Err(LauncherError::validation(format!(
                "a download is already {}",
                inner.state
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let options = TaskOptions::from_settings(&shared.settings, &session_id)?;
        let session =
            DownloadSession::new(session_id.clone(), game.clone(), selected_depots.clone(), dest_path);
        shared.store.save(&session)?;

        let control = ControlChannel::default();
        let mut task = DownloadTask::new(
            session_id.clone(),
            game,
            selected_depots,
            dest_path,
            options,
            control.clone(),
        );
        if let Some(processor) = &shared.post_processor {
            task = task.with_post_processor(processor.clone());
        }

        inner.session = Some(session);
        inner.process = None;
        inner.control = Some(control);
        inner.task_finishing = false;
        inner.skipped.clear();
        inner.state = DownloadState::Downloading;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.worker = Some(runtime.spawn(async move {
            let _ = task.run(&tx).await;
        }));
        inner.coordinator = Some(runtime.spawn(coordinate(
            shared.clone(),
            session_id.clone(),
            rx,
        )));

        log::info!("download session {session_id} started");
        shared.emit(DownloadEvent::Started {
            session_id: session_id.clone(),
        });
        shared.emit(DownloadEvent::StateChanged {
            state: DownloadState::Downloading,
        });
        Ok(session_id)
    }

    /// Suspend the running downloader. `Ok(false)` when there is nothing to pause.
    pub fn pause(&self) -> Result<bool> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.state != DownloadState::Downloading {
            return Ok(false);
        }
        let Some(handle) = inner.process else {
            log::info!("pause ignored: no running process");
            return Ok(false);
        };
        if !handle.is_alive() {
            log::info!("pause ignored: process {} already exited", handle.pid());
            return Ok(false);
        }
        handle.suspend()?;
        if let Some(control) = &inner.control {
            control.set_paused(true);
        }
        shared.set_state(&mut inner, DownloadState::Paused);
        shared.emit(DownloadEvent::Paused);
        log::info!("download paused (pid {})", handle.pid());
        Ok(true)
    }

    pub fn resume(&self) -> Result<bool> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.state != DownloadState::Paused {
            return Ok(false);
        }
        let Some(handle) = inner.process else {
            log::warn!("resume ignored: no tracked process");
            return Ok(false);
        };
        handle.resume()?;
        if let Some(control) = &inner.control {
            control.set_paused(false);
        }
        shared.set_state(&mut inner, DownloadState::Downloading);
        shared.emit(DownloadEvent::Resumed);
        log::info!("download resumed (pid {})", handle.pid());
        Ok(true)
    }

    /// Stop the download and clean up after it. Always ends in `Cancelled`.
    ///
    /// Returns `None` when no download is running.
    pub async fn cancel(&self) -> Option<CancelOutcome> {
        let shared = self.shared.clone();
        let settings = &shared.settings;

        let (session, handle, worker) = {
            let mut inner = shared.lock();
            if !matches!(inner.state, DownloadState::Downloading | DownloadState::Paused) {
                return None;
            }
            let session = inner.session.clone()?;
            log::info!("cancelling download {}", session.session_id);
            shared.set_state(&mut inner, DownloadState::Cancelling);
            if let Some(control) = &inner.control {
                control.request_stop();
            }
            (session, inner.process.take(), inner.worker.take())
        };

        let termination = match handle {
            Some(handle) => {
                let outcome = handle
                    .terminate(settings.graceful_timeout(), settings.kill_timeout())
                    .await;
                log::info!("process {} termination: {outcome:?}", handle.pid());
                Some(outcome)
            }
            None => None,
        };

        if let Some(worker) = worker {
            let bound =
                settings.graceful_timeout() + settings.kill_timeout() + Duration::from_secs(1);
            if tokio::time::timeout(bound, worker).await.is_err() {
                log::warn!("download worker did not stop within {bound:?}");
            }
        }

        let cleanup = self.cleanup_after_cancel(&session).await;

        {
            let mut inner = shared.lock();
            if inner.is_current(&session.session_id) {
                inner.process = None;
                shared.set_state(&mut inner, DownloadState::Cancelled);
                if matches!(cleanup, CleanupOutcome::Aggressive(_)) {
                    match shared.store.delete(&session.session_id) {
                        Ok(_) => log::info!("session {} removed", session.session_id),
                        Err(e) => log::error!("failed to remove session: {e}"),
                    }
                }
            }
        }
        shared.emit(DownloadEvent::Cancelled);

        Some(CancelOutcome {
            session_id: session.session_id,
            termination,
            cleanup,
        })
    }

    async fn cleanup_after_cancel(&self, session: &DownloadSession) -> CleanupOutcome {
        let install_dir = session.game_data.install_dir(&session.dest_path());
        let mut sweep_roots: Vec<PathBuf> =
            vec![self.shared.settings.session_work_dir(&session.session_id)];

        let reason = match &install_dir {
            Ok(dir) if dir.is_dir() => {
                sweep_roots.push(dir.clone());
                let shared = self.shared.clone();
                let (dir, game, id) = (
                    dir.clone(),
                    session.game_data.clone(),
                    session.session_id.clone(),
                );
                let result = tokio::task::spawn_blocking(move || {
                    shared.cleanup.safe_cancel_cleanup(&dir, &game, &id)
                })
                .await;
                match result {
                    Ok(Ok(report)) if report.is_clean() => {
                        log::info!(
                            "aggressive cleanup removed {} files, {} dirs",
                            report.files_removed,
                            report.dirs_removed
                        );
                        return CleanupOutcome::Aggressive(report);
                    }
                    Ok(Ok(report)) => format!(
                        "aggressive cleanup incomplete: {} errors, {} items left",
                        report.errors.len(),
                        report.residue.len()
                    ),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("cleanup worker failed: {e}"),
                }
            }
            Ok(dir) => format!("install directory not found: {}", dir.display()),
            Err(e) => e.to_string(),
        };

        log::warn!("falling back to temp-file sweep: {reason}");
        let session_id = session.session_id.clone();
        let sweep = tokio::task::spawn_blocking(move || {
            TempFileSweeper::new(session_id).sweep(&sweep_roots)
        })
        .await
        .unwrap_or_else(|e| SweepReport {
            errors: vec![format!("sweep worker failed: {e}")],
            ..Default::default()
        });
        if !sweep.is_clean() {
            log::warn!("fallback sweep reported errors: {:?}", sweep.errors);
        }
        CleanupOutcome::Fallback { reason, sweep }
    }

    /// Stop monitoring and the worker, terminate a live process, keep the session resumable.
    pub async fn shutdown(&self) {
        let shared = self.shared.clone();
        let (handle, worker, coordinator) = {
            let mut inner = shared.lock();
            if let Some(control) = &inner.control {
                control.request_stop();
            }
            if matches!(inner.state, DownloadState::Downloading | DownloadState::Paused) {
                shared.set_state(&mut inner, DownloadState::Cancelled);
            }
            (
                inner.process.take(),
                inner.worker.take(),
                inner.coordinator.take(),
            )
        };
        if let Some(coordinator) = coordinator {
            coordinator.abort();
        }
        if let Some(handle) = handle {
            let outcome = handle
                .terminate(shared.settings.graceful_timeout(), shared.settings.kill_timeout())
                .await;
            log::info!("shutdown terminated pid {}: {outcome:?}", handle.pid());
        }
        if let Some(worker) = worker {
            let _ = tokio::time::timeout(shared.settings.graceful_timeout(), worker).await;
        }
        let mut inner = shared.lock();
        inner.control = None;
    }
}

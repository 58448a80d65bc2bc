use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::session::{format_size, DownloadState};

/// Events the manager publishes for a presentation layer.
///
/// Serialized as `{ "type": ..., "data": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
    Started {
        session_id: String,
    },
    /// Raw downloader output or a status line.
    Progress {
        message: String,
    },
    PercentChanged {
        percent: u8,
        depot_id: String,
    },
    BytesChanged {
        downloaded: u64,
        total: u64,
    },
    SpeedChanged {
        bytes_per_sec: u64,
    },
    StateChanged {
        state: DownloadState,
    },
    UnitCompleted {
        depot_id: String,
    },
    PostProcess {
        message: String,
    },
    Paused,
    Resumed,
    Finished {
        session_id: String,
        install_path: String,
    },
    Cancelled,
    Error {
        message: String,
    },
}

impl DownloadEvent {
    /// Channel name used when forwarding to a webview.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Progress { .. }
            | Self::PercentChanged { .. }
            | Self::BytesChanged { .. }
            | Self::SpeedChanged { .. } => "download://progress",
            Self::Finished { .. } => "download://finished",
            Self::Error { .. } => "download://error",
            _ => "download://state",
        }
    }
}

/// Turns successive downloaded-byte readings into a transfer rate.
#[derive(Debug, Default)]
pub struct SpeedMeter {
    last: Option<(Instant, u64)>,
}

impl SpeedMeter {
    /// Bytes per second since the previous reading. `None` for the first reading.
    pub fn sample(&mut self, at: Instant, downloaded: u64) -> Option<u64> {
        let (then, before) = self.last.replace((at, downloaded))?;
        let elapsed = at.checked_duration_since(then)?.as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some((downloaded.saturating_sub(before) as f64 / elapsed) as u64)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DownloadEvent);
}

/// Forwards events into an unbounded channel; a dropped receiver silently discards them.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: DownloadEvent) {
        let _ = self.tx.send(event);
    }
}

/// Mirrors events to the log only.
#[derive(Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: DownloadEvent) {
        match &event {
            DownloadEvent::Progress { message } => {
                let preview = if message.len() > 500 {
                    let mut end = 500;
                    while !message.is_char_boundary(end) {
                        end -= 1;
                    }
                    format!("{}…", &message[..end])
                } else {
                    message.clone()
                };
                log::debug!("download: {}", preview.replace('\n', "\\n"));
            }
            DownloadEvent::Error { message } => log::error!("download error: {message}"),
            other => log::info!("download event: {other:?}"),
        }
    }
}

#[cfg(feature = "tauri")]
pub use tauri_sink::TauriSink;

#[cfg(feature = "tauri")]
mod tauri_sink {
    use tauri::{AppHandle, Emitter};

    use super::{DownloadEvent, EventSink};

    /// Frontend bridge. Event names: `download://progress`, `download://state`,
    /// `download://finished`, `download://error`.
    pub struct TauriSink {
        app: AppHandle,
    }

    impl TauriSink {
        pub fn new(app: AppHandle) -> Self {
            Self { app }
        }
    }

    impl EventSink for TauriSink {
        fn emit(&self, event: DownloadEvent) {
            let _ = self.app.emit(event.channel(), event);
        }
    }
}

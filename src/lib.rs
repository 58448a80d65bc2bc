pub mod cache;
pub mod cleanup;
pub mod config;
pub mod errors;
pub mod game_data;
pub mod logger;
pub mod manager;
pub mod parser;
pub mod post_process;
pub mod process;
pub mod progress;
pub mod session;
pub mod task;

pub use cleanup::{CleanupEngine, CleanupReport, SafetyGate, SafetyPolicy, TempFileSweeper};
pub use config::Settings;
pub use errors::{LauncherError, Result};
pub use game_data::{DepotInfo, GameData};
pub use manager::{CancelOutcome, CleanupOutcome, DownloadManager};
pub use progress::{ChannelSink, DownloadEvent, EventSink, LogSink};
pub use session::{DownloadSession, DownloadState, SessionStore};

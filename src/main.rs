use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use depot_launcher_lib::manager::CleanupOutcome;
use depot_launcher_lib::progress::format_speed;
use depot_launcher_lib::session::format_size;
use depot_launcher_lib::{
    logger, ChannelSink, DownloadEvent, DownloadManager, DownloadState, GameData, Result, Settings,
};

const USAGE: &str = "usage: depot-launcher <game_data.json> <dest_path> <depot>...";
const SETTINGS_ENV: &str = "DEPOT_LAUNCHER_SETTINGS";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_event(event: &DownloadEvent) {
    match event {
        DownloadEvent::Progress { message } | DownloadEvent::PostProcess { message } => {
            println!("{message}")
        }
        DownloadEvent::PercentChanged { percent, depot_id } => {
            println!("[depot {depot_id}] {percent}%")
        }
        DownloadEvent::BytesChanged { downloaded, total } => {
            println!("{} / {}", format_size(*downloaded), format_size(*total))
        }
        DownloadEvent::SpeedChanged { bytes_per_sec } => {
            println!("Download Speed: {}", format_speed(*bytes_per_sec))
        }
        other => match serde_json::to_string(other) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{other:?}"),
        },
    }
}

fn print_cleanup(cleanup: &CleanupOutcome) {
    match cleanup {
        CleanupOutcome::Aggressive(report) => println!(
            "removed {} files and {} directories ({})",
            report.files_removed,
            report.dirs_removed,
            format_size(report.bytes_freed)
        ),
        CleanupOutcome::Fallback { reason, sweep } => {
            println!("install directory kept: {reason}");
            println!(
                "swept {} temporary files ({})",
                sweep.files_removed,
                format_size(sweep.bytes_freed)
            );
            for error in &sweep.errors {
                eprintln!("sweep: {error}");
            }
        }
    }
}

async fn run() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    }

    let settings_path = match std::env::var_os(SETTINGS_ENV) {
        Some(path) => PathBuf::from(path),
        None => Settings::default_path()?,
    };
    let settings = Settings::load(&settings_path)?;
    logger::init(&settings.logs_dir(), &settings.log_level)?;

    let game: GameData = serde_json::from_str(&std::fs::read_to_string(&args[0])?)?;
    let dest = PathBuf::from(&args[1]);
    let depots = args[2..].to_vec();

    let (sink, mut events) = ChannelSink::new();
    let manager = DownloadManager::new(settings, Arc::new(sink))?;

    let retention = manager.settings().session_retention_days;
    match manager.store().cleanup_old_sessions(retention) {
        Ok(removed) if !removed.is_empty() => {
            log::info!("removed {} sessions older than {retention} days", removed.len())
        }
        Ok(_) => {}
        Err(e) => log::warn!("session cleanup failed: {e}"),
    }

    let session_id = manager.start_download(game, depots, &dest)?;
    println!("session {session_id} started, press Ctrl-C to cancel");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                print_event(&event);
                let terminal = matches!(
                    event,
                    DownloadEvent::Finished { .. } | DownloadEvent::Cancelled | DownloadEvent::Error { .. }
                );
                if terminal && manager.state().is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("cancelling...");
                if let Some(outcome) = manager.cancel().await {
                    print_cleanup(&outcome.cleanup);
                }
                break;
            }
        }
    }

    Ok(match manager.state() {
        DownloadState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

use crate::errors::{LauncherError, Result};

const LOG_STEM: &str = "depot-launcher";
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const KEPT_LOGS: u32 = 5;

fn err(msg: impl Into<String>) -> LauncherError {
    LauncherError::Config(msg.into())
}

/// Active log file plus the pattern rolled files are renamed to.
fn log_paths(log_dir: &Path) -> (PathBuf, String) {
    let active = log_dir.join(format!("{LOG_STEM}.log"));
    let rolled = log_dir
        .join(format!("{LOG_STEM}.{{}}.log"))
        .to_string_lossy()
        .to_string();
    (active, rolled)
}

/// Parse a level name ("debug", "WARNING", ...) into a filter, defaulting to `Info`.
pub fn parse_level(level: &str) -> LevelFilter {
    let normalized = match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    };
    LevelFilter::from_str(&normalized).unwrap_or(LevelFilter::Info)
}

fn rolling_appender(log_file: &Path, rolled_pattern: &str) -> Result<RollingFileAppender> {
    let roller = FixedWindowRoller::builder()
        .build(rolled_pattern, KEPT_LOGS)
        .map_err(|e| err(e.to_string()))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(MAX_LOG_BYTES)), Box::new(roller));

    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}",
        )))
        .build(log_file, Box::new(policy))
        .map_err(|e| err(e.to_string()))
}

/// Route `log` records into a size-rolled file under `log_dir`.
///
/// Debug builds mirror records to stderr, leaving stdout to the CLI. Calling this twice is a
/// no-op.
pub fn init(log_dir: &Path, level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let (log_file, rolled) = log_paths(log_dir);
    let file = rolling_appender(&log_file, &rolled)?;

    let mut config = Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");
    if cfg!(debug_assertions) {
        let console = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new("[{l}] {m}{n}")))
            .build();
        config = config.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    let config = config
        .build(root.build(parse_level(level)))
        .map_err(|e| err(e.to_string()))?;

    if log4rs::init_config(config).is_err() {
        return Ok(());
    }

    std::panic::set_hook(Box::new(|info| {
        log::error!("panic: {info}");
    }));

    log::info!("logging to {}", log_file.display());
    Ok(())
}

use crate::relay_logic::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "critical" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Where and how the relay writes its log files.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub level: log::LevelFilter,
    /// Run logs are named `<file_stem>_<timestamp>.log`.
    pub file_stem: String,
    /// Logs of earlier runs kept next to the new one.
    pub keep_files: usize,
}

impl LogSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.log_dir(),
            level: parse_level(&config.log_level()),
            file_stem: config.log_file_stem(),
            keep_files: config.log_keep_files(),
        }
    }

    fn file_name(&self, started: DateTime<Local>) -> String {
        format!("{}_{}.log", self.file_stem, started.format(TIMESTAMP_FORMAT))
    }

    // Only files this relay created are candidates for pruning
    fn is_run_log(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        name.strip_prefix(self.file_stem.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .is_some_and(|rest| rest.ends_with(".log"))
    }
}

/// Installs the stdout + file logger and returns the path of this run's log.
pub fn setup_logging(settings: &LogSettings) -> Result<PathBuf> {
    fs::create_dir_all(&settings.dir)
        .with_context(|| format!("Failed to create log directory {}", settings.dir.display()))?;

    prune_run_logs(settings)?;

    let log_path = settings.dir.join(settings.file_name(Local::now()));
    let log_file = fern::log_file(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(settings.level)
        .chain(std::io::stdout())
        .chain(log_file)
        .apply()?;

    log::info!("Logging to {}", log_path.display());
    Ok(log_path)
}

// Deletes run logs beyond the `keep_files` newest. Returns what was deleted.
fn prune_run_logs(settings: &LogSettings) -> Result<Vec<PathBuf>> {
    let mut run_logs: Vec<_> = fs::read_dir(&settings.dir)?
        .filter_map(|res| res.ok())
        .map(|entry| entry.path())
        .filter(|path| settings.is_run_log(path))
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .collect();

    // Newest first
    run_logs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = Vec::new();
    for (_, path) in run_logs.into_iter().skip(settings.keep_files) {
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            // The logger is not installed yet
            Err(e) => eprintln!("Failed to delete old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

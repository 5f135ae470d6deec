use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<LogLevel> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum LogFile {
    Server,
    Error,
    Net,
}

struct Logger {
    level: LogLevel,
    files: Mutex<BTreeMap<LogFile, File>>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Opens the log files under `<root>/log/`. Idempotent; the first call wins.
pub fn init(root: &Path, level: LogLevel) -> Result<(), String> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let log_dir = root.join("log");
    std::fs::create_dir_all(&log_dir)
        .map_err(|err| format!("log directory create failed: {}", err))?;

    let mut files = BTreeMap::new();
    for (log_file, name) in [
        (LogFile::Server, "server.log"),
        (LogFile::Error, "error.log"),
        (LogFile::Net, "net.log"),
    ] {
        let path = log_dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| format!("open log {} failed: {}", name, err))?;
        files.insert(log_file, file);
    }

    LOGGER
        .set(Logger {
            level,
            files: Mutex::new(files),
        })
        .map_err(|_| "log system already initialized".to_string())?;
    Ok(())
}

pub fn log_debug(message: &str) {
    write_if(LogLevel::Debug, LogFile::Server, "DEBUG", message);
}

pub fn log_info(message: &str) {
    write_if(LogLevel::Info, LogFile::Server, "INFO", message);
}

pub fn log_warn(message: &str) {
    write_if(LogLevel::Warn, LogFile::Error, "WARN", message);
}

pub fn log_error(message: &str) {
    write_if(LogLevel::Error, LogFile::Error, "ERROR", message);
}

/// Critical entries land in both files so they are never missed when only
/// one is being watched.
pub fn log_critical(message: &str) {
    write_if(LogLevel::Error, LogFile::Error, "CRITICAL", message);
    write_if(LogLevel::Error, LogFile::Server, "CRITICAL", message);
}

/// Per-packet trace; only emitted at debug level.
pub fn log_net(message: &str) {
    write_if(LogLevel::Debug, LogFile::Net, "NET", message);
}

fn write_if(level: LogLevel, log_file: LogFile, tag: &str, message: &str) {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    if level < logger.level {
        return;
    }
    let line = format!("{} [{}] {}\n", format_timestamp(), tag, message);
    let Ok(mut files) = logger.files.lock() else {
        return;
    };
    if let Some(file) = files.get_mut(&log_file) {
        let _ = file.write_all(line.as_bytes());
        let _ = file.flush();
    }
}

fn format_timestamp() -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = ts / 86_400;
    let seconds_of_day = (ts % 86_400) as u32;
    let hour = seconds_of_day / 3_600;
    let minute = (seconds_of_day % 3_600) / 60;
    let second = seconds_of_day % 60;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:02}.{:02}.{} {:02}:{:02}:{:02}",
        day, month, year, hour, minute, second
    )
}

fn civil_from_days(days: i64) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = mp + if mp < 10 { 3 } else { -9 };
    let year = (y + if m <= 2 { 1 } else { 0 }) as i32;
    let month = (m as i32) as u32;
    let day = d as u32;
    (year, month, day)
}

//! Session logger for SegmentFE.
//!
//! One log file per launch, truncated at startup so it only holds the most
//! recent session:
//!   Windows:  `%APPDATA%\SegmentFE\segmentfe.log`
//!   Linux:    `~/.local/share/SegmentFE/segmentfe.log`
//!   macOS:    `~/Library/Application Support/SegmentFE/segmentfe.log`
//!
//! Use the `log_info!` / `log_warn!` / `log_err!` macros anywhere in the crate.
//! Every line is mirrored to stderr so a terminal launch shows model progress.
//! Before `init()` runs (unit tests, early startup) lines only go to stderr.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Panic,
}

impl Level {
    pub fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Panic => "PANIC",
        }
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, &format!($($arg)*))
    };
}

/// `[HH:MM:SS] [LEVEL] message`, clock in UTC.
pub fn format_line(secs_since_epoch: u64, level: Level, msg: &str) -> String {
    format!("[{}] [{}] {}", clock(secs_since_epoch), level.tag(), msg)
}

/// Write a tagged line to stderr and the session log. I/O errors are ignored
/// so logging can never take the application down.
pub fn write(level: Level, msg: &str) {
    let line = format_line(now_secs(), level, msg);
    eprintln!("{}", line);
    append(&line);
}

fn append(line: &str) {
    if let Some(mutex) = LOG_FILE.get()
        && let Ok(mut file) = mutex.lock()
    {
        let _ = writeln!(file, "{}", line);
    }
}

/// Open (truncate) the session log and install the panic hook.
/// Call once from `main` before the window is created.
pub fn init() {
    let path = data_dir().join("SegmentFE").join("segmentfe.log");

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path);

    match file {
        Ok(f) => {
            let _ = LOG_FILE.set(Mutex::new(f));
        }
        Err(e) => {
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            return;
        }
    }

    append(&session_header(now_secs()));
    append(&format!("Log file: {}", path.display()));
    append("Line times are UTC.");

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        append(&format_line(now_secs(), Level::Panic, &info.to_string()));
        prev(info);
    }));
}

/// Platform data directory (without the app sub-folder).
pub(crate) fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Time of day (UTC) for a session log line.
fn clock(secs: u64) -> String {
    let h = (secs % 86400) / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn session_header(secs: u64) -> String {
    format!(
        "=== SegmentFE {} session started {} UTC (unix {}) ===",
        env!("CARGO_PKG_VERSION"),
        utc_date_time(secs),
        secs
    )
}

/// `YYYY-MM-DD HH:MM:SS` in UTC, without a date-time dependency.
fn utc_date_time(secs: u64) -> String {
    // Civil-from-days over the proleptic Gregorian calendar, eras of 400 years.
    let z = secs / 86400 + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    format!("{:04}-{:02}-{:02} {}", year, month, day, clock(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_has_clock_and_level() {
        // 1970-01-01 13:05:09
        let secs = 13 * 3600 + 5 * 60 + 9;
        assert_eq!(
            format_line(secs, Level::Warn, "weights missing"),
            "[13:05:09] [WARN] weights missing"
        );
    }

    #[test]
    fn clock_wraps_at_midnight() {
        assert_eq!(clock(86400 + 61), "00:01:01");
    }

    #[test]
    fn session_header_states_utc_date() {
        let header = session_header(1_700_000_000);
        assert!(header.contains("2023-11-14 22:13:20 UTC"), "{}", header);
        assert!(header.contains("(unix 1700000000)"), "{}", header);
    }

    #[test]
    fn utc_date_handles_epoch_and_leap_day() {
        assert_eq!(utc_date_time(0), "1970-01-01 00:00:00");
        // 2024-02-29 12:00:00
        assert_eq!(utc_date_time(1_709_208_000), "2024-02-29 12:00:00");
    }

    #[test]
    fn macros_do_not_panic_without_init() {
        crate::log_info!("analyze requested for box {:?}", [1, 2, 3, 4]);
        crate::log_err!("no-op before init");
    }
}

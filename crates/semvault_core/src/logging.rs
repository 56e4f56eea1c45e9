//! Process-wide rolling file logs.
//!
//! Initialization happens at most once. Repeating it with identical settings
//! is a no-op; asking for a different level or directory afterwards is an
//! error. Log lines carry ids and counts only, never statement or note text.

use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle,
    Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};

const LOG_BASENAME: &str = "semvault";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_ROTATED: usize = 5;
const PANIC_SNIPPET_CHARS: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogSettings {
    level: LevelFilter,
    dir: PathBuf,
}

impl LogSettings {
    fn parse(level: &str, dir: &Path) -> Result<Self, LoggingError> {
        Ok(Self {
            level: parse_level(level)?,
            dir: checked_dir(dir)?,
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}", level_name(self.level), self.dir.display())
    }
}

struct ActiveLogger {
    settings: LogSettings,
    _handle: LoggerHandle,
}

#[derive(Debug)]
pub enum LoggingError {
    UnsupportedLevel(String),
    /// Directory is empty or relative.
    InvalidDirectory(String),
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    Backend(FlexiLoggerError),
    /// Logging already runs with other settings, shown as `level@dir`.
    AlreadyInitialized { active: String, requested: String },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedLevel(level) => {
                write!(f, "log level `{level}` is not one of trace|debug|info|warn|error")
            }
            Self::InvalidDirectory(reason) => write!(f, "log directory rejected: {reason}"),
            Self::CreateDirectory { path, source } => {
                write!(f, "cannot create `{}`: {source}", path.display())
            }
            Self::Backend(err) => write!(f, "log backend: {err}"),
            Self::AlreadyInitialized { active, requested } => write!(
                f,
                "logging is active as `{active}`, cannot switch to `{requested}`"
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDirectory { source, .. } => Some(source),
            Self::Backend(err) => Some(err),
            Self::UnsupportedLevel(_)
            | Self::InvalidDirectory(_)
            | Self::AlreadyInitialized { .. } => None,
        }
    }
}

/// Starts rolling file logs in `log_dir` (absolute) at `level`.
pub fn init_logging(level: &str, log_dir: impl AsRef<Path>) -> Result<(), LoggingError> {
    let wanted = LogSettings::parse(level, log_dir.as_ref())?;
    let active = ACTIVE.get_or_try_init(|| start(wanted.clone()))?;
    if active.settings == wanted {
        Ok(())
    } else {
        Err(LoggingError::AlreadyInitialized {
            active: active.settings.describe(),
            requested: wanted.describe(),
        })
    }
}

fn start(settings: LogSettings) -> Result<ActiveLogger, LoggingError> {
    std::fs::create_dir_all(&settings.dir).map_err(|source| LoggingError::CreateDirectory {
        path: settings.dir.clone(),
        source,
    })?;

    let spec = FileSpec::default()
        .directory(&settings.dir)
        .basename(LOG_BASENAME);
    let handle = Logger::with(LogSpecification::builder().default(settings.level).build())
        .log_to_file(spec)
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_ROTATED),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(LoggingError::Backend)?;

    install_panic_hook();
    info!(
        "event=logging_init module=core status=ok level={} log_dir={} version={}",
        level_name(settings.level),
        settings.dir.display(),
        env!("CARGO_PKG_VERSION")
    );

    Ok(ActiveLogger {
        settings,
        _handle: handle,
    })
}

/// `(level, log_dir)` once logging runs.
pub fn logging_status() -> Option<(&'static str, PathBuf)> {
    ACTIVE
        .get()
        .map(|active| (level_name(active.settings.level), active.settings.dir.clone()))
}

pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn parse_level(raw: &str) -> Result<LevelFilter, LoggingError> {
    let lowered = raw.trim().to_ascii_lowercase();
    let level = match lowered.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => return Err(LoggingError::UnsupportedLevel(lowered)),
    };
    Ok(level)
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn checked_dir(dir: &Path) -> Result<PathBuf, LoggingError> {
    if dir.as_os_str().is_empty() {
        return Err(LoggingError::InvalidDirectory("empty path".to_string()));
    }
    if dir.is_relative() {
        return Err(LoggingError::InvalidDirectory(format!(
            "`{}` is relative",
            dir.display()
        )));
    }
    Ok(dir.to_path_buf())
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let chained = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let thread = std::thread::current();
            let location = info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()))
                .unwrap_or_else(|| "unknown".to_string());
            error!(
                "event=panic_captured module=core status=error thread={} location={location} payload={}",
                thread.name().unwrap_or("unnamed"),
                panic_snippet(info)
            );
            chained(info);
        }));
    });
}

fn panic_snippet(info: &PanicHookInfo<'_>) -> String {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    single_line(&payload, PANIC_SNIPPET_CHARS)
}

/// Flattens newlines and caps the length, marking a cut with `...`.
fn single_line(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively_with_warning_alias() {
        assert_eq!(parse_level(" INFO ").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level("warning").unwrap(), LevelFilter::Warn);
        assert!(matches!(
            parse_level("chatty"),
            Err(LoggingError::UnsupportedLevel(level)) if level == "chatty"
        ));
    }

    #[test]
    fn directory_must_be_absolute_and_non_empty() {
        assert!(matches!(
            checked_dir(Path::new("")),
            Err(LoggingError::InvalidDirectory(_))
        ));
        assert!(matches!(
            checked_dir(Path::new("var/log")),
            Err(LoggingError::InvalidDirectory(_))
        ));
    }

    #[test]
    fn single_line_flattens_and_caps() {
        assert_eq!(single_line("a\nb", 10), "a b");
        assert_eq!(single_line("abcdefgh", 4), "abcd...");
    }

    #[test]
    fn repeated_init_must_match_first_settings() {
        let first = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();

        init_logging("info", first.path()).unwrap();
        init_logging("INFO", first.path()).unwrap();

        assert!(matches!(
            init_logging("debug", first.path()),
            Err(LoggingError::AlreadyInitialized { .. })
        ));
        assert!(matches!(
            init_logging("info", other.path()),
            Err(LoggingError::AlreadyInitialized { .. })
        ));
        assert_eq!(
            logging_status(),
            Some(("info", first.path().to_path_buf()))
        );
    }
}

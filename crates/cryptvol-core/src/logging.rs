//! Logger bootstrap plus the per-handle diagnostic channel.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::fmt;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "CRYPTVOL_LOG_FORMAT";
const LEVEL_ENV: &str = "CRYPTVOL_LOG_LEVEL";

/// Initialize a global logger.
///
/// The first caller wins; subsequent calls are no-ops. If `RUST_LOG` is
/// unset, the `default_level` argument is used, overridable via
/// `CRYPTVOL_LOG_LEVEL`. `CRYPTVOL_LOG_FORMAT=plain` disables JSON output.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let default_level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let filter = env::var("RUST_LOG").unwrap_or(default_level);

    let format = env::var(FORMAT_ENV)
        .unwrap_or_else(|_| String::from("json"))
        .to_lowercase();

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(filter));
    if format == "json" {
        builder.format(|buf, record| {
            let ts = buf.timestamp().to_string();
            let payload = json!({
                "timestamp": ts,
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

/// Severity attached to a backend diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Normal,
    Error,
    Verbose,
    Debug,
}

impl LogLevel {
    /// Matching `log` crate level.
    pub fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Normal => log::Level::Info,
            LogLevel::Error => log::Level::Error,
            LogLevel::Verbose => log::Level::Debug,
            LogLevel::Debug => log::Level::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Normal => "normal",
            LogLevel::Error => "error",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
        };
        f.write_str(label)
    }
}

/// One diagnostic emitted by a backend while serving a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Receives diagnostics for a single device handle.
pub type LogCallback = Box<dyn FnMut(LogLevel, &str) + Send>;

/// Whether debug-level diagnostics are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugLevel {
    #[default]
    None,
    All,
}

/// Deliver `records` for the call `function` to the handle's callback and to
/// the `log` facade. Debug records are dropped unless `debug` is `All`.
pub(crate) fn dispatch(
    function: &str,
    records: Vec<LogRecord>,
    debug: DebugLevel,
    callback: Option<&mut LogCallback>,
) {
    let mut callback = callback;
    for record in records {
        if record.level == LogLevel::Debug && debug == DebugLevel::None {
            continue;
        }
        log::log!(
            target: "cryptvol::backend",
            record.level.as_log_level(),
            "{}: {}",
            function,
            record.message
        );
        if let Some(cb) = callback.as_deref_mut() {
            cb(record.level, &record.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn init_is_idempotent() {
        init("warn");
        init("debug");
    }

    #[test]
    fn dispatch_filters_debug_records() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut callback: LogCallback = Box::new(move |level, msg| {
            sink.lock().unwrap().push((level, msg.to_string()));
        });

        let records = vec![
            LogRecord::new(LogLevel::Normal, "Key slot 0 created."),
            LogRecord::new(LogLevel::Debug, "PBKDF2 benchmark skipped"),
        ];
        dispatch("crypt_format", records.clone(), DebugLevel::None, Some(&mut callback));
        assert_eq!(seen.lock().unwrap().len(), 1);

        dispatch("crypt_format", records, DebugLevel::All, Some(&mut callback));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].0, LogLevel::Debug);
    }
}

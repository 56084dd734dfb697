use std::fmt;
use std::sync::Arc;
use chrono::Local;
use colored::*;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Logging errors
#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
}

/// Result type for logging operations
type LogResult<T> = Result<T, LogError>;

/// Logging levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl LogLevel {
    /// Parse log level from string
    pub fn parse(s: &str) -> LogResult<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "err" => Ok(LogLevel::Error),
            _ => Err(LogError::InvalidLogLevel(s.to_string())),
        }
    }
}

/// Logger state shared behind the global handle
struct Logger {
    level: LogLevel,
    file: Option<Arc<Mutex<File>>>,
    stdout: bool,
}

static LOGGER: OnceCell<Logger> = OnceCell::new();

impl Logger {
    async fn log(&self, level: LogLevel, message: &str, module: &str) -> LogResult<()> {
        if level < self.level {
            return Ok(());
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        // Plain text version for the log file
        let plain = format!("{} [{}] [{}] {}\n", timestamp, level, module, message);

        if let Some(file) = &self.file {
            let mut guard = file.lock().await;
            guard.write_all(plain.as_bytes()).await?;
        }

        if self.stdout {
            let level_str = match level {
                LogLevel::Debug => level.to_string().blue(),
                LogLevel::Info => level.to_string().green(),
                LogLevel::Warn => level.to_string().yellow(),
                LogLevel::Error => level.to_string().red().bold(),
            };
            let body = match level {
                LogLevel::Error => message.red(),
                LogLevel::Warn => message.yellow(),
                _ => message.normal(),
            };
            println!("{} [{}] [{}] {}", timestamp, level_str, module.cyan(), body);
        }

        Ok(())
    }
}

/// Initialize the global logger. Subsequent calls are no-ops.
pub async fn init_logging(level: LogLevel, log_file: Option<&str>, stdout: bool) -> LogResult<()> {
    let file = if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Some(Arc::new(Mutex::new(file)))
    } else {
        None
    };

    let _ = LOGGER.set(Logger {
        level,
        file,
        stdout,
    });

    Ok(())
}

/// Initialize the logger from a config string like "info"
pub async fn init_from_config(level_str: &str, log_file: Option<&str>) -> LogResult<()> {
    let level = LogLevel::parse(level_str)?;
    init_logging(level, log_file, true).await
}

/// Internal log function used by the macros
pub async fn log_internal(level: LogLevel, message: &str, module: &str) -> LogResult<()> {
    match LOGGER.get() {
        Some(logger) => logger.log(level, message, module).await,
        None => {
            // Fallback before init so early failures are still visible
            println!(
                "{} [{}] [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level,
                module,
                message
            );
            Ok(())
        }
    }
}

/// Get module name from file path
pub fn get_module_name(file: &str) -> &str {
    file.split('/')
        .last()
        .unwrap_or(file)
        .split('\\')
        .last()
        .unwrap_or(file)
        .split('.')
        .next()
        .unwrap_or(file)
}

/// Log at debug level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {{
        let module = $crate::utils::logging::get_module_name(file!());
        let message = format!($($arg)*);
        tokio::spawn(async move {
            let _ = $crate::utils::logging::log_internal(
                $crate::utils::logging::LogLevel::Debug,
                &message,
                module
            ).await;
        });
    }}
}

/// Log at info level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        let module = $crate::utils::logging::get_module_name(file!());
        let message = format!($($arg)*);
        tokio::spawn(async move {
            let _ = $crate::utils::logging::log_internal(
                $crate::utils::logging::LogLevel::Info,
                &message,
                module
            ).await;
        });
    }}
}

/// Log at warn level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        let module = $crate::utils::logging::get_module_name(file!());
        let message = format!($($arg)*);
        tokio::spawn(async move {
            let _ = $crate::utils::logging::log_internal(
                $crate::utils::logging::LogLevel::Warn,
                &message,
                module
            ).await;
        });
    }}
}

/// Log at error level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        let module = $crate::utils::logging::get_module_name(file!());
        let message = format!($($arg)*);
        tokio::spawn(async move {
            let _ = $crate::utils::logging::log_internal(
                $crate::utils::logging::LogLevel::Error,
                &message,
                module
            ).await;
        });
    }}
}

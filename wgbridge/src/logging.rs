//! Device logging.
//!
//! The device and the controller log through the small [`DeviceLog`]
//! capability rather than a concrete logger, so the plain-text and JSON
//! loggers are interchangeable. Both forward to `tracing`; the sink format is
//! chosen by [`init`] when the worker installs its subscriber.

use std::fmt;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;

use crate::config::{IdentityFields, LogLevel, LoggerSettings};

/// Logging capability handed to the device and shared by every connection
/// handler.
pub trait DeviceLog: Send + Sync {
    fn verbose(&self, args: fmt::Arguments<'_>);
    fn error(&self, args: fmt::Arguments<'_>);
}

pub type SharedLogger = Arc<dyn DeviceLog>;

impl<T: DeviceLog + ?Sized> DeviceLog for Arc<T> {
    fn verbose(&self, args: fmt::Arguments<'_>) {
        (**self).verbose(args)
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        (**self).error(args)
    }
}

/// Log a verbose message through a [`DeviceLog`]
#[macro_export]
macro_rules! log_verbose {
    ($logger:expr, $($arg:tt)+) => {
        $crate::logging::DeviceLog::verbose(&*$logger, format_args!($($arg)+))
    };
}

/// Log an error message through a [`DeviceLog`]
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $crate::logging::DeviceLog::error(&*$logger, format_args!($($arg)+))
    };
}

/// Which severities a logger lets through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gate {
    verbose: bool,
    error: bool,
}

impl From<LogLevel> for Gate {
    fn from(level: LogLevel) -> Self {
        Self {
            verbose: level >= LogLevel::Verbose,
            error: level >= LogLevel::Error,
        }
    }
}

/// Plain-text logger: every message carries an `[iface] name pid tid` prefix
pub struct PlainLogger {
    prefix: String,
    gate: Gate,
}

impl PlainLogger {
    pub fn new(level: LogLevel, identity: &IdentityFields, interface: &str) -> Self {
        Self {
            prefix: format!(
                "[{}] {} {} {} ",
                interface, identity.name, identity.pid, identity.thread_id
            ),
            gate: level.into(),
        }
    }
}

impl DeviceLog for PlainLogger {
    fn verbose(&self, args: fmt::Arguments<'_>) {
        if self.gate.verbose {
            tracing::debug!("{}{}", self.prefix, args);
        }
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        if self.gate.error {
            tracing::error!("{}{}", self.prefix, args);
        }
    }
}

/// Structured logger: identity is emitted as separate fields
pub struct JsonLogger {
    identity: IdentityFields,
    interface: String,
    gate: Gate,
}

impl JsonLogger {
    pub fn new(level: LogLevel, identity: &IdentityFields, interface: &str) -> Self {
        Self {
            identity: identity.clone(),
            interface: interface.to_string(),
            gate: level.into(),
        }
    }
}

impl DeviceLog for JsonLogger {
    fn verbose(&self, args: fmt::Arguments<'_>) {
        if self.gate.verbose {
            tracing::debug!(
                func = %self.identity.name,
                pid = self.identity.pid,
                main_thread = self.identity.thread_id,
                interface = %self.interface,
                "{}",
                args
            );
        }
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        if self.gate.error {
            tracing::error!(
                func = %self.identity.name,
                pid = self.identity.pid,
                main_thread = self.identity.thread_id,
                interface = %self.interface,
                "{}",
                args
            );
        }
    }
}

/// Build the device logger described by `settings`
pub fn device_logger(settings: &LoggerSettings, interface: &str) -> SharedLogger {
    if settings.structured {
        Arc::new(JsonLogger::new(settings.level, &settings.identity, interface))
    } else {
        Arc::new(PlainLogger::new(settings.level, &settings.identity, interface))
    }
}

/// Install the worker's global subscriber.
///
/// Output goes to stdout, which the launcher points at the per-interface
/// log file.
pub fn init(settings: &LoggerSettings) {
    let max_level = match settings.level {
        LogLevel::Silent => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Verbose => LevelFilter::DEBUG,
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .with_writer(std::io::stdout);

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = if settings.structured {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

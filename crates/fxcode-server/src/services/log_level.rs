//! Server log level, readable and adjustable by connected clients.

use fxcode_core::{Emitter, FxError, FxResult, Listener};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;
use tracing_subscriber::{reload, EnvFilter};

/// Workbench log levels in their numeric wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
    Off = 6,
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> u8 {
        level as u8
    }
}

/// Unknown levels fall back to `Info`.
impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            5 => LogLevel::Critical,
            6 => LogLevel::Off,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    /// `tracing` filter directive for this level. `tracing` has no level
    /// above error, so `Critical` filters like `Error`.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::Off => "off",
        }
    }

    /// Parse a command-line level name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "critical" => Some(LogLevel::Critical),
            "off" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

type Apply = Box<dyn Fn(LogLevel) -> FxResult<()> + Send + Sync>;

pub struct LogLevelService {
    level: AtomicU8,
    changes: Emitter<Value>,
    apply: Option<Apply>,
}

impl Default for LogLevelService {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LogLevelService {
    /// Service that only records the level; no subscriber is reconfigured.
    pub fn new(level: LogLevel) -> Self {
        Self {
            level: AtomicU8::new(level.into()),
            changes: Emitter::new(),
            apply: None,
        }
    }

    /// Service that swaps the filter behind `handle` on every change.
    pub fn reloading<S>(level: LogLevel, handle: reload::Handle<EnvFilter, S>) -> Self
    where
        S: Send + Sync + 'static,
    {
        let apply: Apply = Box::new(move |level: LogLevel| {
            handle
                .reload(EnvFilter::new(level.directive()))
                .map_err(|e| FxError::Other(format!("log filter reload failed: {e}")))
        });
        Self {
            apply: Some(apply),
            ..Self::new(level)
        }
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from(self.level.load(Ordering::Relaxed))
    }

    /// Change the level; listeners hear about it only when it differs.
    pub fn set_level(&self, level: LogLevel) -> FxResult<()> {
        if let Some(apply) = &self.apply {
            apply(level)?;
        }
        let previous = LogLevel::from(self.level.swap(level.into(), Ordering::Relaxed));
        if previous != level {
            info!(?level, "log level changed");
            self.changes.fire(json!(level));
        }
        Ok(())
    }

    /// Stream of new levels, in wire form.
    pub fn subscribe(&self) -> Listener<Value> {
        self.changes.subscribe()
    }
}

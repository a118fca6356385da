//! Telemetry sink. Events are written to the log; nothing leaves the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
#[repr(u8)]
pub enum TelemetryLevel {
    None = 0,
    Crash = 1,
    Error = 2,
    Usage = 3,
}

impl From<TelemetryLevel> for u8 {
    fn from(level: TelemetryLevel) -> u8 {
        level as u8
    }
}

/// Unknown levels disable telemetry.
impl From<u8> for TelemetryLevel {
    fn from(v: u8) -> Self {
        match v {
            1 => TelemetryLevel::Crash,
            2 => TelemetryLevel::Error,
            3 => TelemetryLevel::Usage,
            _ => TelemetryLevel::None,
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn public_log(&self, event_name: &str, data: &Value);
    fn set_level(&self, level: TelemetryLevel);
    fn level(&self) -> TelemetryLevel;
}

/// Emits usage events as `tracing` records under the `telemetry` target.
#[derive(Debug)]
pub struct TracingTelemetry {
    level: AtomicU8,
}

impl Default for TracingTelemetry {
    fn default() -> Self {
        Self::new(TelemetryLevel::Usage)
    }
}

impl TracingTelemetry {
    pub fn new(level: TelemetryLevel) -> Self {
        Self {
            level: AtomicU8::new(level.into()),
        }
    }
}

impl TelemetrySink for TracingTelemetry {
    fn public_log(&self, event_name: &str, data: &Value) {
        if self.level() < TelemetryLevel::Usage {
            return;
        }
        info!(target: "telemetry", event = event_name, data = %data, "telemetry event");
    }

    fn set_level(&self, level: TelemetryLevel) {
        info!(?level, "telemetry level changed");
        self.level.store(level.into(), Ordering::Relaxed);
    }

    fn level(&self) -> TelemetryLevel {
        TelemetryLevel::from(self.level.load(Ordering::Relaxed))
    }
}

//! fxcode-server: remote session server for the fxcode workbench.
//!
//! Accepts upgraded sockets, keeps reconnectable management and
//! extension-host sessions keyed by reconnection token, and serves the
//! file, terminal, extension-environment, telemetry and logger channels.

pub mod channel;
pub mod config;
pub mod server;
pub mod services;
pub mod session;
pub mod transport;

pub use config::{CliOverrides, ServerConfig};
pub use server::{ClientConnected, SessionServer};
pub use services::{LogLevel, LogLevelService};

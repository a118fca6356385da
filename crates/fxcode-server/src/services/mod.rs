//! Collaborators the channels delegate to.

pub mod disk;
pub mod environment;
pub mod log_level;
pub mod pty;
pub mod pty_host;
pub mod scanner;
pub mod telemetry;

pub use disk::{DiskFileSystemProvider, FileSystemProvider};
pub use environment::Environment;
pub use log_level::{LogLevel, LogLevelService};
pub use pty_host::{LocalPtyHost, PtyHost};
pub use scanner::{ExtensionScanner, ManifestScanner};
pub use telemetry::{TelemetrySink, TracingTelemetry};

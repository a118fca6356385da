//! fxcode-console: UI-local state behind the console, game view and
//! resource monitor panels.
//!
//! Nothing here talks to the session server; presentation code owns these
//! values directly.

pub mod cursor;
pub mod data;
pub mod format;
pub mod history;
pub mod input;
pub mod log;
pub mod output;
pub mod signal;

pub use cursor::CommandHistoryCursor;
pub use data::{GameDataService, GameState, ResourceSample, StructuredMessage};
pub use history::BoundedHistoryBuffer;
pub use input::{ConsoleInput, Key};
pub use log::ConsoleLog;
pub use output::OutputBuffer;
pub use signal::{Signal, SubscriptionId};

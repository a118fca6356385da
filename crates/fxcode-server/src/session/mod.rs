//! Session lifecycle: reconnectable connection sessions, the token-keyed
//! connection table and the runtimes a session drives.

pub mod connection;
pub mod exthost;
pub mod management;
pub mod table;

pub use connection::{ConnectionSession, Rejected};
pub use exthost::ExtensionHostRuntime;
pub use management::ManagementRuntime;
pub use table::{Admitted, ConnectionTable};

use async_trait::async_trait;
use fxcode_core::Payload;

/// What sits behind a session's sequenced payload stream.
///
/// A runtime outlives individual sockets: while the session is offline,
/// outgoing payloads are still collected and replayed after reconnection.
#[async_trait]
pub trait SessionRuntime: Send {
    /// Handle one payload received from the client.
    async fn deliver(&mut self, payload: Payload);

    /// Next payload for the client; `None` once the runtime has ended.
    /// Must be cancel-safe.
    async fn next_outgoing(&mut self) -> Option<Payload>;

    /// Release everything the runtime owns.
    async fn shutdown(&mut self);
}

//! Named RPC + event surfaces multiplexed over a management session.
//!
//! Every channel implements [`ServerChannel`]: `call` answers one request,
//! `listen` returns a stream of event payloads that lives until the client
//! disposes the subscription. Channels are registered by name in a
//! [`ChannelRegistry`] built once at startup.

pub mod extensions;
pub mod file;
pub mod logger;
pub mod server;
pub mod telemetry;
pub mod terminal;
pub mod variables;

use async_trait::async_trait;
use fxcode_core::{FxError, FxResult, ResourceTransformer};
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub use server::ChannelServer;

pub const FILE_CHANNEL: &str = "remotefilesystem";
pub const TERMINAL_CHANNEL: &str = "remoteterminal";
pub const EXTENSIONS_CHANNEL: &str = "remoteextensionsenvironment";
pub const TELEMETRY_CHANNEL: &str = "telemetry";
pub const LOGGER_CHANNEL: &str = "logger";

pub type EventStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

/// Per-connection state handed to every call and listen.
#[derive(Clone)]
pub struct ChannelContext {
    pub remote_authority: String,
    pub transformer: Arc<ResourceTransformer>,
    /// Reconnection token of the management session.
    pub token: String,
}

#[async_trait]
pub trait ServerChannel: Send + Sync {
    async fn call(&self, ctx: &ChannelContext, command: &str, args: Value) -> FxResult<Value>;

    fn listen(&self, ctx: &ChannelContext, event: &str, args: Value) -> FxResult<EventStream>;
}

/// Channels by name.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ServerChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        self.channels.insert(name.into(), channel);
    }

    pub fn get(&self, name: &str) -> FxResult<Arc<dyn ServerChannel>> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| FxError::UnknownChannel(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}

/// Argument `index` of a positional call, or field `name` of a named one.
pub(crate) fn arg<'a>(args: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    match args {
        Value::Array(items) => items.get(index),
        Value::Object(map) => map.get(name),
        _ if index == 0 => Some(args),
        _ => None,
    }
}

/// Typed argument; missing arguments deserialize from `null`.
pub(crate) fn arg_as<T: DeserializeOwned>(args: &Value, index: usize, name: &str) -> FxResult<T> {
    let value = arg(args, index, name).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| FxError::InvalidMessage(format!("argument '{name}': {e}")))
}

/// Typed argument that falls back to its default when absent or `null`.
pub(crate) fn arg_or_default<T: DeserializeOwned + Default>(
    args: &Value,
    index: usize,
    name: &str,
) -> FxResult<T> {
    match arg(args, index, name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(_) => arg_as(args, index, name),
    }
}

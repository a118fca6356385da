//! `logger` channel: the workbench reads and changes the server log level.

use crate::channel::{arg_as, ChannelContext, EventStream, ServerChannel};
use crate::services::log_level::{LogLevel, LogLevelService};
use async_trait::async_trait;
use fxcode_core::{FxError, FxResult};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct LoggerChannel {
    service: Arc<LogLevelService>,
}

impl LoggerChannel {
    pub fn new(service: Arc<LogLevelService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ServerChannel for LoggerChannel {
    async fn call(&self, _: &ChannelContext, command: &str, args: Value) -> FxResult<Value> {
        match command {
            "setLevel" => {
                let level: LogLevel = arg_as(&args, 0, "level")?;
                self.service.set_level(level)?;
                Ok(Value::Null)
            }
            "getLevel" => Ok(json!(self.service.level())),
            other => Err(FxError::InvalidCall(other.to_string())),
        }
    }

    fn listen(&self, _: &ChannelContext, event: &str, _: Value) -> FxResult<EventStream> {
        match event {
            "onDidChangeLogLevel" => Ok(Box::pin(self.service.subscribe())),
            other => Err(FxError::InvalidListen(other.to_string())),
        }
    }
}

//! `telemetry` channel used by the workbench's own telemetry client.

use crate::channel::{arg_as, arg_or_default, ChannelContext, EventStream, ServerChannel};
use crate::services::telemetry::{TelemetryLevel, TelemetrySink};
use async_trait::async_trait;
use fxcode_core::{FxError, FxResult};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct TelemetryChannel {
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryChannel {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ServerChannel for TelemetryChannel {
    async fn call(&self, _: &ChannelContext, command: &str, args: Value) -> FxResult<Value> {
        match command {
            "publicLog" | "publicLog2" => {
                let event: String = arg_as(&args, 0, "eventName")?;
                let data: Value = arg_or_default(&args, 1, "data")?;
                self.sink.public_log(&event, &data);
                Ok(Value::Null)
            }
            "setTelemetryLevel" => {
                let level: TelemetryLevel = arg_as(&args, 0, "level")?;
                self.sink.set_level(level);
                Ok(Value::Null)
            }
            "getTelemetryLevel" => Ok(json!(self.sink.level())),
            other => Err(FxError::InvalidCall(other.to_string())),
        }
    }

    fn listen(&self, _: &ChannelContext, event: &str, _: Value) -> FxResult<EventStream> {
        Err(FxError::InvalidListen(event.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::TracingTelemetry;
    use fxcode_core::{ResourceRoots, ResourceTransformer};

    fn ctx() -> ChannelContext {
        ChannelContext {
            remote_authority: "a".into(),
            transformer: Arc::new(ResourceTransformer::new("a", ResourceRoots::default())),
            token: "t".into(),
        }
    }

    #[tokio::test]
    async fn level_is_settable_over_the_channel() {
        let channel = TelemetryChannel::new(Arc::new(TracingTelemetry::default()));
        assert_eq!(channel.call(&ctx(), "getTelemetryLevel", Value::Null).await.unwrap(), 3);
        channel.call(&ctx(), "setTelemetryLevel", json!([1])).await.unwrap();
        assert_eq!(channel.call(&ctx(), "getTelemetryLevel", Value::Null).await.unwrap(), 1);
        channel
            .call(&ctx(), "publicLog", json!(["fxcode.start", { "ms": 12 }]))
            .await
            .unwrap();
        assert!(channel.call(&ctx(), "publicLog", json!([])).await.is_err());
    }
}

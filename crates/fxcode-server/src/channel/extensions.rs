//! `remoteextensionsenvironment` channel: server environment description,
//! extension discovery and extension-host telemetry.

use crate::channel::{arg, arg_as, arg_or_default, ChannelContext, EventStream, ServerChannel};
use crate::services::scanner::{ExtensionDescription, ExtensionScanner, ScanInput};
use crate::services::telemetry::{TelemetryLevel, TelemetrySink};
use crate::services::Environment;
use async_trait::async_trait;
use fxcode_core::{FxError, FxResult, UriComponents};
use futures_util::future::{join, join_all};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanSingleArgs {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    is_builtin: bool,
    extension_location: UriComponents,
}

pub struct ExtensionEnvironmentChannel {
    environment: Arc<Environment>,
    scanner: Arc<dyn ExtensionScanner>,
    telemetry: Arc<dyn TelemetrySink>,
    default_language: String,
}

impl ExtensionEnvironmentChannel {
    pub fn new(
        environment: Arc<Environment>,
        scanner: Arc<dyn ExtensionScanner>,
        telemetry: Arc<dyn TelemetrySink>,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            environment,
            scanner,
            telemetry,
            default_language: default_language.into(),
        }
    }

    /// Scan every builtin and installed search path concurrently and merge
    /// the results. The first extension seen for an identity wins; builtin
    /// paths are seen before installed ones.
    pub async fn scan_extensions(&self, language: &str) -> Vec<ExtensionDescription> {
        let inputs = |paths: Vec<PathBuf>, is_builtin: bool| -> Vec<ScanInput> {
            paths
                .into_iter()
                .map(|path| ScanInput {
                    language: language.to_string(),
                    path,
                    is_builtin,
                    is_under_development: !is_builtin,
                })
                .collect()
        };
        let builtin = inputs(self.environment.builtin_extension_dirs(), true);
        let installed = inputs(self.environment.installed_extension_dirs(), false);

        let (builtin, installed) = join(self.scan_paths(&builtin), self.scan_paths(&installed)).await;

        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut merged = Vec::new();
        for extension in builtin.into_iter().chain(installed).flatten() {
            let key = extension.identifier.key().to_string();
            if let Some(kept) = seen.get(&key) {
                warn!(
                    kept = %kept.display(),
                    ignored = %extension.location().display(),
                    "duplicate extension {}, keeping the first one found",
                    extension.identifier.value
                );
                continue;
            }
            seen.insert(key, extension.location());
            merged.push(extension);
        }
        debug!(count = merged.len(), "extensions scanned");
        merged
    }

    async fn scan_paths(&self, inputs: &[ScanInput]) -> Vec<Vec<ExtensionDescription>> {
        join_all(inputs.iter().map(|input| async move {
            match self.scanner.scan_extensions(input).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(path = %input.path.display(), error = %e, "extension scan failed");
                    Vec::new()
                }
            }
        }))
        .await
    }

    async fn scan_single_extension(
        &self,
        ctx: &ChannelContext,
        mut args: Value,
    ) -> FxResult<Option<ExtensionDescription>> {
        ctx.transformer.transform_incoming_json(&mut args);
        let args: ScanSingleArgs = serde_json::from_value(args)?;
        let input = ScanInput {
            language: args.language.unwrap_or_else(|| self.default_language.clone()),
            path: ctx.transformer.to_local(&args.extension_location).fs_path(),
            is_builtin: args.is_builtin,
            is_under_development: true,
        };
        self.scanner.scan_single_extension(&input).await
    }
}

/// Calls on this channel pass one argument object, sometimes wrapped in
/// an array.
fn unwrap_single(args: Value) -> Value {
    match args {
        Value::Array(mut items) if items.len() == 1 => items.swap_remove(0),
        other => other,
    }
}

fn outgoing(ctx: &ChannelContext, value: impl serde::Serialize) -> FxResult<Value> {
    let mut value = serde_json::to_value(value)?;
    ctx.transformer.transform_outgoing_json(&mut value);
    Ok(value)
}

#[async_trait]
impl ServerChannel for ExtensionEnvironmentChannel {
    async fn call(&self, ctx: &ChannelContext, command: &str, args: Value) -> FxResult<Value> {
        let args = unwrap_single(args);
        match command {
            "getEnvironmentData" => outgoing(ctx, self.environment.environment_data(&ctx.token)),
            "scanExtensions" => {
                let language = match arg(&args, 0, "language") {
                    Some(Value::String(l)) if !l.is_empty() => l.clone(),
                    _ => self.default_language.clone(),
                };
                outgoing(ctx, self.scan_extensions(&language).await)
            }
            "scanSingleExtension" => {
                let found = self.scan_single_extension(ctx, args).await?;
                outgoing(ctx, found)
            }
            "getDiagnosticInfo" => Err(FxError::NotImplemented("getDiagnosticInfo".into())),
            "disableTelemetry" => {
                self.telemetry.set_level(TelemetryLevel::None);
                Ok(Value::Null)
            }
            "logTelemetry" => {
                let event: String = arg_as(&args, 0, "eventName")?;
                let data: Value = arg_or_default(&args, 1, "data")?;
                self.telemetry.public_log(&event, &data);
                Ok(Value::Null)
            }
            // Events are never buffered.
            "flushTelemetry" => Ok(Value::Null),
            other => Err(FxError::InvalidCall(other.to_string())),
        }
    }

    fn listen(&self, _: &ChannelContext, event: &str, _: Value) -> FxResult<EventStream> {
        Err(FxError::InvalidListen(event.to_string()))
    }
}

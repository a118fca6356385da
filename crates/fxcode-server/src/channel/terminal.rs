//! `remoteterminal` channel.
//!
//! `$createProcess` resolves the launch configuration (cwd, environment,
//! extension environment collections) before registering the process with
//! the [`PtyHost`]. Other `$`-prefixed commands map onto pty-host methods
//! through [`PtyCommand`]. The channel also carries client-side command
//! execution: [`TerminalChannel::execute_command`] fires `$onExecuteCommand`
//! and waits for the matching `$sendCommandResult`.

use crate::channel::variables::VariableResolver;
use crate::channel::{arg_as, arg_or_default, ChannelContext, EventStream, ServerChannel};
use crate::services::pty_host::{CreateProcessRequest, PtyEvent, PtyHost, ShellLaunchConfig};
use async_trait::async_trait;
use fxcode_core::{Emitter, FxError, FxResult, ResourceTransformer, UriComponents};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Workspace folder as sent with a create request.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceFolderData {
    pub uri: UriComponents,
    pub name: String,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum MutatorType {
    Replace = 1,
    Append = 2,
    Prepend = 3,
}

impl TryFrom<u8> for MutatorType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Replace),
            2 => Ok(Self::Append),
            3 => Ok(Self::Prepend),
            other => Err(format!("unknown environment mutator type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnvMutator {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: MutatorType,
}

/// One extension's contribution: `[extensionId, [[variable, mutator], ...]]`.
pub type EnvCollection = (String, Vec<(String, EnvMutator)>);

/// Arguments of `$createProcess`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTerminalArgs {
    pub configuration: Map<String, Value>,
    pub resolved_variables: Map<String, Value>,
    pub env_variable_collections: Vec<EnvCollection>,
    pub shell_launch_config: ShellLaunchConfig,
    pub workspace_id: String,
    pub workspace_name: String,
    pub workspace_folders: Vec<WorkspaceFolderData>,
    pub active_workspace_folder: Option<WorkspaceFolderData>,
    pub active_file_resource: Option<UriComponents>,
    pub should_persist_terminal: bool,
    pub cols: u16,
    pub rows: u16,
    pub unicode_version: String,
    pub resolver_env: Option<HashMap<String, String>>,
}

/// Pty-host methods reachable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyCommand {
    Start,
    Input,
    ProcessBinary,
    Resize,
    Shutdown,
    AcknowledgeDataEvent,
    GetInitialCwd,
    GetCwd,
    ListProcesses,
    GetDefaultSystemShell,
    GetEnvironment,
}

impl PtyCommand {
    const TABLE: [(&'static str, PtyCommand); 11] = [
        ("$start", PtyCommand::Start),
        ("$input", PtyCommand::Input),
        ("$processBinary", PtyCommand::ProcessBinary),
        ("$resize", PtyCommand::Resize),
        ("$shutdown", PtyCommand::Shutdown),
        ("$acknowledgeDataEvent", PtyCommand::AcknowledgeDataEvent),
        ("$getInitialCwd", PtyCommand::GetInitialCwd),
        ("$getCwd", PtyCommand::GetCwd),
        ("$listProcesses", PtyCommand::ListProcesses),
        ("$getDefaultSystemShell", PtyCommand::GetDefaultSystemShell),
        ("$getEnvironment", PtyCommand::GetEnvironment),
    ];

    pub fn from_name(command: &str) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, c)| *c)
    }
}

/// `$onProcessDataEvent` and `$onProcessData` name the same stream.
fn pty_event(name: &str) -> Option<PtyEvent> {
    match name.strip_suffix("Event").unwrap_or(name) {
        "$onProcessData" => Some(PtyEvent::ProcessData),
        "$onProcessReady" => Some(PtyEvent::ProcessReady),
        "$onProcessExit" => Some(PtyEvent::ProcessExit),
        _ => None,
    }
}

/// Server-side values the launch environment is built from.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    /// Exported as `TERM_PROGRAM_VERSION`.
    pub version: String,
    /// UI language, used for `LANG`.
    pub locale: String,
    pub home: Option<PathBuf>,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            locale: "en".to_string(),
            home: dirs::home_dir(),
        }
    }
}

struct PendingCommand {
    reply: oneshot::Sender<Result<Value, Value>>,
    transformer: Arc<ResourceTransformer>,
}

type PendingCommands = Arc<Mutex<HashMap<u64, PendingCommand>>>;

/// Evicts an abandoned request from the pending table.
struct PendingGuard {
    pending: PendingCommands,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

pub struct TerminalChannel {
    pty: Arc<dyn PtyHost>,
    settings: TerminalSettings,
    last_request_id: AtomicU64,
    pending: PendingCommands,
    on_execute_command: Emitter<Value>,
}

impl TerminalChannel {
    pub fn new(pty: Arc<dyn PtyHost>, settings: TerminalSettings) -> Self {
        Self {
            pty,
            settings,
            last_request_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            on_execute_command: Emitter::new(),
        }
    }

    /// Run `command_id` on the client and wait for its result. URIs in
    /// `args` are sent in the client's address space and URIs in the result
    /// come back in ours.
    pub async fn execute_command(
        &self,
        transformer: Arc<ResourceTransformer>,
        command_id: &str,
        mut args: Value,
    ) -> FxResult<Value> {
        let req_id = self.last_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply, rx) = oneshot::channel();
        transformer.transform_outgoing_json(&mut args);
        self.pending
            .lock()
            .map_err(|_| FxError::Other("pending commands poisoned".into()))?
            .insert(req_id, PendingCommand { reply, transformer });
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: req_id,
        };

        debug!(req_id, command_id, "executing client command");
        self.on_execute_command.fire(json!({
            "reqId": req_id,
            "commandId": command_id,
            "commandArgs": args,
        }));

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                Err(FxError::Channel(message))
            }
            Err(_) => Err(FxError::Channel(format!("command '{command_id}' abandoned"))),
        }
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn send_command_result(&self, req_id: u64, is_error: bool, mut payload: Value) {
        let Some(pending) = self.pending.lock().ok().and_then(|mut p| p.remove(&req_id)) else {
            debug!(req_id, "result for unknown command request");
            return;
        };
        pending.transformer.transform_incoming_json(&mut payload);
        let result = if is_error { Err(payload) } else { Ok(payload) };
        let _ = pending.reply.send(result);
    }

    async fn create_process(&self, ctx: &ChannelContext, args: Value) -> FxResult<Value> {
        let args = match args {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        let args: CreateTerminalArgs = serde_json::from_value(args)?;
        let t = &ctx.transformer;
        let resolver = VariableResolver::new(
            t,
            &args,
            std::env::vars().collect(),
            self.settings.home.clone(),
        );

        let mut launch = args.shell_launch_config.clone();
        let root = args
            .active_workspace_folder
            .as_ref()
            .map(|f| t.resolve(&f.uri).fs_path());
        let configured_cwd = args
            .configuration
            .get("terminal.integrated.cwd")
            .and_then(Value::as_str);
        let cwd = terminal_cwd(
            t,
            &launch,
            configured_cwd,
            root.as_deref(),
            self.settings.home.as_deref(),
            &resolver,
        );
        launch.cwd = Some(Value::String(cwd.clone()));

        let base = if launch.strict_env {
            HashMap::new()
        } else {
            self.pty.get_environment().await?
        };
        let detect_locale = args
            .configuration
            .get("terminal.integrated.detectLocale")
            .and_then(Value::as_str)
            .unwrap_or("auto");
        let mut env = terminal_environment(
            &mut launch,
            platform_env(&args.configuration),
            &resolver,
            &self.settings,
            detect_locale,
            base,
        );
        if !launch.strict_env {
            apply_env_collections(&mut env, &args.env_variable_collections);
        }

        let id = self
            .pty
            .create_process(CreateProcessRequest {
                shell_launch_config: launch.clone(),
                cwd,
                cols: args.cols,
                rows: args.rows,
                unicode_version: args.unicode_version,
                env,
                should_persist: args.should_persist_terminal,
                workspace_id: args.workspace_id,
                workspace_name: args.workspace_name,
            })
            .await?;
        debug!(id, "terminal process created");
        Ok(json!({
            "persistentTerminalId": id,
            "resolvedShellLaunchConfig": launch,
        }))
    }

    async fn forward(&self, command: PtyCommand, args: &Value) -> FxResult<Value> {
        let pty = &self.pty;
        let id = || arg_as::<u32>(args, 0, "id");
        let value = match command {
            PtyCommand::Start => pty.start(id()?).await?,
            PtyCommand::Input => {
                pty.input(id()?, arg_as(args, 1, "data")?).await?;
                Value::Null
            }
            PtyCommand::ProcessBinary => {
                pty.process_binary(id()?, arg_as(args, 1, "data")?).await?;
                Value::Null
            }
            PtyCommand::Resize => {
                let cols = arg_as(args, 1, "cols")?;
                let rows = arg_as(args, 2, "rows")?;
                pty.resize(id()?, cols, rows).await?;
                Value::Null
            }
            PtyCommand::Shutdown => {
                pty.shutdown(id()?, arg_or_default(args, 1, "immediate")?).await?;
                Value::Null
            }
            PtyCommand::AcknowledgeDataEvent => {
                pty.acknowledge_data_event(id()?, arg_as(args, 1, "charCount")?)
                    .await?;
                Value::Null
            }
            PtyCommand::GetInitialCwd => json!(pty.get_initial_cwd(id()?).await?),
            PtyCommand::GetCwd => json!(pty.get_cwd(id()?).await?),
            PtyCommand::ListProcesses => pty.list_processes().await?,
            PtyCommand::GetDefaultSystemShell => json!(pty.get_default_system_shell().await?),
            PtyCommand::GetEnvironment => serde_json::to_value(pty.get_environment().await?)?,
        };
        Ok(value)
    }
}

#[async_trait]
impl ServerChannel for TerminalChannel {
    async fn call(&self, ctx: &ChannelContext, command: &str, args: Value) -> FxResult<Value> {
        trace!(command, "terminal call");
        match command {
            "$createProcess" => self.create_process(ctx, args).await,
            "$sendCommandResult" => {
                let req_id = arg_as(&args, 0, "reqId")?;
                let is_error = arg_or_default(&args, 1, "isError")?;
                let payload = arg_as(&args, 2, "payload")?;
                self.send_command_result(req_id, is_error, payload);
                Ok(Value::Null)
            }
            other => match PtyCommand::from_name(other) {
                Some(command) => self.forward(command, &args).await,
                None => {
                    warn!(command = other, "unknown terminal command");
                    Ok(Value::Null)
                }
            },
        }
    }

    fn listen(&self, _: &ChannelContext, event: &str, _: Value) -> FxResult<EventStream> {
        if event == "$onExecuteCommand" {
            return Ok(Box::pin(self.on_execute_command.subscribe()));
        }
        match pty_event(event) {
            Some(kind) => Ok(Box::pin(self.pty.subscribe(kind))),
            None => Err(FxError::InvalidListen(event.to_string())),
        }
    }
}

/// Launch cwd, then the configured cwd (relative to `root`), then `root`,
/// then `home`.
fn terminal_cwd(
    t: &ResourceTransformer,
    launch: &ShellLaunchConfig,
    configured: Option<&str>,
    root: Option<&Path>,
    home: Option<&Path>,
    resolver: &VariableResolver,
) -> String {
    let requested = match &launch.cwd {
        Some(Value::String(s)) => Some(s.clone()),
        Some(uri @ Value::Object(_)) => UriComponents::from_value(uri)
            .ok()
            .map(|u| t.resolve(&u).fs_path().to_string_lossy().into_owned()),
        _ => None,
    };
    if let Some(requested) = requested.filter(|s| !s.is_empty()) {
        let resolved = resolver.resolve(&requested);
        return if resolved.is_empty() { requested } else { resolved };
    }

    let configured = configured
        .map(|c| resolver.resolve(c))
        .filter(|c| !c.is_empty())
        .and_then(|c| {
            let path = PathBuf::from(c);
            if path.is_absolute() {
                Some(path)
            } else {
                root.map(|r| r.join(path))
            }
        });
    configured
        .or_else(|| root.map(Path::to_path_buf))
        .or_else(|| home.map(Path::to_path_buf))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn platform_env(configuration: &Map<String, Value>) -> Map<String, Value> {
    let key = if cfg!(windows) {
        "terminal.integrated.env.windows"
    } else if cfg!(target_os = "macos") {
        "terminal.integrated.env.osx"
    } else {
        "terminal.integrated.env.linux"
    };
    match configuration.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Layer `overrides` onto `env`; `null` removes a variable.
fn merge_env(env: &mut HashMap<String, String>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        match value {
            Value::Null => {
                env.remove(key);
            }
            Value::String(s) => {
                env.insert(key.clone(), s.clone());
            }
            other => {
                env.insert(key.clone(), other.to_string());
            }
        }
    }
}

/// Build the process environment. With `strictEnv` only the launch
/// configuration's variables are used. Variables in the configured and
/// launch environments are resolved; the launch configuration keeps the
/// resolved values.
fn terminal_environment(
    launch: &mut ShellLaunchConfig,
    mut from_config: Map<String, Value>,
    resolver: &VariableResolver,
    settings: &TerminalSettings,
    detect_locale: &str,
    base: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if launch.strict_env {
        if let Some(launch_env) = &launch.env {
            for (key, value) in launch_env {
                if let Value::String(s) = value {
                    env.insert(key.clone(), s.clone());
                }
            }
        }
        return env;
    }

    env.extend(base);
    resolver.resolve_map(&mut from_config);
    if let Some(launch_env) = launch.env.as_mut() {
        resolver.resolve_map(launch_env);
    }
    merge_env(&mut env, &from_config);
    if let Some(launch_env) = &launch.env {
        merge_env(&mut env, launch_env);
    }

    env.insert("TERM_PROGRAM".into(), "vscode".into());
    if !settings.version.is_empty() {
        env.insert("TERM_PROGRAM_VERSION".into(), settings.version.clone());
    }
    if should_set_lang(&env, detect_locale) {
        env.insert("LANG".into(), lang_for_locale(&settings.locale));
    }
    env.insert("COLORTERM".into(), "truecolor".into());
    env
}

fn should_set_lang(env: &HashMap<String, String>, detect_locale: &str) -> bool {
    match detect_locale {
        "on" => true,
        "auto" => match env.get("LANG") {
            None => true,
            Some(lang) => {
                lang.is_empty()
                    || !(lang.ends_with(".UTF-8") || lang.ends_with(".utf8") || lang.contains(".euc"))
            }
        },
        _ => false,
    }
}

/// `en` -> `en_US.UTF-8`, `pt-br` -> `pt_BR.UTF-8`.
fn lang_for_locale(locale: &str) -> String {
    const COUNTRIES: [(&str, &str); 16] = [
        ("cs", "CZ"),
        ("de", "DE"),
        ("en", "US"),
        ("es", "ES"),
        ("fi", "FI"),
        ("fr", "FR"),
        ("hu", "HU"),
        ("it", "IT"),
        ("ja", "JP"),
        ("ko", "KR"),
        ("pl", "PL"),
        ("pt", "BR"),
        ("ru", "RU"),
        ("sv", "SE"),
        ("tr", "TR"),
        ("zh", "CN"),
    ];
    let mut parts: Vec<String> = locale
        .split('-')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    match parts.len() {
        0 => return "en_US.UTF-8".to_string(),
        1 => {
            if let Some((_, country)) = COUNTRIES.iter().find(|(lang, _)| *lang == parts[0]) {
                parts.push(country.to_string());
            }
        }
        _ => parts[1] = parts[1].to_uppercase(),
    }
    format!("{}.UTF-8", parts[..parts.len().min(2)].join("_"))
}

/// Apply extension collections. Later extensions' mutators run first; a
/// replace stops any earlier-declared extension from touching the variable.
fn apply_env_collections(env: &mut HashMap<String, String>, collections: &[EnvCollection]) {
    let mut merged: Vec<(String, Vec<&EnvMutator>)> = Vec::new();
    for (extension, mutators) in collections {
        for (variable, mutator) in mutators {
            let index = match merged.iter().position(|(v, _)| v == variable) {
                Some(i) => i,
                None => {
                    merged.push((variable.clone(), Vec::new()));
                    merged.len() - 1
                }
            };
            let entry = &mut merged[index].1;
            if entry.first().is_some_and(|m| m.kind == MutatorType::Replace) {
                debug!(extension = %extension, variable = %variable, "mutator shadowed by replace");
                continue;
            }
            entry.insert(0, mutator);
        }
    }

    for (variable, mutators) in merged {
        for mutator in mutators {
            let current = env.get(&variable).cloned().unwrap_or_default();
            let next = match mutator.kind {
                MutatorType::Replace => mutator.value.clone(),
                MutatorType::Append => current + &mutator.value,
                MutatorType::Prepend => mutator.value.clone() + &current,
            };
            env.insert(variable.clone(), next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxcode_core::{Listener, ResourceRoots};
    use futures_util::StreamExt;

    #[derive(Default)]
    struct FakePty {
        created: Mutex<Vec<CreateProcessRequest>>,
        calls: Mutex<Vec<String>>,
        data: Emitter<Value>,
    }

    impl FakePty {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PtyHost for FakePty {
        async fn create_process(&self, request: CreateProcessRequest) -> FxResult<u32> {
            self.created.lock().unwrap().push(request);
            Ok(7)
        }
        async fn start(&self, id: u32) -> FxResult<Value> {
            self.log(format!("start {id}"));
            Ok(Value::Null)
        }
        async fn input(&self, id: u32, data: String) -> FxResult<()> {
            self.log(format!("input {id} {data}"));
            Ok(())
        }
        async fn process_binary(&self, _: u32, _: String) -> FxResult<()> {
            Ok(())
        }
        async fn resize(&self, id: u32, cols: u16, rows: u16) -> FxResult<()> {
            self.log(format!("resize {id} {cols}x{rows}"));
            Ok(())
        }
        async fn shutdown(&self, id: u32, immediate: bool) -> FxResult<()> {
            self.log(format!("shutdown {id} {immediate}"));
            Ok(())
        }
        async fn acknowledge_data_event(&self, _: u32, _: u64) -> FxResult<()> {
            Ok(())
        }
        async fn get_initial_cwd(&self, _: u32) -> FxResult<String> {
            Ok("/srv".into())
        }
        async fn get_cwd(&self, _: u32) -> FxResult<String> {
            Ok("/srv".into())
        }
        async fn list_processes(&self) -> FxResult<Value> {
            Ok(json!([]))
        }
        async fn get_default_system_shell(&self) -> FxResult<String> {
            Ok("/bin/sh".into())
        }
        async fn get_environment(&self) -> FxResult<HashMap<String, String>> {
            Ok(HashMap::from([
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("LANG".to_string(), "C".to_string()),
                ("SECRET".to_string(), "1".to_string()),
            ]))
        }
        fn subscribe(&self, event: PtyEvent) -> Listener<Value> {
            assert_eq!(event, PtyEvent::ProcessData);
            self.data.subscribe()
        }
    }

    fn ctx() -> ChannelContext {
        ChannelContext {
            remote_authority: "localhost:35419".into(),
            transformer: Arc::new(ResourceTransformer::new(
                "localhost:35419",
                ResourceRoots::default(),
            )),
            token: "tok".into(),
        }
    }

    fn channel() -> (TerminalChannel, Arc<FakePty>) {
        let pty = Arc::new(FakePty::default());
        let settings = TerminalSettings {
            version: "1.2.3".into(),
            locale: "en".into(),
            home: Some(PathBuf::from("/home/dev")),
        };
        (TerminalChannel::new(pty.clone(), settings), pty)
    }

    fn folder(path: &str) -> Value {
        json!({
            "name": "server",
            "index": 0,
            "uri": { "$mid": 1, "scheme": "vscode-remote", "authority": "localhost:35419", "path": path },
        })
    }

    #[tokio::test]
    async fn create_process_builds_environment() {
        let (channel, pty) = channel();
        let args = json!({
            "configuration": {
                "terminal.integrated.cwd": "resources",
                "terminal.integrated.env.linux": { "ROOT": "${workspaceFolder}", "SECRET": null },
            },
            "shellLaunchConfig": { "name": "bash", "env": { "MODE": "dev" } },
            "activeWorkspaceFolder": folder("/srv/server"),
            "workspaceFolders": [folder("/srv/server")],
            "envVariableCollections": [
                ["ext.a", [["PATH", { "value": "/a/bin:", "type": 3 }]]],
                ["ext.b", [["PATH", { "value": ":/b/bin", "type": 2 }], ["TOOL", { "value": "x", "type": 1 }]]],
            ],
            "cols": 80,
            "rows": 24,
            "shouldPersistTerminal": true,
        });
        let result = channel.call(&ctx(), "$createProcess", args).await.unwrap();
        assert_eq!(result["persistentTerminalId"], 7);
        assert_eq!(result["resolvedShellLaunchConfig"]["cwd"], "/srv/server/resources");

        let created = pty.created.lock().unwrap();
        let request = &created[0];
        assert_eq!(request.cwd, "/srv/server/resources");
        assert_eq!((request.cols, request.rows), (80, 24));
        assert!(request.should_persist);
        let env = &request.env;
        assert_eq!(env["ROOT"], "/srv/server");
        assert_eq!(env["MODE"], "dev");
        assert!(!env.contains_key("SECRET"));
        assert_eq!(env["PATH"], "/a/bin:/usr/bin:/b/bin");
        assert_eq!(env["TOOL"], "x");
        assert_eq!(env["TERM_PROGRAM"], "vscode");
        assert_eq!(env["TERM_PROGRAM_VERSION"], "1.2.3");
        assert_eq!(env["COLORTERM"], "truecolor");
        assert_eq!(env["LANG"], "en_US.UTF-8");
    }

    #[tokio::test]
    async fn strict_env_uses_only_launch_variables() {
        let (channel, pty) = channel();
        let args = json!({
            "shellLaunchConfig": { "env": { "ONLY": "this" }, "strictEnv": true, "cwd": "/tmp" },
            "envVariableCollections": [["ext.a", [["PATH", { "value": "/a", "type": 1 }]]]],
        });
        channel.call(&ctx(), "$createProcess", args).await.unwrap();
        let created = pty.created.lock().unwrap();
        assert_eq!(created[0].cwd, "/tmp");
        assert_eq!(
            created[0].env,
            HashMap::from([("ONLY".to_string(), "this".to_string())])
        );
    }

    #[test]
    fn cwd_falls_back_to_root_then_home() {
        let t = ResourceTransformer::new("a", ResourceRoots::default());
        let resolver = VariableResolver::default();
        let launch = ShellLaunchConfig::default();
        let home = Path::new("/home/dev");
        assert_eq!(
            terminal_cwd(&t, &launch, None, Some(Path::new("/w")), Some(home), &resolver),
            "/w"
        );
        assert_eq!(terminal_cwd(&t, &launch, Some("sub"), None, Some(home), &resolver), "/home/dev");
        assert_eq!(terminal_cwd(&t, &launch, Some("/abs"), None, Some(home), &resolver), "/abs");

        let uri_cwd = ShellLaunchConfig {
            cwd: Some(json!({ "$mid": 1, "scheme": "vscode-remote", "authority": "a", "path": "/srv/x" })),
            ..Default::default()
        };
        assert_eq!(terminal_cwd(&t, &uri_cwd, Some("/abs"), None, None, &resolver), "/srv/x");
    }

    #[test]
    fn locale_to_lang() {
        assert_eq!(lang_for_locale("en"), "en_US.UTF-8");
        assert_eq!(lang_for_locale("pt-br"), "pt_BR.UTF-8");
        assert_eq!(lang_for_locale("xx"), "xx.UTF-8");
        assert_eq!(lang_for_locale(""), "en_US.UTF-8");
    }

    #[test]
    fn replace_shadows_earlier_extensions() {
        let mutator = |value: &str, kind| EnvMutator {
            value: value.into(),
            kind,
        };
        let collections = vec![
            ("a".to_string(), vec![("X".to_string(), mutator("-a", MutatorType::Append))]),
            ("b".to_string(), vec![("X".to_string(), mutator("b", MutatorType::Replace))]),
            ("c".to_string(), vec![("X".to_string(), mutator("-c", MutatorType::Append))]),
        ];
        let mut env = HashMap::from([("X".to_string(), "base".to_string())]);
        apply_env_collections(&mut env, &collections);
        assert_eq!(env["X"], "b-a");
    }

    #[tokio::test]
    async fn pty_commands_accept_positional_or_named_args() {
        let (channel, pty) = channel();
        channel.call(&ctx(), "$resize", json!([3, 120, 40])).await.unwrap();
        channel
            .call(&ctx(), "$input", json!({ "id": 3, "data": "ls\n" }))
            .await
            .unwrap();
        channel.call(&ctx(), "$shutdown", json!([3])).await.unwrap();
        let shell = channel.call(&ctx(), "$getDefaultSystemShell", json!([])).await.unwrap();
        assert_eq!(shell, "/bin/sh");
        assert_eq!(
            *pty.calls.lock().unwrap(),
            vec!["resize 3 120x40", "input 3 ls\n", "shutdown 3 false"]
        );
    }

    #[tokio::test]
    async fn unknown_command_returns_null() {
        let (channel, _) = channel();
        let result = channel.call(&ctx(), "$frobnicate", json!([1])).await.unwrap();
        assert_eq!(result, Value::Null);
        assert!(channel.listen(&ctx(), "$onFrobnicate", Value::Null).is_err());
    }

    #[tokio::test]
    async fn process_events_come_from_the_pty_host() {
        let (channel, pty) = channel();
        let mut events = channel.listen(&ctx(), "$onProcessDataEvent", Value::Null).unwrap();
        pty.data.fire(json!({ "id": 1, "event": "hi" }));
        assert_eq!(events.next().await.unwrap()["event"], "hi");
    }

    #[tokio::test]
    async fn execute_command_round_trip() {
        let (channel, _) = channel();
        let channel = Arc::new(channel);
        let c = ctx();
        let mut requests = channel.listen(&c, "$onExecuteCommand", Value::Null).unwrap();

        let running = {
            let channel = channel.clone();
            let transformer = c.transformer.clone();
            tokio::spawn(async move {
                let file = UriComponents::file("/srv/a.lua").to_value();
                channel.execute_command(transformer, "fxdk.open", json!([file])).await
            })
        };

        let request = requests.next().await.unwrap();
        assert_eq!(request["commandId"], "fxdk.open");
        assert_eq!(request["commandArgs"][0]["scheme"], "vscode-remote");
        let req_id = request["reqId"].as_u64().unwrap();

        let reply = json!({ "$mid": 1, "scheme": "vscode-remote", "authority": "localhost:35419", "path": "/srv/b.lua" });
        channel
            .call(&c, "$sendCommandResult", json!([req_id, false, reply]))
            .await
            .unwrap();
        let result = running.await.unwrap().unwrap();
        assert_eq!(result["scheme"], "file");
        assert_eq!(result["path"], "/srv/b.lua");
        assert_eq!(channel.pending_commands(), 0);
    }

    #[tokio::test]
    async fn execute_command_error_is_rejected() {
        let (channel, _) = channel();
        let channel = Arc::new(channel);
        let c = ctx();
        let mut requests = channel.listen(&c, "$onExecuteCommand", Value::Null).unwrap();
        let running = {
            let channel = channel.clone();
            let transformer = c.transformer.clone();
            tokio::spawn(async move { channel.execute_command(transformer, "x", json!([])).await })
        };
        let req_id = requests.next().await.unwrap()["reqId"].as_u64().unwrap();
        channel
            .call(&c, "$sendCommandResult", json!([req_id, true, { "message": "no such command" }]))
            .await
            .unwrap();
        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "channel error: no such command");
    }
}

//! `${...}` substitution for terminal launch settings.

use crate::channel::terminal::CreateTerminalArgs;
use fxcode_core::{ResourceTransformer, UriComponents};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves the variables a terminal's cwd and environment may reference.
///
/// Workspace and file resources are taken from the create request and
/// mapped to local paths first. Unknown or unavailable variables are left
/// in place.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    folders: Vec<(String, PathBuf)>,
    active_folder: Option<PathBuf>,
    resolved: Map<String, Value>,
    env: HashMap<String, String>,
    home: Option<PathBuf>,
    app_root: Option<String>,
    exec_path: Option<String>,
    file: Option<String>,
}

impl VariableResolver {
    /// `env` is the server process environment; `resolverEnv` entries from
    /// the request take precedence for `appRoot` and `execPath`.
    pub fn new(
        transformer: &ResourceTransformer,
        args: &CreateTerminalArgs,
        env: HashMap<String, String>,
        home: Option<PathBuf>,
    ) -> Self {
        let local = |uri: &UriComponents| transformer.resolve(uri).fs_path();
        let folders = args
            .workspace_folders
            .iter()
            .map(|f| (f.name.clone(), local(&f.uri)))
            .collect();
        let active_folder = args.active_workspace_folder.as_ref().map(|f| local(&f.uri));

        let from_request = |key: &str| {
            args.resolver_env
                .as_ref()
                .and_then(|e| e.get(key))
                .filter(|v| !v.is_empty())
                .cloned()
        };
        let app_root = from_request("VSCODE_CWD")
            .or_else(|| env.get("VSCODE_CWD").cloned())
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|d| d.to_string_lossy().into_owned())
            });
        let exec_path = from_request("VSCODE_EXEC_PATH").or_else(|| env.get("VSCODE_EXEC_PATH").cloned());

        let file = args.active_file_resource.as_ref().map(|uri| {
            let incoming = transformer.transform_incoming(uri);
            if incoming.scheme == "file" {
                incoming.fs_path().to_string_lossy().into_owned()
            } else {
                incoming.path
            }
        });

        Self {
            folders,
            active_folder,
            resolved: args.resolved_variables.clone(),
            env,
            home,
            app_root,
            exec_path,
            file,
        }
    }

    pub fn workspace_folder_count(&self) -> usize {
        self.folders.len()
    }

    pub fn folder(&self, name: &str) -> Option<&Path> {
        self.folders
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_path())
    }

    /// Substitute every `${name}` in `value`.
    pub fn resolve(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            let Some(len) = rest[start + 2..].find('}') else {
                break;
            };
            let name = &rest[start + 2..start + 2 + len];
            let end = start + 3 + len;
            out.push_str(&rest[..start]);
            match self.lookup(name) {
                Some(v) => out.push_str(&v),
                None => {
                    debug!(variable = name, "unresolved variable");
                    out.push_str(&rest[start..end]);
                }
            }
            rest = &rest[end..];
        }
        out.push_str(rest);
        out
    }

    /// Resolve every string value of a settings map in place; `null`
    /// entries are kept.
    pub fn resolve_map(&self, map: &mut Map<String, Value>) {
        for value in map.values_mut() {
            if let Value::String(s) = value {
                *s = self.resolve(s);
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some((kind, arg)) = name.split_once(':') {
            return match kind {
                "env" => Some(self.env.get(arg).cloned().unwrap_or_default()),
                "config" => self.resolved_str(&format!("config:{arg}")),
                "workspaceFolder" => self.folder(arg).map(display),
                "workspaceFolderBasename" => self.folder(arg).and_then(basename),
                _ => None,
            };
        }
        match name {
            "userHome" => self.home.as_deref().map(display),
            "workspaceFolder" | "workspaceRoot" => self.active_folder.as_deref().map(display),
            "workspaceFolderBasename" => self.active_folder.as_deref().and_then(basename),
            "cwd" => self
                .active_folder
                .as_deref()
                .map(display)
                .or_else(|| self.app_root.clone()),
            "appRoot" => self.app_root.clone(),
            "execPath" => self.exec_path.clone(),
            "file" => self.file.clone(),
            "fileBasename" => self.file.as_deref().and_then(|f| basename(Path::new(f))),
            "fileDirname" => self
                .file
                .as_deref()
                .and_then(|f| Path::new(f).parent())
                .map(display),
            "fileExtname" => self.file.as_deref().map(|f| {
                Path::new(f)
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default()
            }),
            "relativeFile" => {
                let file = self.file.as_deref()?;
                let root = self.active_folder.as_deref()?;
                Path::new(file).strip_prefix(root).ok().map(display)
            }
            "pathSeparator" => Some(std::path::MAIN_SEPARATOR.to_string()),
            "selectedText" => self.resolved_str("selectedText"),
            "lineNumber" => self.resolved_str("lineNumber"),
            _ => None,
        }
    }

    fn resolved_str(&self, key: &str) -> Option<String> {
        match self.resolved.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn basename(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxcode_core::ResourceRoots;
    use serde_json::json;

    fn resolver() -> VariableResolver {
        let transformer = ResourceTransformer::new("localhost:35419", ResourceRoots::default());
        let args: CreateTerminalArgs = serde_json::from_value(json!({
            "workspaceFolders": [
                { "name": "server", "uri": { "$mid": 1, "scheme": "vscode-remote", "authority": "localhost:35419", "path": "/srv/server" } },
                { "name": "tools", "uri": { "$mid": 1, "scheme": "vscode-remote", "authority": "localhost:35419", "path": "/srv/tools" } },
            ],
            "activeWorkspaceFolder": { "name": "server", "index": 0, "uri": { "$mid": 1, "scheme": "vscode-remote", "authority": "localhost:35419", "path": "/srv/server" } },
            "activeFileResource": { "$mid": 1, "scheme": "vscode-remote", "authority": "localhost:35419", "path": "/srv/server/resources/chat/client.lua" },
            "resolvedVariables": { "config:editor.tabSize": "4", "selectedText": "hello", "lineNumber": 12 },
            "resolverEnv": { "VSCODE_EXEC_PATH": "/opt/fxcode/fxcode" },
        }))
        .unwrap();
        let env = HashMap::from([("GAME".to_string(), "fivem".to_string())]);
        VariableResolver::new(&transformer, &args, env, Some(PathBuf::from("/home/dev")))
    }

    #[test]
    fn workspace_and_file_variables() {
        let r = resolver();
        assert_eq!(r.workspace_folder_count(), 2);
        assert_eq!(r.resolve("${workspaceFolder}/bin"), "/srv/server/bin");
        assert_eq!(r.resolve("${workspaceFolder:tools}"), "/srv/tools");
        assert_eq!(r.resolve("${workspaceFolderBasename}"), "server");
        assert_eq!(r.resolve("${file}"), "/srv/server/resources/chat/client.lua");
        assert_eq!(r.resolve("${fileBasename}"), "client.lua");
        assert_eq!(r.resolve("${relativeFile}"), "resources/chat/client.lua");
        assert_eq!(r.resolve("${userHome}/.cache"), "/home/dev/.cache");
    }

    #[test]
    fn request_provided_values() {
        let r = resolver();
        assert_eq!(r.resolve("${env:GAME}-${env:MISSING}"), "fivem-");
        assert_eq!(r.resolve("${config:editor.tabSize}"), "4");
        assert_eq!(r.resolve("${selectedText}:${lineNumber}"), "hello:12");
        assert_eq!(r.resolve("${execPath}"), "/opt/fxcode/fxcode");
    }

    #[test]
    fn unknown_variables_are_kept() {
        let r = resolver();
        assert_eq!(r.resolve("${command:pick} ${config:nope}"), "${command:pick} ${config:nope}");
        assert_eq!(r.resolve("${workspaceFolder:missing}"), "${workspaceFolder:missing}");
        assert_eq!(r.resolve("unterminated ${userHome"), "unterminated ${userHome");
    }
}

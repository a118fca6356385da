//! Resolved server-side locations and the environment description sent to
//! clients.

use crate::config::PathsConfig;
use fxcode_core::uri::{ResourceRoots, UriComponents};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Environment {
    pub app_root: PathBuf,
    pub user_home: PathBuf,
    pub content_root: PathBuf,
    pub user_data_dir: PathBuf,
    pub extensions_dir: PathBuf,
    pub builtin_extensions_dir: PathBuf,
    pub extra_builtin_extensions_dirs: Vec<PathBuf>,
    pub extra_extensions_dirs: Vec<PathBuf>,
    pub logs_dir: PathBuf,
}

impl Environment {
    pub fn from_config(paths: &PathsConfig) -> Self {
        Self {
            app_root: paths.app_root.clone(),
            user_home: paths.home_dir.clone(),
            content_root: paths.content_root.clone(),
            user_data_dir: paths.user_data_dir.clone(),
            extensions_dir: paths.extensions_dir.clone(),
            builtin_extensions_dir: paths.builtin_extensions_dir.clone(),
            extra_builtin_extensions_dirs: paths.extra_builtin_extensions_dirs.clone(),
            extra_extensions_dirs: paths.extra_extensions_dirs.clone(),
            logs_dir: paths.logs_dir.clone(),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.user_data_dir.join("User").join("settings.json")
    }

    pub fn global_storage_dir(&self) -> PathBuf {
        self.user_data_dir.join("User").join("globalStorage")
    }

    pub fn workspace_storage_dir(&self) -> PathBuf {
        self.user_data_dir.join("User").join("workspaceStorage")
    }

    pub fn extension_host_logs_dir(&self) -> PathBuf {
        self.logs_dir.join("extension-host")
    }

    /// Builtin search paths first, then installed ones; scan order matters
    /// for duplicate resolution.
    pub fn builtin_extension_dirs(&self) -> Vec<PathBuf> {
        std::iter::once(self.builtin_extensions_dir.clone())
            .chain(self.extra_builtin_extensions_dirs.iter().cloned())
            .collect()
    }

    pub fn installed_extension_dirs(&self) -> Vec<PathBuf> {
        std::iter::once(self.extensions_dir.clone())
            .chain(self.extra_extensions_dirs.iter().cloned())
            .collect()
    }

    pub fn resource_roots(&self) -> ResourceRoots {
        ResourceRoots {
            app_root: self.app_root.clone(),
            content_root: self.content_root.clone(),
            user_data_dir: self.user_data_dir.clone(),
        }
    }

    /// Create every directory the server writes into. Failures are logged,
    /// not returned; a missing directory only degrades the feature using it.
    pub async fn ensure_directories(&self) {
        let mut dirs = vec![
            self.extensions_dir.clone(),
            self.logs_dir.clone(),
            self.global_storage_dir(),
            self.workspace_storage_dir(),
        ];
        dirs.extend(self.extra_builtin_extensions_dirs.iter().cloned());
        dirs.extend(self.extra_extensions_dirs.iter().cloned());

        for dir in dirs {
            match tokio::fs::create_dir_all(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "directory ready"),
                Err(e) => warn!(path = %dir.display(), error = %e, "cannot create directory"),
            }
        }
    }

    /// Description of this server returned by `getEnvironmentData`. URIs
    /// are local `file` URIs; the caller transforms them outgoing.
    pub fn environment_data(&self, connection_token: &str) -> Value {
        json!({
            "pid": std::process::id(),
            "connectionToken": connection_token,
            "appRoot": file_uri(&self.app_root),
            "settingsPath": file_uri(&self.settings_path()),
            "logsPath": file_uri(&self.logs_dir),
            "extensionsPath": file_uri(&self.extensions_dir),
            "extensionHostLogsPath": file_uri(&self.extension_host_logs_dir()),
            "globalStorageHome": file_uri(&self.global_storage_dir()),
            "workspaceStorageHome": file_uri(&self.workspace_storage_dir()),
            "userHome": file_uri(&self.user_home),
            "useHostProxy": false,
            "os": os_code(),
            "arch": std::env::consts::ARCH,
            "marks": [],
        })
    }
}

fn file_uri(path: &Path) -> Value {
    UriComponents::file(path).to_value()
}

/// Workbench operating-system code: 1 Windows, 2 macOS, 3 Linux.
fn os_code() -> u8 {
    match std::env::consts::OS {
        "windows" => 1,
        "macos" => 2,
        _ => 3,
    }
}

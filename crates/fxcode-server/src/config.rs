//! Server configuration: TOML file + CLI overrides.

use fxcode_core::{FxError, FxResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Directory name under the platform's local data directory.
const PERSONALITY_DIR: &str = "citizenfx/sdk-personality-fxcode";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub extension_host: ExtensionHostSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub remote_authority: Option<String>,
    #[serde(default)]
    pub max_extra_offline_connections: usize,
    #[serde(default = "default_reconnection_grace")]
    pub reconnection_grace_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            commit: String::new(),
            remote_authority: None,
            max_extra_offline_connections: 0,
            reconnection_grace_secs: default_reconnection_grace(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

/// `[paths]` section. Unset entries are derived from the data directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsSection {
    pub app_root: Option<String>,
    pub home_dir: Option<String>,
    pub content_root: Option<String>,
    pub user_data_dir: Option<String>,
    pub extensions_dir: Option<String>,
    pub builtin_extensions_dir: Option<String>,
    pub extra_builtin_extensions_dirs: Option<Vec<String>>,
    #[serde(default)]
    pub extra_extensions_dirs: Vec<String>,
    pub logs_dir: Option<String>,
}

/// `[extension_host]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionHostSection {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for ExtensionHostSection {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            language: default_language(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    35419
}
fn default_reconnection_grace() -> u64 {
    3 * 60 * 60
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_language() -> String {
    "en".to_string()
}

/// Filesystem locations the server reads and writes.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub app_root: PathBuf,
    /// Home directory reported to the client.
    pub home_dir: PathBuf,
    pub content_root: PathBuf,
    pub user_data_dir: PathBuf,
    pub extensions_dir: PathBuf,
    pub builtin_extensions_dir: PathBuf,
    pub extra_builtin_extensions_dirs: Vec<PathBuf>,
    pub extra_extensions_dirs: Vec<PathBuf>,
    pub logs_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExtensionHostConfig {
    /// Empty means extension-host connections are refused.
    pub command: String,
    pub args: Vec<String>,
    pub language: String,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Build identifier compared against the client's handshake.
    pub commit: String,
    pub remote_authority: String,
    /// Offline sessions kept per connection type after a new connection.
    pub max_extra_offline_connections: usize,
    pub reconnection_grace: Duration,
    pub handshake_timeout: Duration,
    pub paths: PathsConfig,
    pub extension_host: ExtensionHostConfig,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub commit: Option<String>,
    pub app_root: Option<String>,
    pub extra_extensions_dirs: Vec<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> FxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| FxError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::from_file(file_config, cli))
    }

    /// Merge a parsed file with CLI overrides.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> Self {
        let host = cli.host.unwrap_or(file.server.host);
        let port = cli.port.unwrap_or(file.server.port);
        let commit = cli.commit.unwrap_or(file.server.commit);
        let remote_authority = file
            .server
            .remote_authority
            .unwrap_or_else(|| format!("localhost:{port}"));

        let mut paths = resolve_paths(file.paths, cli.app_root);
        paths
            .extra_extensions_dirs
            .extend(cli.extra_extensions_dirs.iter().map(|d| expand_tilde_str(d)));

        Self {
            host,
            port,
            commit,
            remote_authority,
            max_extra_offline_connections: file.server.max_extra_offline_connections,
            reconnection_grace: Duration::from_secs(file.server.reconnection_grace_secs),
            handshake_timeout: Duration::from_secs(file.server.handshake_timeout_secs),
            paths,
            extension_host: ExtensionHostConfig {
                command: file.extension_host.command,
                args: file.extension_host.args,
                language: file.extension_host.language,
            },
        }
    }
}

fn resolve_paths(section: PathsSection, cli_app_root: Option<String>) -> PathsConfig {
    let personality = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PERSONALITY_DIR);
    let path_or = |value: Option<String>, fallback: PathBuf| {
        value
            .filter(|v| !v.is_empty())
            .map(|v| expand_tilde_str(&v))
            .unwrap_or(fallback)
    };

    let app_root = path_or(cli_app_root.or(section.app_root), PathBuf::from("."));
    let user_data_dir = path_or(section.user_data_dir, personality.join("user"));
    let extra_builtin = match section.extra_builtin_extensions_dirs {
        Some(dirs) => dirs.iter().map(|d| expand_tilde_str(d)).collect(),
        None => vec![personality.join("builtin-extensions")],
    };

    PathsConfig {
        home_dir: path_or(section.home_dir, personality.join("home")),
        content_root: path_or(section.content_root, PathBuf::new()),
        extensions_dir: path_or(section.extensions_dir, personality.join("user-extensions")),
        builtin_extensions_dir: path_or(section.builtin_extensions_dir, app_root.join("extensions")),
        extra_builtin_extensions_dirs: extra_builtin,
        extra_extensions_dirs: section
            .extra_extensions_dirs
            .iter()
            .map(|d| expand_tilde_str(d))
            .collect(),
        logs_dir: path_or(section.logs_dir, user_data_dir.join("logs")),
        user_data_dir,
        app_root,
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

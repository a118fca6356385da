//! Resource identifiers and the remote/local rewriting applied at channel
//! boundaries.
//!
//! A client addresses files through URIs relative to its remote authority;
//! channels need plain local paths. [`ResourceTransformer`] converts between
//! the two and also unwraps the handful of synthetic schemes the workbench
//! uses for static assets, webview resources, the game's content tree and
//! the per-install user-data directory.

use crate::error::{FxError, FxResult};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const SCHEME_FILE: &str = "file";
pub const SCHEME_REMOTE: &str = "vscode-remote";
pub const SCHEME_LOCAL: &str = "vscode-local";
pub const SCHEME_CITIZEN: &str = "citizen";
pub const SCHEME_USER_DATA: &str = "vscode-userdata";

/// Path the webview service worker uses to request local resources.
pub const WEBVIEW_RESOURCE_PATH: &str = "/vscode-resource";

/// Marker value carried by serialized URIs (`"$mid": 1`).
const URI_MARKER: u64 = 1;

/// Structured URI as it travels inside channel arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UriComponents {
    pub scheme: String,
    #[serde(default)]
    pub authority: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub fragment: String,
}

impl Serialize for UriComponents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("$mid", &URI_MARKER)?;
        map.serialize_entry("scheme", &self.scheme)?;
        if !self.authority.is_empty() {
            map.serialize_entry("authority", &self.authority)?;
        }
        map.serialize_entry("path", &self.path)?;
        if !self.query.is_empty() {
            map.serialize_entry("query", &self.query)?;
        }
        if !self.fragment.is_empty() {
            map.serialize_entry("fragment", &self.fragment)?;
        }
        map.end()
    }
}

impl UriComponents {
    /// A `file` URI for a local path. Separators are normalised to `/`.
    pub fn file(path: impl AsRef<Path>) -> Self {
        let mut p = path.as_ref().to_string_lossy().replace('\\', "/");
        if !p.starts_with('/') {
            p.insert(0, '/');
        }
        Self {
            scheme: SCHEME_FILE.to_string(),
            path: p,
            ..Default::default()
        }
    }

    /// Parse a URI out of a JSON argument.
    pub fn from_value(value: &Value) -> FxResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| FxError::InvalidMessage(format!("expected a URI: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Local filesystem path for this URI, ignoring its scheme.
    pub fn fs_path(&self) -> PathBuf {
        let path = self.path.as_str();
        if !self.authority.is_empty() && self.scheme == SCHEME_FILE {
            return PathBuf::from(format!("//{}{}", self.authority, path));
        }
        let bytes = path.as_bytes();
        if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':'
        {
            return PathBuf::from(&path[1..]);
        }
        PathBuf::from(path)
    }

    fn with_scheme(&self, scheme: &str, authority: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for UriComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if !self.authority.is_empty() || self.scheme == SCHEME_FILE {
            write!(f, "//{}", self.authority)?;
        }
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

/// Directories the synthetic schemes resolve against.
#[derive(Debug, Clone, Default)]
pub struct ResourceRoots {
    /// Target of `/static*/` paths.
    pub app_root: PathBuf,
    /// Target of `citizen:` URIs.
    pub content_root: PathBuf,
    /// Target of `vscode-userdata:` URIs.
    pub user_data_dir: PathBuf,
}

/// Rewrites resources crossing the boundary of one connection.
#[derive(Debug, Clone)]
pub struct ResourceTransformer {
    remote_authority: String,
    roots: ResourceRoots,
}

impl ResourceTransformer {
    pub fn new(remote_authority: impl Into<String>, roots: ResourceRoots) -> Self {
        Self {
            remote_authority: remote_authority.into(),
            roots,
        }
    }

    pub fn remote_authority(&self) -> &str {
        &self.remote_authority
    }

    pub fn roots(&self) -> &ResourceRoots {
        &self.roots
    }

    /// Scheme mapping for a URI received from the client.
    ///
    /// `vscode-remote` URIs are ours and become `file`; the client's own
    /// `file` URIs become `vscode-local`.
    pub fn transform_incoming(&self, uri: &UriComponents) -> UriComponents {
        match uri.scheme.as_str() {
            SCHEME_REMOTE => uri.with_scheme(SCHEME_FILE, ""),
            SCHEME_FILE => uri.with_scheme(SCHEME_LOCAL, ""),
            _ => uri.clone(),
        }
    }

    /// Scheme mapping for a URI sent to the client; inverse of
    /// [`transform_incoming`](Self::transform_incoming).
    pub fn transform_outgoing(&self, uri: &UriComponents) -> UriComponents {
        match uri.scheme.as_str() {
            SCHEME_FILE => uri.with_scheme(SCHEME_REMOTE, &self.remote_authority),
            SCHEME_LOCAL => uri.with_scheme(SCHEME_FILE, ""),
            _ => uri.clone(),
        }
    }

    /// Resolve the synthetic schemes to a local `file` URI.
    ///
    /// Anything that matches no special case, including a webview resource
    /// with a malformed query, passes through unchanged.
    pub fn to_local(&self, uri: &UriComponents) -> UriComponents {
        if let Some(rest) = strip_static_prefix(&uri.path) {
            return UriComponents::file(self.roots.app_root.join(rest));
        }
        if uri.path == WEBVIEW_RESOURCE_PATH && !uri.query.is_empty() {
            match serde_json::from_str::<Value>(&uri.query) {
                Ok(query) => {
                    if let Some(target) = query.get("requestResourcePath").and_then(Value::as_str) {
                        return UriComponents::file(target);
                    }
                }
                Err(e) => debug!(error = %e, "unparseable webview resource query"),
            }
            return uri.clone();
        }
        match uri.scheme.as_str() {
            SCHEME_CITIZEN => {
                UriComponents::file(self.roots.content_root.join(relative(&uri.path)))
            }
            SCHEME_USER_DATA => {
                UriComponents::file(self.roots.user_data_dir.join(relative(&uri.path)))
            }
            _ => uri.clone(),
        }
    }

    /// Re-express a local `file` URI in the synthetic scheme whose root
    /// contains it. The deepest matching root wins. Webview resources are not
    /// reconstructed; their local form is already a plain file.
    pub fn to_remote(&self, uri: &UriComponents) -> UriComponents {
        if uri.scheme != SCHEME_FILE {
            return uri.clone();
        }
        let path = uri.fs_path();
        let candidates = [
            (&self.roots.user_data_dir, SCHEME_USER_DATA),
            (&self.roots.content_root, SCHEME_CITIZEN),
            (&self.roots.app_root, SCHEME_REMOTE),
        ];
        let best = candidates
            .iter()
            .filter(|(root, _)| !root.as_os_str().is_empty())
            .filter_map(|(root, scheme)| {
                path.strip_prefix(root)
                    .ok()
                    .map(|rest| (root.components().count(), *scheme, rest))
            })
            .max_by_key(|(depth, _, _)| *depth);

        match best {
            Some((_, SCHEME_REMOTE, rest)) => UriComponents {
                scheme: SCHEME_REMOTE.to_string(),
                authority: self.remote_authority.clone(),
                path: format!("/static/{}", slash_join(rest)),
                ..Default::default()
            },
            Some((_, scheme, rest)) => UriComponents {
                scheme: scheme.to_string(),
                path: format!("/{}", slash_join(rest)),
                ..Default::default()
            },
            None => uri.clone(),
        }
    }

    /// Express a local `file` URI for the client in the address space of
    /// `addressed`, the URI the client used for it or for one of its
    /// ancestors. Synthetic schemes are reconstructed; anything else gets
    /// the plain outgoing mapping.
    pub fn restore(&self, local: &UriComponents, addressed: &UriComponents) -> UriComponents {
        let incoming = self.transform_incoming(addressed);
        if self.to_local(&incoming) != incoming {
            self.transform_outgoing(&self.to_remote(local))
        } else {
            self.transform_outgoing(local)
        }
    }

    /// Incoming mapping followed by synthetic-scheme resolution; what a
    /// channel needs before touching the disk.
    pub fn resolve(&self, uri: &UriComponents) -> UriComponents {
        self.to_local(&self.transform_incoming(uri))
    }

    /// Apply [`transform_incoming`](Self::transform_incoming) to every
    /// serialized URI (`"$mid": 1`) inside a JSON value.
    pub fn transform_incoming_json(&self, value: &mut Value) {
        walk_uris(value, &|uri| self.transform_incoming(uri));
    }

    /// Apply [`transform_outgoing`](Self::transform_outgoing) to every
    /// serialized URI inside a JSON value.
    pub fn transform_outgoing_json(&self, value: &mut Value) {
        walk_uris(value, &|uri| self.transform_outgoing(uri));
    }
}

fn walk_uris(value: &mut Value, f: &dyn Fn(&UriComponents) -> UriComponents) {
    if is_serialized_uri(value) {
        if let Ok(uri) = UriComponents::from_value(value) {
            *value = f(&uri).to_value();
            return;
        }
    }
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                walk_uris(v, f);
            }
        }
        Value::Array(items) => {
            for v in items {
                walk_uris(v, f);
            }
        }
        _ => {}
    }
}

fn is_serialized_uri(value: &Value) -> bool {
    value.get("$mid").and_then(Value::as_u64) == Some(URI_MARKER)
        && value.get("scheme").is_some_and(Value::is_string)
}

/// `/static/a/b` and `/static-1234/a/b` both yield `a/b`.
fn strip_static_prefix(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/static")?;
    let slash = rest.find('/')?;
    Some(&rest[slash + 1..])
}

fn relative(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

fn slash_join(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

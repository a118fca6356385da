//! Extension discovery.
//!
//! An extension is a directory holding a `package.json` manifest. Its
//! identity is `publisher.name`, compared case-insensitively. Localised
//! manifest strings (`"%key%"`) are filled from `package.nls.<lang>.json`,
//! falling back to `package.nls.json`.

use async_trait::async_trait;
use fxcode_core::uri::UriComponents;
use fxcode_core::FxResult;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MANIFEST: &str = "package.json";

/// Where and how to scan.
#[derive(Debug, Clone)]
pub struct ScanInput {
    pub language: String,
    pub path: PathBuf,
    pub is_builtin: bool,
    pub is_under_development: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionIdentifier {
    pub value: String,
    #[serde(rename = "_lower")]
    pub lower: String,
}

impl ExtensionIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let lower = value.to_lowercase();
        Self { value, lower }
    }

    /// Key used for duplicate detection.
    pub fn key(&self) -> &str {
        &self.lower
    }
}

/// A scanned extension: its manifest plus where and how it was found.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescription {
    pub identifier: ExtensionIdentifier,
    pub is_builtin: bool,
    pub is_under_development: bool,
    pub extension_location: UriComponents,
    #[serde(flatten)]
    pub manifest: Map<String, Value>,
}

impl ExtensionDescription {
    pub fn location(&self) -> PathBuf {
        self.extension_location.fs_path()
    }
}

#[async_trait]
pub trait ExtensionScanner: Send + Sync {
    /// Every extension directly under `input.path`.
    async fn scan_extensions(&self, input: &ScanInput) -> FxResult<Vec<ExtensionDescription>>;
    /// The extension at `input.path` itself, if it is one.
    async fn scan_single_extension(&self, input: &ScanInput)
        -> FxResult<Option<ExtensionDescription>>;
}

/// Reads manifests from disk.
#[derive(Debug, Default)]
pub struct ManifestScanner;

impl ManifestScanner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExtensionScanner for ManifestScanner {
    async fn scan_extensions(&self, input: &ScanInput) -> FxResult<Vec<ExtensionDescription>> {
        let mut entries = match tokio::fs::read_dir(&input.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %input.path.display(), "no extensions directory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut found = Vec::new();
        for dir in dirs {
            if let Some(ext) = read_extension(&dir, input).await {
                found.push(ext);
            }
        }
        debug!(path = %input.path.display(), count = found.len(), "scanned extensions");
        Ok(found)
    }

    async fn scan_single_extension(
        &self,
        input: &ScanInput,
    ) -> FxResult<Option<ExtensionDescription>> {
        Ok(read_extension(&input.path, input).await)
    }
}

/// Parse one extension directory. Unreadable or invalid manifests are
/// logged and skipped.
async fn read_extension(dir: &Path, input: &ScanInput) -> Option<ExtensionDescription> {
    let manifest_path = dir.join(MANIFEST);
    let raw = match tokio::fs::read_to_string(&manifest_path).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %manifest_path.display(), error = %e, "no readable manifest");
            return None;
        }
    };
    let mut manifest = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(path = %manifest_path.display(), "invalid extension manifest");
            return None;
        }
    };

    let field = |key: &str| manifest.get(key).and_then(Value::as_str).map(str::to_string);
    let (Some(publisher), Some(name)) = (field("publisher"), field("name")) else {
        warn!(path = %manifest_path.display(), "manifest lacks publisher or name");
        return None;
    };

    if let Some(messages) = load_translations(dir, &input.language).await {
        for value in manifest.values_mut() {
            localize(value, &messages);
        }
    }
    for reserved in ["identifier", "isBuiltin", "isUnderDevelopment", "extensionLocation"] {
        manifest.remove(reserved);
    }

    Some(ExtensionDescription {
        identifier: ExtensionIdentifier::new(format!("{publisher}.{name}")),
        is_builtin: input.is_builtin,
        is_under_development: input.is_under_development,
        extension_location: UriComponents::file(dir),
        manifest,
    })
}

async fn load_translations(dir: &Path, language: &str) -> Option<Map<String, Value>> {
    let mut candidates = Vec::new();
    if !language.is_empty() && language != "en" {
        candidates.push(dir.join(format!("package.nls.{language}.json")));
    }
    candidates.push(dir.join("package.nls.json"));
    for path in candidates {
        if let Ok(raw) = tokio::fs::read_to_string(&path).await {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => return Some(map),
                _ => warn!(path = %path.display(), "invalid translation file"),
            }
        }
    }
    None
}

/// Replace `"%key%"` strings with their translation. Entries are either a
/// plain string or `{ "message": ..., "comment": ... }`.
fn localize(value: &mut Value, messages: &Map<String, Value>) {
    match value {
        Value::String(s) if s.len() > 2 && s.starts_with('%') && s.ends_with('%') => {
            let key = &s[1..s.len() - 1];
            let translated = match messages.get(key) {
                Some(Value::String(t)) => Some(t.clone()),
                Some(Value::Object(o)) => o.get("message").and_then(Value::as_str).map(str::to_string),
                _ => None,
            };
            if let Some(t) = translated {
                *s = t;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| localize(v, messages)),
        Value::Object(map) => map.values_mut().for_each(|v| localize(v, messages)),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn write_extension(root: &Path, dir: &str, manifest: Value) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST), manifest.to_string()).unwrap();
    }

    fn input(path: &Path) -> ScanInput {
        ScanInput {
            language: "en".into(),
            path: path.to_path_buf(),
            is_builtin: false,
            is_under_development: true,
        }
    }

    #[tokio::test]
    async fn scans_valid_manifests_only() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(
            tmp.path(),
            "cfx-lua",
            json!({ "publisher": "Cfx", "name": "Lua", "version": "1.0.0" }),
        );
        write_extension(tmp.path(), "broken", json!({ "name": "nopublisher" }));
        std::fs::create_dir_all(tmp.path().join("empty")).unwrap();

        let found = ManifestScanner::new().scan_extensions(&input(tmp.path())).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier.value, "Cfx.Lua");
        assert_eq!(found[0].identifier.key(), "cfx.lua");
        assert_eq!(found[0].location(), tmp.path().join("cfx-lua"));

        let json = serde_json::to_value(&found[0]).unwrap();
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["isUnderDevelopment"], true);
        assert_eq!(json["extensionLocation"]["scheme"], "file");
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let found = ManifestScanner::new()
            .scan_extensions(&input(Path::new("/nonexistent/fxcode/extensions")))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn manifest_strings_are_localized() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(
            tmp.path(),
            "ext",
            json!({
                "publisher": "cfx",
                "name": "natives",
                "displayName": "%displayName%",
                "contributes": { "commands": [{ "title": "%cmd.title%" }] },
            }),
        );
        std::fs::write(
            tmp.path().join("ext/package.nls.json"),
            json!({ "displayName": "Natives", "cmd.title": "Open" }).to_string(),
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("ext/package.nls.de.json"),
            json!({ "displayName": { "message": "Natives (de)" } }).to_string(),
        )
        .unwrap();

        let mut de = input(&tmp.path().join("ext"));
        de.language = "de".into();
        let ext = ManifestScanner::new().scan_single_extension(&de).await.unwrap().unwrap();
        assert_eq!(ext.manifest["displayName"], "Natives (de)");
        // The German file has no entry, so the placeholder stays.
        assert_eq!(ext.manifest["contributes"]["commands"][0]["title"], "%cmd.title%");

        let en = ManifestScanner::new()
            .scan_single_extension(&input(&tmp.path().join("ext")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(en.manifest["contributes"]["commands"][0]["title"], "Open");
    }
}

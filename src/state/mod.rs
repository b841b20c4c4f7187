//! On-disk state store: source-image locks, base-image build results, and
//! the project salt, persisted atomically to `.tplbuilddata.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub salt: String,
    /// `"repo:tag@platform" -> digest`
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
    /// `content_hash -> { platform -> digest }`
    #[serde(default)]
    pub base_images: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

pub fn source_key(repo: &str, tag: &str, platform: &str) -> String {
    format!("{}:{}@{}", repo, tag, platform)
}

/// Guards a `StateDocument` with a single-writer discipline and persists it
/// with write-temp-then-rename semantics. Cross-process access is not
/// protected — tplbuild is a single-user tool.
pub struct StateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| StateError::Corrupted {
                path: path.display().to_string(),
                source,
            })?
        } else {
            StateDocument {
                version: CURRENT_VERSION,
                ..Default::default()
            }
        };
        Ok(StateStore {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn salt(&self) -> String {
        self.doc.lock().expect("state mutex poisoned").salt.clone()
    }

    pub fn set_salt(&self, salt: String) -> Result<(), StateError> {
        {
            let mut doc = self.doc.lock().expect("state mutex poisoned");
            doc.salt = salt;
        }
        self.flush()
    }

    pub fn source_digest(&self, repo: &str, tag: &str, platform: &str) -> Option<String> {
        let doc = self.doc.lock().expect("state mutex poisoned");
        doc.sources.get(&source_key(repo, tag, platform)).cloned()
    }

    pub fn record_source(&self, repo: &str, tag: &str, platform: &str, digest: String) -> Result<(), StateError> {
        {
            let mut doc = self.doc.lock().expect("state mutex poisoned");
            doc.sources.insert(source_key(repo, tag, platform), digest);
        }
        self.flush()
    }

    pub fn base_digest(&self, content_hash: &str, platform: &str) -> Option<String> {
        let doc = self.doc.lock().expect("state mutex poisoned");
        doc.base_images.get(content_hash).and_then(|m| m.get(platform)).cloned()
    }

    pub fn record_base(&self, content_hash: &str, platform: &str, digest: String) -> Result<(), StateError> {
        {
            let mut doc = self.doc.lock().expect("state mutex poisoned");
            doc.base_images
                .entry(content_hash.to_string())
                .or_default()
                .insert(platform.to_string(), digest);
        }
        self.flush()
    }

    fn flush(&self) -> Result<(), StateError> {
        let doc = self.doc.lock().expect("state mutex poisoned");
        write_atomic(&self.path, &*doc)
    }
}

fn write_atomic(path: &Path, doc: &StateDocument) -> Result<(), StateError> {
    let content = serde_json::to_string_pretty(doc).expect("StateDocument is always serializable");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content).map_err(|source| StateError::Write {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StateError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_source_and_base_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".tplbuilddata.json");
        let store = StateStore::load(&path).unwrap();
        store.record_source("python", "3.10", "linux/amd64", "sha256:aaa".to_string()).unwrap();
        store.record_base("contenthash1", "linux/amd64", "sha256:bbb".to_string()).unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(
            reloaded.source_digest("python", "3.10", "linux/amd64"),
            Some("sha256:aaa".to_string())
        );
        assert_eq!(
            reloaded.base_digest("contenthash1", "linux/amd64"),
            Some("sha256:bbb".to_string())
        );
    }

    #[test]
    fn missing_file_loads_as_empty_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".tplbuilddata.json");
        let store = StateStore::load(&path).unwrap();
        assert_eq!(store.salt(), "");
        assert!(store.source_digest("a", "b", "c").is_none());
    }

    #[test]
    fn corrupted_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".tplbuilddata.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(StateStore::load(&path).is_err());
    }

    #[test]
    fn running_source_update_twice_with_same_digest_leaves_file_byte_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".tplbuilddata.json");
        let store = StateStore::load(&path).unwrap();
        store.record_source("python", "3.10", "linux/amd64", "sha256:aaa".to_string()).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        store.record_source("python", "3.10", "linux/amd64", "sha256:aaa".to_string()).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }
}

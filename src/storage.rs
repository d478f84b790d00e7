use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use facegate_vision::{Encoding, ENCODING_DIM};
use serde::{Deserialize, Serialize};

use crate::config::FACE_STORE_PREFIX;

const TEMPLATE_FILE: &str = "face.bin";

/// Enrolled encoding for one identity. Replaced wholesale on re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTemplate {
    pub identity: String,
    pub encoding: Encoding,
    pub created_at: DateTime<Utc>,
}

/// Persistent identity → template mapping.
///
/// Implementations need not make `all` followed by `insert` atomic; see
/// the registration path in `session`.
pub trait TemplateStore: Send + Sync {
    /// Store `encoding` for `identity`, replacing any previous template.
    fn insert(&self, identity: &str, encoding: Encoding) -> Result<FaceTemplate>;
    fn get(&self, identity: &str) -> Result<Option<FaceTemplate>>;
    fn all(&self) -> Result<Vec<FaceTemplate>>;
    fn exists(&self, identity: &str) -> Result<bool> {
        Ok(self.get(identity)?.is_some())
    }
    /// Returns whether a template was removed.
    fn remove(&self, identity: &str) -> Result<bool>;
}

fn checked_template(identity: &str, encoding: Encoding, dimension: usize) -> Result<FaceTemplate> {
    validate_identity(identity)?;
    if encoding.len() != dimension {
        anyhow::bail!(
            "encoding for {identity} has {} values, store expects {dimension}",
            encoding.len()
        );
    }
    if !encoding.is_finite() {
        anyhow::bail!("encoding for {identity} contains non-finite values");
    }
    Ok(FaceTemplate {
        identity: identity.to_string(),
        encoding,
        created_at: Utc::now(),
    })
}

fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity.contains(['/', '\\', '\0'])
    {
        anyhow::bail!("invalid identity name {identity:?}");
    }
    Ok(())
}

/// One postcard file per identity under `<prefix>/<identity>/`.
#[derive(Debug, Clone)]
pub struct FileTemplateStore {
    root: PathBuf,
    dimension: usize,
}

impl Default for FileTemplateStore {
    fn default() -> Self {
        Self::new(FACE_STORE_PREFIX.to_path_buf())
    }
}

impl FileTemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_dimension(root, ENCODING_DIM)
    }

    pub fn with_dimension(root: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            root: root.into(),
            dimension,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn template_path(&self, identity: &str) -> PathBuf {
        self.root.join(identity).join(TEMPLATE_FILE)
    }

    fn read(&self, file: &Path) -> Result<FaceTemplate> {
        let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        postcard::from_bytes(&data).with_context(|| format!("decoding {}", file.display()))
    }
}

impl TemplateStore for FileTemplateStore {
    fn insert(&self, identity: &str, encoding: Encoding) -> Result<FaceTemplate> {
        let template = checked_template(identity, encoding, self.dimension)?;
        let file = self.template_path(identity);
        if let Some(dir) = file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let data = postcard::to_allocvec(&template)?;
        // Write beside the target and rename so readers never see half a file
        let partial = file.with_extension("bin.partial");
        std::fs::write(&partial, data)
            .with_context(|| format!("writing {}", partial.display()))?;
        std::fs::rename(&partial, &file)
            .with_context(|| format!("replacing {}", file.display()))?;
        log::debug!("stored template for {identity} at {}", file.display());
        Ok(template)
    }

    fn get(&self, identity: &str) -> Result<Option<FaceTemplate>> {
        validate_identity(identity)?;
        let file = self.template_path(identity);
        if !file.exists() {
            return Ok(None);
        }
        self.read(&file).map(Some)
    }

    fn all(&self) -> Result<Vec<FaceTemplate>> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut templates = Vec::new();
        for entry in entries {
            let file = entry?.path().join(TEMPLATE_FILE);
            if !file.is_file() {
                continue;
            }
            match self.read(&file) {
                Ok(t) if t.encoding.len() == self.dimension => templates.push(t),
                Ok(t) => log::warn!(
                    "skipping template for {}: dimension {} != {}",
                    t.identity,
                    t.encoding.len(),
                    self.dimension
                ),
                Err(e) => log::warn!("skipping unreadable template: {e:#}"),
            }
        }
        templates.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(templates)
    }

    fn remove(&self, identity: &str) -> Result<bool> {
        validate_identity(identity)?;
        let dir = self.root.join(identity);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        Ok(true)
    }
}

/// Process-local store.
#[derive(Debug)]
pub struct MemoryTemplateStore {
    templates: RwLock<BTreeMap<String, FaceTemplate>>,
    dimension: usize,
}

impl Default for MemoryTemplateStore {
    fn default() -> Self {
        Self::with_dimension(ENCODING_DIM)
    }
}

impl MemoryTemplateStore {
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            templates: RwLock::new(BTreeMap::new()),
            dimension,
        }
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn insert(&self, identity: &str, encoding: Encoding) -> Result<FaceTemplate> {
        let template = checked_template(identity, encoding, self.dimension)?;
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.to_string(), template.clone());
        Ok(template)
    }

    fn get(&self, identity: &str) -> Result<Option<FaceTemplate>> {
        Ok(self
            .templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned())
    }

    fn all(&self) -> Result<Vec<FaceTemplate>> {
        Ok(self
            .templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn remove(&self, identity: &str) -> Result<bool> {
        Ok(self
            .templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(values: &[f32]) -> Encoding {
        Encoding::new(values.to_vec())
    }

    #[test]
    fn file_store_insert_get_all_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTemplateStore::with_dimension(dir.path(), 3);

        store.insert("alice", enc(&[1.0, 0.0, 0.0])).unwrap();
        store.insert("bob", enc(&[0.0, 1.0, 0.0])).unwrap();

        let alice = store.get("alice").unwrap().unwrap();
        assert_eq!(alice.encoding, enc(&[1.0, 0.0, 0.0]));
        assert!(store.exists("bob").unwrap());
        assert!(!store.exists("carol").unwrap());

        let ids: Vec<_> = store.all().unwrap().into_iter().map(|t| t.identity).collect();
        assert_eq!(ids, vec!["alice", "bob"]);

        assert!(store.remove("alice").unwrap());
        assert!(!store.remove("alice").unwrap());
        assert!(store.get("alice").unwrap().is_none());
    }

    #[test]
    fn reinsert_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTemplateStore::with_dimension(dir.path(), 2);
        store.insert("alice", enc(&[1.0, 0.0])).unwrap();
        store.insert("alice", enc(&[0.0, 1.0])).unwrap();
        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].encoding, enc(&[0.0, 1.0]));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let store = MemoryTemplateStore::with_dimension(4);
        assert!(store.insert("alice", enc(&[1.0, 2.0])).is_err());
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn non_finite_is_rejected() {
        let store = MemoryTemplateStore::with_dimension(2);
        assert!(store.insert("alice", enc(&[f32::NAN, 1.0])).is_err());
    }

    #[test]
    fn path_like_identities_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTemplateStore::with_dimension(dir.path(), 1);
        for bad in ["", "..", "a/b", "x\0"] {
            assert!(store.insert(bad, enc(&[1.0])).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTemplateStore::new(dir.path().join("absent"));
        assert!(store.all().unwrap().is_empty());
    }
}

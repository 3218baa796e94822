//! Metadata stores: where key metadata lives. Key material never does.

use crate::error::HsmError;
use crate::types::{KeyId, KeyMetadata, KeyState};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Backend for persisting key metadata.
pub trait MetadataStore: Send + Sync {
    fn get(&self, id: &KeyId) -> Result<Option<KeyMetadata>, HsmError>;
    fn put(&self, meta: &KeyMetadata) -> Result<(), HsmError>;
    fn list(&self) -> Result<Vec<KeyMetadata>, HsmError>;
    fn list_by_state(&self, state: KeyState) -> Result<Vec<KeyMetadata>, HsmError> {
        Ok(self.list()?.into_iter().filter(|k| k.state == state).collect())
    }
}

fn store_error(what: &str, e: impl std::fmt::Display) -> HsmError {
    HsmError::Storage(format!("{}: {}", what, e))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory store (for tests and simulation runs).
pub struct InMemoryStore {
    keys: RwLock<HashMap<KeyId, KeyMetadata>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for InMemoryStore {
    fn get(&self, id: &KeyId) -> Result<Option<KeyMetadata>, HsmError> {
        let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
        Ok(keys.get(id).cloned())
    }

    fn put(&self, meta: &KeyMetadata) -> Result<(), HsmError> {
        let mut keys = self.keys.write().unwrap_or_else(|p| p.into_inner());
        keys.insert(meta.id.clone(), meta.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<KeyMetadata>, HsmError> {
        let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<KeyMetadata> = keys.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// File-based store (one JSON file per key).
///
/// ```text
/// keys/
///   {key_id}.json
/// ```
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, HsmError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| store_error("create dir", e))?;
        Ok(Self { dir })
    }

    fn key_path(&self, id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    fn read_key_file(&self, path: &Path) -> Result<KeyMetadata, HsmError> {
        let data = std::fs::read_to_string(path).map_err(|e| store_error("read", e))?;
        serde_json::from_str(&data).map_err(|e| store_error("parse", e))
    }
}

impl MetadataStore for FileStore {
    fn get(&self, id: &KeyId) -> Result<Option<KeyMetadata>, HsmError> {
        let path = self.key_path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_key_file(&path).map(Some)
    }

    fn put(&self, meta: &KeyMetadata) -> Result<(), HsmError> {
        let path = self.key_path(&meta.id);
        let json = serde_json::to_string_pretty(meta).map_err(|e| store_error("serialize", e))?;
        // write-then-rename keeps readers from seeing a torn file
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &json).map_err(|e| store_error("write", e))?;
        std::fs::rename(&tmp, &path).map_err(|e| store_error("rename", e))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<KeyMetadata>, HsmError> {
        let mut keys = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| store_error("readdir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| store_error("entry", e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                keys.push(self.read_key_file(&path)?);
            }
        }
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;
    use citadel_hsm_crypto::Algorithm;

    fn sample(id: &str, state: KeyState) -> KeyMetadata {
        KeyMetadata {
            id: KeyId::new(id),
            label: Some("test".into()),
            key_type: KeyType::Asymmetric,
            algorithm: Algorithm::EcdsaP256,
            classification: Classification::Confidential,
            usage: vec![KeyUsage::Sign, KeyUsage::Verify],
            state,
            hardware_generated: true,
            exportable: false,
            escrow_status: EscrowStatus::NotEscrowed,
            created_at: Utc::now(),
            expires_at: None,
            superseded_at: None,
            destroyed_at: None,
            supersedes: None,
            superseded_by: None,
            version: 1,
            vendor_handle: format!("obj-{}", id),
            access_log: Vec::new(),
        }
    }

    fn exercise(store: &dyn MetadataStore) {
        store.put(&sample("a", KeyState::Active)).unwrap();
        store.put(&sample("b", KeyState::Superseded)).unwrap();
        assert_eq!(store.get(&KeyId::new("a")).unwrap().unwrap().algorithm, Algorithm::EcdsaP256);
        assert!(store.get(&KeyId::new("zzz")).unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.list_by_state(KeyState::Superseded).unwrap().len(), 1);

        let mut a = store.get(&KeyId::new("a")).unwrap().unwrap();
        a.state = KeyState::Destroyed;
        store.put(&a).unwrap();
        assert_eq!(store.list_by_state(KeyState::Destroyed).unwrap().len(), 1);
    }

    #[test]
    fn in_memory_store() {
        exercise(&InMemoryStore::new());
    }

    #[test]
    fn file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("keys")).unwrap();
        exercise(&store);
        // survives reopening
        let reopened = FileStore::new(dir.path().join("keys")).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 2);
    }
}

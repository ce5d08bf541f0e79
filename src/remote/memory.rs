use crate::remote::BlobStore;
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Process-local store for tests. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

impl BlobStore for MemoryStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_objects() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.put("collections/a/x", b"1").expect("put");
        store.put("collections/b/y", b"2").expect("put");
        assert_eq!(other.get("collections/a/x").expect("get"), Some(b"1".to_vec()));
        assert_eq!(other.list("collections/a/").expect("list"), vec!["collections/a/x"]);
        other.delete("collections/a/x").expect("delete");
        other.delete("collections/a/x").expect("delete twice");
        assert_eq!(store.len(), 1);
    }
}

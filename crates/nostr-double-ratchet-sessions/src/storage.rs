use crate::utils::lock;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Key-value persistence used for sessions and invites.
///
/// Missing keys are not an error: `get` returns `Ok(None)` and `del` succeeds.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct InMemoryStorage {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.store).get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        lock(&self.store).insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        lock(&self.store).remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = lock(&self.store)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Loads this installation's device id, generating and persisting one on
/// first use.
pub async fn load_or_create_device_id(storage: &dyn StorageAdapter) -> Result<String> {
    const DEVICE_ID_KEY: &str = "device-id";

    if let Some(existing) = storage.get(DEVICE_ID_KEY).await? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }

    let device_id = uuid::Uuid::new_v4().to_string();
    storage.put(DEVICE_ID_KEY, device_id.clone()).await?;
    Ok(device_id)
}

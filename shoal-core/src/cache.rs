//! Optional blob cache consulted before disk on the read path.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// External cache collaborator, keyed by the specifier cache key
/// (`<hash>/<size>/image.<ext>`). Failures are invisible to callers; a
/// cache can only make reads cheaper.
#[async_trait]
pub trait RenditionCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Bytes>;
    async fn set(&self, key: &str, value: Bytes);
}

/// Process-local cache used by tests and single-node setups.
#[derive(Default)]
pub struct MemoryCache {
    inner: RwLock<HashMap<String, Bytes>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RenditionCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Bytes) {
        self.inner.write().await.insert(key.to_string(), value);
    }
}

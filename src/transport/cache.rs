//! Single-flight cache for broker client handles

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::Mutex;

/// Lazily populated map from entity descriptors to broker client handles
///
/// All access is serialized through one async mutex, so concurrent requests
/// for the same key trigger exactly one creation and every later request
/// receives the cached handle. Handles are released in bulk when the owning
/// transport stops.
pub struct SingleFlightCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for a key, creating it when absent
    ///
    /// The creation future runs while the cache lock is held; that lock is
    /// what makes creation single-flight.
    pub async fn get_or_create<F, Fut, E>(&self, key: &K, create: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(key) {
            return Ok(existing.clone());
        }

        let created = create().await?;
        entries.insert(key.clone(), created.clone());

        Ok(created)
    }

    /// Drops every cached handle
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of live handles, for diagnostics
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache holds no handles
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

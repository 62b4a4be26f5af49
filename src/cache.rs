use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::protocol::Blob;

/// Session scoped cache of downloaded blobs, keyed by url.
///
/// Concurrent lookups of the same key share a single fetch. Failed fetches
/// are not remembered, the next lookup tries again.
#[derive(Clone, Default)]
pub struct BlobCache {
    entries: Arc<Mutex<HashMap<String, Arc<OnceCell<Blob>>>>>,
}

impl BlobCache {
    /// Creates an empty `BlobCache`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached blob for `key` or runs `fetch` to obtain it.
    ///
    /// # Arguments
    /// * `key` - The blob's url.
    /// * `fetch` - Produces the blob when it isn't cached yet.
    ///
    /// # Returns
    /// The blob, or the error returned by `fetch`.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Blob, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Blob, E>>,
    {
        let cell = self
            .entries
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(fetch).await.cloned()
    }

    /// Amount of blobs fetched and retained.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every entry, used when a session ends.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

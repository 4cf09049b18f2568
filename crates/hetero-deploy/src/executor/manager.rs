//! [`ExecutorManager`]: creates and looks up per-`ExecutorKey` clients.
//!
//! Client creation is serialized (no two callers race to create the
//! same key's client) but use of an already-created client is not: once
//! returned, a client is intrinsically serialized by its own
//! request/response queue pairing.

use crate::error::{Error, Result};
use crate::executor::client::ExecutorClient;
use crate::executor::key::ExecutorKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Creates executor clients lazily and caches them by [`ExecutorKey`].
/// No two executors share a key (data model invariant); this type
/// enforces that by construction.
pub struct ExecutorManager<F> {
    clients: DashMap<ExecutorKey, Arc<dyn ExecutorClient>>,
    creation_lock: AsyncMutex<()>,
    factory: F,
}

impl<F, Fut> ExecutorManager<F>
where
    F: Fn(ExecutorKey) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn ExecutorClient>>>,
{
    /// Construct a manager that creates clients via the given async
    /// factory on first use per key.
    pub fn new(factory: F) -> Self {
        Self {
            clients: DashMap::new(),
            creation_lock: AsyncMutex::new(()),
            factory,
        }
    }

    /// Get the existing client for `key`, creating one if none exists
    /// yet. Concurrent calls for the same key never create more than
    /// one client: the second caller observes the first's result.
    pub async fn get_or_create_executor_client(
        &self,
        key: ExecutorKey,
    ) -> Result<Arc<dyn ExecutorClient>> {
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let client = (self.factory)(key.clone()).await?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Look up an already-created client without creating one.
    #[must_use]
    pub fn get_executor_client(&self, key: &ExecutorKey) -> Option<Arc<dyn ExecutorClient>> {
        self.clients.get(key).map(|entry| entry.clone())
    }

    /// Remove a client, e.g. after its subprocess has been torn down.
    pub fn remove(&self, key: &ExecutorKey) {
        self.clients.remove(key);
    }

    /// Number of distinct executor clients currently cached.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Look up an existing client, surfacing `ExecutorUnreachable` when
    /// absent (convenience over `get_executor_client` for call sites
    /// that require one to already exist).
    pub fn require_executor_client(&self, key: &ExecutorKey) -> Result<Arc<dyn ExecutorClient>> {
        self.get_executor_client(key)
            .ok_or_else(|| Error::ExecutorUnreachable(key.to_string(), "no client registered".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::executor::client::{ExecutorRequest, ExecutorResponse};
    use crate::executor::key::ProcessMode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeClient(ExecutorKey);

    #[async_trait]
    impl ExecutorClient for FakeClient {
        fn key(&self) -> &ExecutorKey {
            &self.0
        }
        async fn send(&self, _request: ExecutorRequest) -> Result<ExecutorResponse> {
            Ok(ExecutorResponse::ok())
        }
    }

    fn key() -> ExecutorKey {
        ExecutorKey {
            device_id: 0,
            device_type: DeviceType::Npu,
            context_id: "ctx".into(),
            engine_name: "NPU".into(),
            rank_id: 0,
            process_id: 1,
            process_mode: ProcessMode::Process,
            is_proxy: false,
        }
    }

    #[tokio::test]
    async fn creates_exactly_one_client_per_key_under_concurrency() {
        let creations = Arc::new(AtomicUsize::new(0));
        let creations_clone = creations.clone();
        let manager = Arc::new(ExecutorManager::new(move |k: ExecutorKey| {
            let creations = creations_clone.clone();
            async move {
                creations.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FakeClient(k)) as Arc<dyn ExecutorClient>)
            }
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let key = key();
            handles.push(tokio::spawn(async move {
                manager.get_or_create_executor_client(key).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(manager.client_count(), 1);
    }

    #[tokio::test]
    async fn require_executor_client_errors_when_absent() {
        let manager = ExecutorManager::new(|k: ExecutorKey| async move {
            Ok(Arc::new(FakeClient(k)) as Arc<dyn ExecutorClient>)
        });
        let err = manager.require_executor_client(&key()).unwrap_err();
        assert!(matches!(err, Error::ExecutorUnreachable(_, _)));
    }
}

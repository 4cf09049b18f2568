//! Gateway client contract and the per-`(device_id, device_type)` client
//! manager (`FlowGwClientManager`).
//!
//! The gateway is the thin transport described in the system overview:
//! "send request to a peer deployer/executor and await reply over device
//! message queues". `ExchangeRouteEngine` depends only on the
//! [`GatewayClient`] trait, never on a concrete transport, so tests can
//! substitute an in-memory fake (see `hetero-deploy-test-utils`).

use crate::device::DeviceInfo;
use crate::error::Result;
use crate::exchange::PhysicalId;
use crate::route::{EndpointDesc, EndpointIndex};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// One gateway client per `(device_id, device_type)`: supports group
/// create/destroy, bind/unbind, and route update on exception.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Create a queue/tag/ref-queue endpoint on this client's device,
    /// returning its resolved physical id.
    async fn create_endpoint(&self, endpoint: &EndpointDesc) -> Result<PhysicalId>;

    /// Destroy a previously created endpoint.
    async fn destroy_endpoint(&self, physical_id: &PhysicalId) -> Result<()>;

    /// Create a group over the given member physical ids.
    async fn create_group(&self, members: &[PhysicalId]) -> Result<PhysicalId>;

    /// Destroy a previously created group.
    async fn destroy_group(&self, group: &PhysicalId) -> Result<()>;

    /// Bind a producer endpoint to a consumer endpoint.
    async fn bind(&self, src: &PhysicalId, dst: &PhysicalId) -> Result<()>;

    /// Unbind a previously bound producer/consumer pair.
    async fn unbind(&self, src: &PhysicalId, dst: &PhysicalId) -> Result<()>;

    /// Reroute a binding to a new destination after an exception update.
    async fn reroute(&self, src: &PhysicalId, old_dst: &PhysicalId, new_dst: &PhysicalId) -> Result<()>;
}

/// Manages one [`GatewayClient`] per `(device_id, device_type)`,
/// creating clients lazily on first use.
pub struct FlowGwClientManager {
    clients: DashMap<String, Arc<dyn GatewayClient>>,
    factory: Box<dyn Fn(&DeviceInfo) -> Arc<dyn GatewayClient> + Send + Sync>,
}

impl FlowGwClientManager {
    /// Construct a manager that creates clients via the given factory
    /// function on first use per device.
    pub fn new(factory: impl Fn(&DeviceInfo) -> Arc<dyn GatewayClient> + Send + Sync + 'static) -> Self {
        Self {
            clients: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// Get or create the gateway client for the given device.
    #[must_use]
    pub fn client_for(&self, device: &DeviceInfo) -> Arc<dyn GatewayClient> {
        let key = device.canonical_form();
        if let Some(client) = self.clients.get(&key) {
            return client.clone();
        }
        let client = (self.factory)(device);
        self.clients.insert(key, client.clone());
        client
    }

    /// Number of distinct device clients currently materialized.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// An endpoint together with its resolved physical id, as tracked during
/// `PreDeploy`/`Deploy` bookkeeping.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    /// Endpoint index within its owning `FlowRoutePlan`.
    pub index: EndpointIndex,
    /// Resolved physical id.
    pub physical_id: PhysicalId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopClient;

    #[async_trait]
    impl GatewayClient for NoopClient {
        async fn create_endpoint(&self, _endpoint: &EndpointDesc) -> Result<PhysicalId> {
            Ok(PhysicalId::Queue(0))
        }
        async fn destroy_endpoint(&self, _physical_id: &PhysicalId) -> Result<()> {
            Ok(())
        }
        async fn create_group(&self, _members: &[PhysicalId]) -> Result<PhysicalId> {
            Ok(PhysicalId::Group(0))
        }
        async fn destroy_group(&self, _group: &PhysicalId) -> Result<()> {
            Ok(())
        }
        async fn bind(&self, _src: &PhysicalId, _dst: &PhysicalId) -> Result<()> {
            Ok(())
        }
        async fn unbind(&self, _src: &PhysicalId, _dst: &PhysicalId) -> Result<()> {
            Ok(())
        }
        async fn reroute(&self, _src: &PhysicalId, _old: &PhysicalId, _new: &PhysicalId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn client_manager_creates_one_client_per_device() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let manager = FlowGwClientManager::new(move |_device| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Arc::new(NoopClient) as Arc<dyn GatewayClient>
        });

        let device_a = DeviceInfo::new(DeviceType::Npu, "node-0", 0);
        let device_b = DeviceInfo::new(DeviceType::Npu, "node-0", 1);

        manager.client_for(&device_a);
        manager.client_for(&device_a);
        manager.client_for(&device_b);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.client_count(), 2);
    }
}

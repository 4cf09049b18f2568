//! A recording [`GatewayClient`] fixture: resolves endpoints to
//! sequential physical ids and records every bind/unbind call for
//! assertion, grounded on the `NoopClient` embedded in
//! `hetero-deploy`'s `exchange/gateway.rs` test module.

use async_trait::async_trait;
use hetero_deploy::error::Result;
use hetero_deploy::exchange::{GatewayClient, PhysicalId};
use hetero_deploy::route::EndpointDesc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// One recorded bind or unbind call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBinding {
    /// Source physical id.
    pub src: PhysicalId,
    /// Destination physical id.
    pub dst: PhysicalId,
}

/// A `GatewayClient` that resolves endpoints to sequential ids and
/// records every bind/unbind/reroute call in order, for assertion in
/// exchange-route-engine tests.
#[derive(Default)]
pub struct RecordingGateway {
    next_queue_id: AtomicU64,
    next_group_id: AtomicU64,
    binds: Mutex<Vec<RecordedBinding>>,
    unbinds: Mutex<Vec<RecordedBinding>>,
    reroutes: Mutex<Vec<(PhysicalId, PhysicalId, PhysicalId)>>,
}

impl RecordingGateway {
    /// Construct a gateway with empty recordings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every bind call recorded so far, in call order.
    #[must_use]
    pub fn binds(&self) -> Vec<RecordedBinding> {
        self.binds.lock().clone()
    }

    /// Every unbind call recorded so far, in call order.
    #[must_use]
    pub fn unbinds(&self) -> Vec<RecordedBinding> {
        self.unbinds.lock().clone()
    }
}

#[async_trait]
impl GatewayClient for RecordingGateway {
    async fn create_endpoint(&self, _endpoint: &EndpointDesc) -> Result<PhysicalId> {
        Ok(PhysicalId::Queue(self.next_queue_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn destroy_endpoint(&self, _physical_id: &PhysicalId) -> Result<()> {
        Ok(())
    }

    async fn create_group(&self, _members: &[PhysicalId]) -> Result<PhysicalId> {
        Ok(PhysicalId::Group(self.next_group_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn destroy_group(&self, _group: &PhysicalId) -> Result<()> {
        Ok(())
    }

    async fn bind(&self, src: &PhysicalId, dst: &PhysicalId) -> Result<()> {
        self.binds.lock().push(RecordedBinding {
            src: src.clone(),
            dst: dst.clone(),
        });
        Ok(())
    }

    async fn unbind(&self, src: &PhysicalId, dst: &PhysicalId) -> Result<()> {
        self.unbinds.lock().push(RecordedBinding {
            src: src.clone(),
            dst: dst.clone(),
        });
        Ok(())
    }

    async fn reroute(&self, src: &PhysicalId, old_dst: &PhysicalId, new_dst: &PhysicalId) -> Result<()> {
        self.reroutes
            .lock()
            .push((src.clone(), old_dst.clone(), new_dst.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_unbind_are_recorded_in_order() {
        let gateway = RecordingGateway::new();
        let a = gateway.create_endpoint(&EndpointDesc::queue("a", dummy_device())).await.unwrap();
        let b = gateway.create_endpoint(&EndpointDesc::queue("b", dummy_device())).await.unwrap();
        gateway.bind(&a, &b).await.unwrap();
        gateway.unbind(&a, &b).await.unwrap();

        assert_eq!(gateway.binds(), vec![RecordedBinding { src: a.clone(), dst: b.clone() }]);
        assert_eq!(gateway.unbinds(), vec![RecordedBinding { src: a, dst: b }]);
    }

    fn dummy_device() -> hetero_deploy::device::DeviceInfo {
        hetero_deploy::device::DeviceInfo::new(hetero_deploy::device::DeviceType::Npu, "node-0", 0)
    }
}

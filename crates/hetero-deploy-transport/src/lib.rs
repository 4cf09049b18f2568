//! gRPC wire transport for `hetero-deploy`'s cross-node control plane
//! and chunked file transfer.
//!
//! The core crate names two collaborator traits at its boundary and
//! depends on neither transport nor serialization detail:
//! [`hetero_deploy::exchange::GatewayClient`] (endpoint/group
//! create-destroy, bind/unbind, reroute) and
//! [`hetero_deploy::orchestrator::RemoteDeployer`] (maintenance config
//! push, artifact transfer, batch load, undeploy). This crate is the
//! production implementation of both, riding a single `DeployTransport`
//! gRPC service (see `proto/hetero_deploy.proto`) whose envelopes carry
//! the core crate's own `Serialize`/`Deserialize` types as opaque JSON
//! bytes fields rather than re-modeling them as protobuf messages.
//!
//! `hetero-deploy-test-utils` provides in-memory fakes of both traits
//! for tests that don't need a real network.

pub mod client;
pub(crate) mod codec;
pub mod error;
pub mod file_transport;
pub mod server;

pub use client::{DeployTransportClient, DeployTransportClientConfig};
pub use error::{Error, Result};
pub use server::{DeployTransportHandler, DeployTransportServer};

/// Generated protobuf/tonic types for the `hetero_deploy.transport.v1`
/// package.
#[allow(clippy::large_enum_variant, clippy::clone_on_ref_ptr)]
pub mod proto {
    tonic::include_proto!("hetero_deploy.transport.v1");
}

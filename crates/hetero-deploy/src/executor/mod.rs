//! Per-device executor process management: identity ([`ExecutorKey`]),
//! lifecycle ([`ExecutorManager`]), and the request/response contract
//! ([`ExecutorClient`]).

pub mod client;
pub mod key;
pub mod manager;

pub use client::{BatchLoadEntry, ClearKind, ExecutorClient, ExecutorRequest, ExecutorResponse};
pub use key::{ExecutorKey, ProcessMode};
pub use manager::ExecutorManager;

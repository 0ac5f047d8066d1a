//! Access to the policy datastore holding workload endpoints.
//!
//! - [`EtcdDatastore`]: endpoints stored in etcd using the v1 key layout
//! - [`MemoryDatastore`]: in-process store, used for tests and dry runs

mod etcd;
mod memory;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;

pub use etcd::EtcdConfig;
pub use etcd::EtcdDatastore;
pub use memory::MemoryDatastore;

use crate::endpoint::Endpoint;

/// Orchestrator tag of the endpoints managed for Kubernetes pods.
pub const K8S_ORCHESTRATOR_ID: &str = "k8s";

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("Failed to reach datastore: {message}")]
    ConnectionFailed { message: String },
    #[error("Datastore request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },
    #[error("Endpoint {key} was modified concurrently")]
    Conflict { key: String },
    #[error("Invalid endpoint record at {key}")]
    InvalidRecord { key: String },
    #[error("Failed to encode endpoint {key}")]
    Encode { key: String },
}

/// Persistence of workload endpoint records.
#[async_trait]
pub trait DatastoreClient: Send + Sync {
    /// Write the full endpoint record.
    ///
    /// Records that were read from the datastore are written with a
    /// compare-and-swap against the value they were read as; on success the
    /// written value becomes the new compare value.
    ///
    /// # Errors
    ///
    /// - [`DatastoreError::Conflict`] if the stored record changed since it was read
    /// - [`DatastoreError::ConnectionFailed`] / [`DatastoreError::RequestFailed`] on transport errors
    async fn set_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), Report<DatastoreError>>;

    /// All endpoint records for the given orchestrator.
    async fn get_endpoints(
        &self,
        orchestrator_id: &str,
    ) -> Result<Vec<Endpoint>, Report<DatastoreError>>;
}

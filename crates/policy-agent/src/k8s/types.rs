use std::path::PathBuf;

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// A pod notification as delivered by the Kubernetes watch API.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// The pod was created, or seen for the first time after a list
    Added(Pod),
    /// The pod object changed
    Modified(Pod),
    /// The pod was removed
    Deleted(Pod),
}

impl PodEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            PodEvent::Added(_) => "ADDED",
            PodEvent::Modified(_) => "MODIFIED",
            PodEvent::Deleted(_) => "DELETED",
        }
    }

    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Invalid kubeconfig: {}", path.display())]
    InvalidKubeconfig { path: PathBuf },
    #[error("Failed to list pods: {message}")]
    ListFailed { message: String },
    #[error("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[error("Pod is missing required field `{field}`")]
    MissingField { field: &'static str },
}

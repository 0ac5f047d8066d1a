//! Pod event handlers keeping endpoint labels in sync with pod labels.
//!
//! The CNI plugin creates and deletes the endpoints themselves; these
//! handlers only mirror label changes made after the pod was created.

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cache::Caches;
use crate::datastore::DatastoreClient;
use crate::datastore::DatastoreError;
use crate::datastore::K8S_ORCHESTRATOR_ID;
use crate::k8s::parse_pod;
use crate::k8s::ParsedPod;
use crate::k8s::PodEvent;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid pod")]
    InvalidPod,
    #[error("Failed to load endpoints")]
    LoadEndpoints,
    #[error("Failed to update endpoint for {workload_id}")]
    UpdateEndpoint { workload_id: String },
}

/// What an update did with the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Labels match the cached labels
    Unchanged,
    /// The CNI plugin has not created the endpoint yet
    EndpointPending,
    /// New labels were written to the endpoint
    Written,
}

/// Owns the label and endpoint caches and applies pod events to them.
///
/// Events must be delivered one at a time; every method takes `&mut self`.
pub struct PodHandler<D> {
    datastore: D,
    caches: Caches,
}

impl<D: DatastoreClient> PodHandler<D> {
    pub fn new(datastore: D) -> Self {
        Self {
            datastore,
            caches: Caches::new(),
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Dispatch a watch event to its handler.
    pub async fn handle(&mut self, event: &PodEvent) -> Result<(), Report<HandlerError>> {
        match event {
            PodEvent::Added(pod) => self.add_pod(pod),
            PodEvent::Modified(pod) => self.update_pod(pod).await.map(|_| ()),
            PodEvent::Deleted(pod) => self.delete_pod(pod),
        }
    }

    /// Remember the labels of a new pod.
    ///
    /// The CNI plugin has already configured the endpoint with these labels,
    /// so the endpoint itself is left alone.
    pub fn add_pod(&mut self, pod: &Pod) -> Result<(), Report<HandlerError>> {
        let ParsedPod {
            workload_id,
            labels,
            ..
        } = parse(pod)?;

        debug!(workload_id = %workload_id, ?labels, "Updated label cache");
        self.caches.set_labels(workload_id, labels);
        Ok(())
    }

    /// Write changed pod labels to the pod's endpoint.
    ///
    /// An endpoint missing from the cache triggers one reload of both caches.
    /// If the endpoint is still unknown the CNI plugin has not created it yet
    /// and the update is skipped.
    pub async fn update_pod(&mut self, pod: &Pod) -> Result<UpdateOutcome, Report<HandlerError>> {
        let ParsedPod {
            workload_id,
            labels,
            ..
        } = parse(pod)?;
        debug!(workload_id = %workload_id, "Updating pod");

        let cached = self.caches.labels(&workload_id);
        debug!(workload_id = %workload_id, ?cached, new = ?labels, "Compare labels");
        if cached == Some(&labels) {
            debug!(workload_id = %workload_id, "Ignoring update with no label change");
            return Ok(UpdateOutcome::Unchanged);
        }

        info!(workload_id = %workload_id, "Labels have been updated");
        if self.caches.endpoint(&workload_id).is_none() {
            info!(workload_id = %workload_id, "No endpoint in cache, loading");
            self.load_caches().await?;
        }

        let Some(mut endpoint) = self.caches.endpoint(&workload_id).cloned() else {
            // labels changed before the pod was deployed
            info!(workload_id = %workload_id, "No endpoint for pod, wait for creation");
            return Ok(UpdateOutcome::EndpointPending);
        };
        debug!(workload_id = %workload_id, "Found endpoint");

        endpoint.set_labels(labels);
        if let Err(e) = self.datastore.set_endpoint(&mut endpoint).await {
            if matches!(e.current_context(), DatastoreError::Conflict { .. }) {
                // cached record is stale, the next update reloads it
                warn!(workload_id = %workload_id, "Endpoint changed in datastore, dropping cache entry");
                self.caches.remove(&workload_id);
            }
            return Err(e.change_context(HandlerError::UpdateEndpoint { workload_id }));
        }

        self.caches.store(endpoint);
        Ok(UpdateOutcome::Written)
    }

    /// Forget a deleted pod. The CNI plugin removes the endpoint itself.
    pub fn delete_pod(&mut self, pod: &Pod) -> Result<(), Report<HandlerError>> {
        let ParsedPod { workload_id, .. } = parse(pod)?;
        debug!(workload_id = %workload_id, "Pod deleted");

        let (labels_removed, endpoint_removed) = self.caches.remove(&workload_id);
        if labels_removed {
            debug!(workload_id = %workload_id, "Removed from label cache");
        }
        if endpoint_removed {
            debug!(workload_id = %workload_id, "Removed from endpoint cache");
        }
        Ok(())
    }

    /// Rebuild both caches from the endpoints stored for Kubernetes.
    ///
    /// Label entries of pods without an endpoint (host network pods, pods the
    /// CNI plugin has not wired up yet) are dropped as well, so the next
    /// MODIFIED event for such a pod counts as a label change and triggers
    /// another full read of the datastore.
    pub async fn load_caches(&mut self) -> Result<(), Report<HandlerError>> {
        let endpoints = self
            .datastore
            .get_endpoints(K8S_ORCHESTRATOR_ID)
            .await
            .change_context(HandlerError::LoadEndpoints)?;

        self.caches.replace_all(endpoints);
        info!(
            endpoints = self.caches.endpoint_count(),
            "Loaded endpoint and label caches"
        );
        Ok(())
    }
}

fn parse(pod: &Pod) -> Result<ParsedPod, Report<HandlerError>> {
    parse_pod(pod).change_context(HandlerError::InvalidPod)
}

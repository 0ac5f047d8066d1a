//! Label and endpoint caches keyed by workload id.

use std::collections::HashMap;

use crate::endpoint::Endpoint;
use crate::k8s::Labels;

/// Last-known labels and endpoint record per workload.
///
/// Both maps share the workload id key space. Writes that touch an endpoint's
/// labels go through [`Caches::store`] so the two maps never disagree about
/// the labels written to the datastore.
#[derive(Debug, Default)]
pub struct Caches {
    labels: HashMap<String, Labels>,
    endpoints: HashMap<String, Endpoint>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self, workload_id: &str) -> Option<&Labels> {
        self.labels.get(workload_id)
    }

    pub fn endpoint(&self, workload_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(workload_id)
    }

    pub fn set_labels(&mut self, workload_id: String, labels: Labels) {
        self.labels.insert(workload_id, labels);
    }

    /// Record an endpoint together with the labels it was written with.
    pub fn store(&mut self, endpoint: Endpoint) {
        self.labels
            .insert(endpoint.workload_id.clone(), endpoint.labels().clone());
        self.endpoints.insert(endpoint.workload_id.clone(), endpoint);
    }

    /// Forget a workload. Returns whether it was in the label cache and the
    /// endpoint cache respectively.
    pub fn remove(&mut self, workload_id: &str) -> (bool, bool) {
        (
            self.labels.remove(workload_id).is_some(),
            self.endpoints.remove(workload_id).is_some(),
        )
    }

    /// Drop every entry and rebuild both caches from `endpoints`.
    pub fn replace_all(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) {
        self.labels.clear();
        self.endpoints.clear();
        for endpoint in endpoints {
            self.store(endpoint);
        }
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

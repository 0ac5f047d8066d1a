use std::collections::BTreeMap;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use crate::k8s::KubernetesError;

/// Label selecting every pod of a namespace in selector-based policies.
pub const K8S_NAMESPACE_LABEL: &str = "calico/k8s_ns";

/// Pod labels, keyed by label name.
pub type Labels = BTreeMap<String, String>;

/// Workload identity and labels extracted from a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPod {
    /// `<namespace>.<name>`
    pub workload_id: String,
    pub namespace: String,
    pub name: String,
    /// Declared labels plus the namespace label
    pub labels: Labels,
}

/// Extract the workload identity and labels of a pod.
///
/// # Errors
///
/// - [`KubernetesError::MissingField`] if the pod has no namespace or name
pub fn parse_pod(pod: &Pod) -> Result<ParsedPod, Report<KubernetesError>> {
    let metadata = &pod.metadata;
    let namespace = metadata
        .namespace
        .clone()
        .ok_or_else(|| Report::new(KubernetesError::MissingField { field: "metadata.namespace" }))?;
    let name = metadata
        .name
        .clone()
        .ok_or_else(|| Report::new(KubernetesError::MissingField { field: "metadata.name" }))?;

    let mut labels = metadata.labels.clone().unwrap_or_default();
    labels.insert(K8S_NAMESPACE_LABEL.to_string(), namespace.clone());

    Ok(ParsedPod {
        workload_id: workload_id(&namespace, &name),
        namespace,
        name,
        labels,
    })
}

pub fn workload_id(namespace: &str, name: &str) -> String {
    format!("{namespace}.{name}")
}

//! Kubernetes integration module.
//!
//! This module watches Kubernetes pods and turns the watch stream into
//! [`PodEvent`]s for the label synchronizer.
//!
//! The main components are:
//! - [`PodWatcher`]: Lists and watches pods, delivering events one at a time
//! - [`parse_pod`]: Extracts the workload identity and labels of a pod
//! - [`PodEvent`]: Added/modified/deleted notifications

pub mod kube_client;
pub mod pod;
pub mod pod_watcher;
pub mod types;

pub use pod::parse_pod;
pub use pod::Labels;
pub use pod::ParsedPod;
pub use pod_watcher::PodWatcher;
pub use types::KubernetesError;
pub use types::PodEvent;

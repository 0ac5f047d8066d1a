//! Workload endpoint records and the NAT mapping derived from their labels.
//!
//! Pods carrying a public IP label get an `ipv4_nat` entry for each of their
//! IPv4 networks so outgoing traffic leaves with the public address as source.

use std::net::IpAddr;

use api_types::EndpointData;
use api_types::IpNat;
use ipnetwork::Ipv4Network;
use tracing::info;

use crate::k8s::Labels;

/// Label carrying the public IP assigned to a pod.
pub const PUBLIC_IP_LABEL: &str = "kuberdock-public-ip";

/// A workload endpoint as stored in the policy datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub hostname: String,
    pub orchestrator_id: String,
    pub workload_id: String,
    pub endpoint_id: String,
    pub data: EndpointData,
    /// Stored value this record was read from or last written as
    original_json: Option<String>,
}

impl Endpoint {
    pub fn new(
        hostname: impl Into<String>,
        orchestrator_id: impl Into<String>,
        workload_id: impl Into<String>,
        endpoint_id: impl Into<String>,
        data: EndpointData,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            orchestrator_id: orchestrator_id.into(),
            workload_id: workload_id.into(),
            endpoint_id: endpoint_id.into(),
            data,
            original_json: None,
        }
    }

    /// Record read back from the datastore; `stored` is used as compare value
    /// on the next write. The NAT mapping is re-derived from the stored labels.
    pub fn from_stored(
        hostname: impl Into<String>,
        orchestrator_id: impl Into<String>,
        workload_id: impl Into<String>,
        endpoint_id: impl Into<String>,
        stored: String,
    ) -> serde_json::Result<Self> {
        let data = EndpointData::from_json(&stored)?;
        let mut endpoint = Self::new(hostname, orchestrator_id, workload_id, endpoint_id, data);
        endpoint.original_json = Some(stored);
        endpoint.process_labels();
        Ok(endpoint)
    }

    pub fn original_json(&self) -> Option<&str> {
        self.original_json.as_deref()
    }

    pub fn set_original_json(&mut self, value: String) {
        self.original_json = Some(value);
    }

    pub fn labels(&self) -> &Labels {
        &self.data.labels
    }

    /// Replace the labels and recompute the NAT mapping.
    pub fn set_labels(&mut self, labels: Labels) {
        self.data.labels = labels;
        self.process_labels();
    }

    pub fn process_labels(&mut self) {
        self.data.ipv4_nat = derive_ipv4_nat(&self.data.labels, &self.data.ipv4_nets);
    }

    pub fn ipv4_nat(&self) -> Option<&[IpNat]> {
        self.data.ipv4_nat.as_deref()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        self.data.to_json()
    }
}

/// Pair every IPv4 network address with the public IP label value.
///
/// Returns `None` when the label is absent or is not an IP address.
pub fn derive_ipv4_nat(labels: &Labels, ipv4_nets: &[Ipv4Network]) -> Option<Vec<IpNat>> {
    let value = labels.get(PUBLIC_IP_LABEL)?;
    let ext_ip = match value.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => {
            info!(value = %value, "Invalid {PUBLIC_IP_LABEL}: {e}");
            return None;
        }
    };

    Some(
        ipv4_nets
            .iter()
            .map(|net| IpNat {
                int_ip: IpAddr::V4(net.ip()),
                ext_ip,
            })
            .collect(),
    )
}

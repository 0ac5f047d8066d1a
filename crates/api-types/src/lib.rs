//! Shared API type definitions
//!
//! This crate contains the wire format of workload endpoint records as they are
//! stored in the policy datastore, together with the NAT mapping entries derived
//! for pods that carry a public IP.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnetwork::Ipv4Network;
use ipnetwork::Ipv6Network;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;

/// Administrative state of a workload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    #[default]
    Active,
    Inactive,
}

/// One internal to external address pairing used for outbound traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNat {
    pub int_ip: IpAddr,
    pub ext_ip: IpAddr,
}

/// Endpoint record body as stored under the endpoint key.
///
/// Fields unknown to this crate are kept in `extra` so a read-modify-write
/// cycle does not drop data written by other components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointData {
    #[serde(default)]
    pub state: EndpointState,
    /// Host side interface name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub profile_ids: Vec<String>,
    #[serde(default, serialize_with = "sorted_nets")]
    pub ipv4_nets: Vec<Ipv4Network>,
    #[serde(default, serialize_with = "sorted_nets")]
    pub ipv6_nets: Vec<Ipv6Network>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_gateway: Option<IpAddr>,
    /// NAT mapping, omitted when there is nothing to map
    #[serde(default, skip_serializing_if = "nat_is_empty")]
    pub ipv4_nat: Option<Vec<IpNat>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn nat_is_empty(nat: &Option<Vec<IpNat>>) -> bool {
    nat.as_ref().map_or(true, |entries| entries.is_empty())
}

fn sorted_nets<T, S>(nets: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    T: ToString,
    S: Serializer,
{
    let mut nets: Vec<String> = nets.iter().map(ToString::to_string).collect();
    nets.sort();
    serializer.collect_seq(nets)
}

impl EndpointData {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(value: &str) -> serde_json::Result<Self> {
        serde_json::from_str(value)
    }
}

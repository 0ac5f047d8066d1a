//! Endpoint storage on top of the etcd v2 keys API.
//!
//! Endpoints live under
//! `/calico/v1/host/<hostname>/workload/<orchestrator>/<workload>/endpoint/<endpoint>`
//! with the JSON encoded record as value.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use reqwest::Certificate;
use reqwest::Client;
use reqwest::Identity;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use tracing::warn;

use super::DatastoreClient;
use super::DatastoreError;
use crate::endpoint::Endpoint;

const HOST_DIR: &str = "/calico/v1/host";

/// etcd error code for a missing key.
const ETCD_KEY_NOT_FOUND: u64 = 100;
/// etcd error code for a failed `prevValue` comparison.
const ETCD_COMPARE_FAILED: u64 = 101;

/// Connection settings of the etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Base URLs, e.g. `http://127.0.0.1:2379`, tried in order
    pub endpoints: Vec<String>,
    pub timeout: Duration,
    pub ca_cert_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            timeout: Duration::from_secs(10),
            ca_cert_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

/// Location of an endpoint record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EndpointPath<'a> {
    hostname: &'a str,
    orchestrator_id: &'a str,
    workload_id: &'a str,
    endpoint_id: &'a str,
}

impl<'a> EndpointPath<'a> {
    fn of(endpoint: &'a Endpoint) -> Self {
        Self {
            hostname: &endpoint.hostname,
            orchestrator_id: &endpoint.orchestrator_id,
            workload_id: &endpoint.workload_id,
            endpoint_id: &endpoint.endpoint_id,
        }
    }

    fn parse(key: &'a str) -> Option<Self> {
        let rest = key.strip_prefix(HOST_DIR)?.strip_prefix('/')?;
        let parts: Vec<&'a str> = rest.split('/').collect();
        match parts.as_slice() {
            &[hostname, "workload", orchestrator_id, workload_id, "endpoint", endpoint_id]
                if [hostname, orchestrator_id, workload_id, endpoint_id]
                    .iter()
                    .all(|part| !part.is_empty()) =>
            {
                Some(Self {
                    hostname,
                    orchestrator_id,
                    workload_id,
                    endpoint_id,
                })
            }
            _ => None,
        }
    }

    fn key(&self) -> String {
        format!(
            "{HOST_DIR}/{}/workload/{}/{}/endpoint/{}",
            self.hostname, self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

/// Endpoint datastore backed by etcd.
pub struct EtcdDatastore {
    client: Client,
    endpoints: Vec<String>,
}

impl EtcdDatastore {
    /// Create a datastore client.
    ///
    /// # Errors
    ///
    /// - [`DatastoreError::ConnectionFailed`] if no endpoint is configured, the
    ///   TLS files cannot be read, or the HTTP client cannot be built
    pub fn new(config: EtcdConfig) -> Result<Self, Report<DatastoreError>> {
        let connection_failed = |message: String| DatastoreError::ConnectionFailed { message };

        let endpoints: Vec<String> = config
            .endpoints
            .iter()
            .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(Report::new(connection_failed(
                "no etcd endpoints configured".to_string(),
            )));
        }

        let mut builder = Client::builder().timeout(config.timeout);

        if let Some(ca_cert_file) = &config.ca_cert_file {
            let pem = std::fs::read(ca_cert_file).change_context_lazy(|| {
                connection_failed(format!(
                    "Failed to read CA certificate: {}",
                    ca_cert_file.display()
                ))
            })?;
            let certificate = Certificate::from_pem(&pem).change_context_lazy(|| {
                connection_failed(format!("Invalid CA certificate: {}", ca_cert_file.display()))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let mut pem = std::fs::read(cert_file).change_context_lazy(|| {
                    connection_failed(format!(
                        "Failed to read client certificate: {}",
                        cert_file.display()
                    ))
                })?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key_file).change_context_lazy(|| {
                    connection_failed(format!("Failed to read client key: {}", key_file.display()))
                })?);
                let identity = Identity::from_pem(&pem).change_context_lazy(|| {
                    connection_failed("Invalid client certificate or key".to_string())
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(Report::new(connection_failed(
                    "client certificate and key must be configured together".to_string(),
                )));
            }
        }

        let client = builder
            .build()
            .change_context_lazy(|| connection_failed("Failed to create HTTP client".to_string()))?;

        Ok(Self { client, endpoints })
    }

    /// Send a request to the first reachable etcd endpoint.
    async fn send<F>(&self, build: F) -> Result<Response, Report<DatastoreError>>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            match build(&self.client, endpoint).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(endpoint = %endpoint, "etcd endpoint unreachable: {e}");
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(Report::new(DatastoreError::ConnectionFailed {
                        message: format!("request to {endpoint} failed: {e}"),
                    }));
                }
            }
        }

        Err(Report::new(DatastoreError::ConnectionFailed {
            message: match last_error {
                Some(e) => format!("all etcd endpoints unreachable, last error: {e}"),
                None => "all etcd endpoints unreachable".to_string(),
            },
        }))
    }
}

async fn read_error(response: Response) -> (StatusCode, Option<EtcdErrorBody>) {
    let status = response.status();
    let body = response.json::<EtcdErrorBody>().await.ok();
    (status, body)
}

fn request_failed(status: StatusCode, body: Option<EtcdErrorBody>) -> DatastoreError {
    let message = match body {
        Some(body) => match body.cause {
            Some(cause) => format!("{} ({}): {cause}", body.message, body.error_code),
            None => format!("{} ({})", body.message, body.error_code),
        },
        None => status.to_string(),
    };
    DatastoreError::RequestFailed {
        status: status.as_u16(),
        message,
    }
}

/// Collect every endpoint record of `orchestrator_id` below `node`.
fn collect_endpoints(node: EtcdNode, orchestrator_id: &str, endpoints: &mut Vec<Endpoint>) {
    if !node.nodes.is_empty() {
        for child in node.nodes {
            collect_endpoints(child, orchestrator_id, endpoints);
        }
        return;
    }

    let (Some(path), Some(value)) = (EndpointPath::parse(&node.key), node.value) else {
        return;
    };
    if path.orchestrator_id != orchestrator_id {
        return;
    }

    match Endpoint::from_stored(
        path.hostname,
        path.orchestrator_id,
        path.workload_id,
        path.endpoint_id,
        value,
    ) {
        Ok(endpoint) => endpoints.push(endpoint),
        Err(e) => warn!(key = %node.key, "Skipping undecodable endpoint: {e}"),
    }
}

#[async_trait]
impl DatastoreClient for EtcdDatastore {
    async fn set_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), Report<DatastoreError>> {
        let key = EndpointPath::of(endpoint).key();
        let value = endpoint
            .to_json()
            .change_context_lazy(|| DatastoreError::Encode { key: key.clone() })?;

        let mut form = vec![("value", value.clone())];
        if let Some(previous) = endpoint.original_json() {
            form.push(("prevValue", previous.to_string()));
        }

        let response = self
            .send(|client, base| client.put(format!("{base}/v2/keys{key}")).form(&form))
            .await?;

        if !response.status().is_success() {
            let (status, body) = read_error(response).await;
            let compare_failed = status == StatusCode::PRECONDITION_FAILED
                || body
                    .as_ref()
                    .is_some_and(|body| body.error_code == ETCD_COMPARE_FAILED);
            if compare_failed {
                return Err(Report::new(DatastoreError::Conflict { key }));
            }
            return Err(Report::new(request_failed(status, body)))
                .attach_printable(format!("writing {key}"));
        }

        debug!(key = %key, "Wrote endpoint");
        endpoint.set_original_json(value);
        Ok(())
    }

    async fn get_endpoints(
        &self,
        orchestrator_id: &str,
    ) -> Result<Vec<Endpoint>, Report<DatastoreError>> {
        let response = self
            .send(|client, base| {
                client
                    .get(format!("{base}/v2/keys{HOST_DIR}"))
                    .query(&[("recursive", "true")])
            })
            .await?;

        if !response.status().is_success() {
            let (status, body) = read_error(response).await;
            if body
                .as_ref()
                .is_some_and(|body| body.error_code == ETCD_KEY_NOT_FOUND)
            {
                debug!("No endpoints stored yet");
                return Ok(Vec::new());
            }
            return Err(Report::new(request_failed(status, body)))
                .attach_printable(format!("reading {HOST_DIR}"));
        }

        let listing = response
            .json::<EtcdResponse>()
            .await
            .change_context(DatastoreError::InvalidRecord {
                key: HOST_DIR.to_string(),
            })?;

        let mut endpoints = Vec::new();
        collect_endpoints(listing.node, orchestrator_id, &mut endpoints);
        Ok(endpoints)
    }
}

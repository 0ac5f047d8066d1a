use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;

use super::DatastoreClient;
use super::DatastoreError;
use crate::endpoint::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EndpointKey {
    hostname: String,
    orchestrator_id: String,
    workload_id: String,
    endpoint_id: String,
}

impl EndpointKey {
    fn of(endpoint: &Endpoint) -> Self {
        Self {
            hostname: endpoint.hostname.clone(),
            orchestrator_id: endpoint.orchestrator_id.clone(),
            workload_id: endpoint.workload_id.clone(),
            endpoint_id: endpoint.endpoint_id.clone(),
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.hostname, self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<EndpointKey, String>,
    reads: usize,
    writes: usize,
    fail_writes: bool,
}

/// In-process endpoint store.
///
/// Clones share the same records, so a test can keep a handle for
/// inspection while the handler owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    state: Arc<Mutex<State>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record as if another component had written it.
    pub fn insert(&self, endpoint: &Endpoint) -> serde_json::Result<()> {
        let value = endpoint.to_json()?;
        self.state().records.insert(EndpointKey::of(endpoint), value);
        Ok(())
    }

    /// Stored value of the endpoint with the given workload id.
    pub fn stored(&self, workload_id: &str) -> Option<String> {
        self.state()
            .records
            .iter()
            .find(|(key, _)| key.workload_id == workload_id)
            .map(|(_, value)| value.clone())
    }

    /// Number of `get_endpoints` calls served.
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Number of successful `set_endpoint` calls.
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    /// Make subsequent writes fail with a connection error.
    pub fn set_fail_writes(&self, enabled: bool) {
        self.state().fail_writes = enabled;
    }
}

#[async_trait]
impl DatastoreClient for MemoryDatastore {
    async fn set_endpoint(&self, endpoint: &mut Endpoint) -> Result<(), Report<DatastoreError>> {
        let key = EndpointKey::of(endpoint);
        let value = endpoint.to_json().change_context(DatastoreError::Encode {
            key: key.to_string(),
        })?;

        let mut state = self.state();
        if state.fail_writes {
            return Err(Report::new(DatastoreError::ConnectionFailed {
                message: "writes disabled".to_string(),
            }));
        }
        if let Some(previous) = endpoint.original_json() {
            if state.records.get(&key).map(String::as_str) != Some(previous) {
                return Err(Report::new(DatastoreError::Conflict {
                    key: key.to_string(),
                }));
            }
        }

        state.records.insert(key, value.clone());
        state.writes += 1;
        drop(state);

        endpoint.set_original_json(value);
        Ok(())
    }

    async fn get_endpoints(
        &self,
        orchestrator_id: &str,
    ) -> Result<Vec<Endpoint>, Report<DatastoreError>> {
        let mut state = self.state();
        state.reads += 1;

        state
            .records
            .iter()
            .filter(|(key, _)| key.orchestrator_id == orchestrator_id)
            .map(|(key, value)| {
                Endpoint::from_stored(
                    key.hostname.clone(),
                    key.orchestrator_id.clone(),
                    key.workload_id.clone(),
                    key.endpoint_id.clone(),
                    value.clone(),
                )
                .change_context(DatastoreError::InvalidRecord {
                    key: key.to_string(),
                })
            })
            .collect()
    }
}

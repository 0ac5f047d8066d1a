use std::collections::BTreeSet;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::api::WatchEvent;
use kube::api::WatchParams;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::datastore::DatastoreClient;
use crate::handlers::PodHandler;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::PodEvent;

/// Server side timeout of a single watch request.
const WATCH_TIMEOUT_SECS: u32 = 290;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Status code of a watch whose resource version has been compacted away.
const GONE: u16 = 410;

type PodKey = (String, String);

/// Lists and watches pods, feeding every event to the [`PodHandler`].
///
/// Events are handled one at a time, in the order the API server sent them.
/// After the initial list every relist compares the listed pods with the
/// pods seen so far, so that changes made while the watch was down are still
/// delivered as modifications or deletions.
pub struct PodWatcher<D> {
    client: Client,
    namespace: Option<String>,
    handler: PodHandler<D>,
    known: BTreeSet<PodKey>,
}

impl<D: DatastoreClient> PodWatcher<D> {
    /// Create a new pod watcher.
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    /// * `namespace` - Kubernetes namespace to watch (None for all namespaces)
    /// * `handler` - Receives every pod event
    pub fn new(client: Client, namespace: Option<String>, handler: PodHandler<D>) -> Self {
        Self {
            client,
            namespace,
            handler,
            known: BTreeSet::new(),
        }
    }

    /// Watch pods until `cancellation_token` is cancelled.
    ///
    /// List and watch failures are logged and retried after a delay.
    #[tracing::instrument(skip(self, cancellation_token), fields(namespace = ?self.namespace))]
    pub async fn run(
        &mut self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");

        while !cancellation_token.is_cancelled() {
            if let Err(e) = self.sync_pods(&cancellation_token).await {
                error!("Pod watch failed: {e:?}");
                // Wait before retrying
                select! {
                    _ = cancellation_token.cancelled() => {}
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }

        info!("Pod watcher shutdown requested");
        Ok(())
    }

    fn api(&self) -> Api<Pod> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// List all pods, then watch from the list's resource version until the
    /// version expires or the token is cancelled.
    async fn sync_pods(
        &mut self,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        let api = self.api();

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                Report::new(KubernetesError::ListFailed {
                    message: e.to_string(),
                })
            })?;
        let mut resource_version = list.metadata.resource_version.unwrap_or_default();
        info!(pods = list.items.len(), %resource_version, "Listed pods");

        for event in relist_events(&self.known, list.items) {
            self.dispatch(event).await;
        }

        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        loop {
            let mut stream = api
                .watch(&params, &resource_version)
                .await
                .map_err(|e| {
                    Report::new(KubernetesError::WatchFailed {
                        message: e.to_string(),
                    })
                })?
                .boxed();

            loop {
                let next = select! {
                    biased;
                    _ = cancellation_token.cancelled() => return Ok(()),
                    next = stream.next() => next,
                };

                let event = match next {
                    None => {
                        debug!(%resource_version, "Watch request ended, resuming");
                        break;
                    }
                    Some(Err(e)) => {
                        return Err(Report::new(KubernetesError::WatchFailed {
                            message: format!("Watch stream error: {e}"),
                        }));
                    }
                    Some(Ok(event)) => event,
                };

                let event = match event {
                    WatchEvent::Added(pod) => PodEvent::Added(pod),
                    WatchEvent::Modified(pod) => PodEvent::Modified(pod),
                    WatchEvent::Deleted(pod) => PodEvent::Deleted(pod),
                    WatchEvent::Bookmark(bookmark) => {
                        resource_version = bookmark.metadata.resource_version;
                        continue;
                    }
                    WatchEvent::Error(status) if status.code == GONE => {
                        warn!(%resource_version, "Resource version expired, relisting");
                        return Ok(());
                    }
                    WatchEvent::Error(status) => {
                        return Err(Report::new(KubernetesError::WatchFailed {
                            message: format!("{} ({})", status.message, status.code),
                        }));
                    }
                };

                if let Some(version) = &event.pod().metadata.resource_version {
                    resource_version.clone_from(version);
                }
                self.dispatch(event).await;
            }
        }
    }

    /// Hand one event to the handler, tracking which pods are known.
    async fn dispatch(&mut self, event: PodEvent) {
        if let Some(key) = pod_key(event.pod()) {
            if matches!(event, PodEvent::Deleted(_)) {
                self.known.remove(&key);
            } else {
                self.known.insert(key);
            }
        }

        if let Err(e) = self.handler.handle(&event).await {
            error!(event = event.kind(), "Failed to handle pod event: {e:?}");
        }
    }
}

fn pod_key(pod: &Pod) -> Option<PodKey> {
    Some((pod.metadata.namespace.clone()?, pod.metadata.name.clone()?))
}

/// Translate a pod list into events against the pods already known.
///
/// Unknown pods are added, known pods are modified and known pods missing
/// from the list are deleted.
fn relist_events(known: &BTreeSet<PodKey>, pods: Vec<Pod>) -> Vec<PodEvent> {
    let listed: BTreeSet<PodKey> = pods.iter().filter_map(pod_key).collect();

    let mut events: Vec<PodEvent> = pods
        .into_iter()
        .map(|pod| match pod_key(&pod) {
            Some(key) if known.contains(&key) => PodEvent::Modified(pod),
            _ => PodEvent::Added(pod),
        })
        .collect();

    events.extend(known.difference(&listed).map(|(namespace, name)| {
        PodEvent::Deleted(Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.clone()),
                name: Some(name.clone()),
                ..Default::default()
            },
            ..Default::default()
        })
    }));

    events
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::datastore::MemoryDatastore;

    fn create_test_pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn summary(events: &[PodEvent]) -> Vec<(&'static str, String)> {
        events
            .iter()
            .map(|event| {
                let pod = event.pod();
                (
                    event.kind(),
                    format!(
                        "{}/{}",
                        pod.metadata.namespace.as_deref().unwrap_or_default(),
                        pod.metadata.name.as_deref().unwrap_or_default()
                    ),
                )
            })
            .collect()
    }

    #[test]
    fn initial_list_adds_every_pod() {
        let events = relist_events(
            &BTreeSet::new(),
            vec![create_test_pod("default", "web"), create_test_pod("kube-system", "dns")],
        );

        assert_eq!(
            summary(&events),
            vec![
                ("ADDED", "default/web".to_string()),
                ("ADDED", "kube-system/dns".to_string()),
            ]
        );
    }

    #[test]
    fn relist_reconciles_with_known_pods() {
        let known = BTreeSet::from([
            ("default".to_string(), "web".to_string()),
            ("default".to_string(), "gone".to_string()),
        ]);

        let events = relist_events(
            &known,
            vec![create_test_pod("default", "web"), create_test_pod("default", "new")],
        );

        assert_eq!(
            summary(&events),
            vec![
                ("MODIFIED", "default/web".to_string()),
                ("ADDED", "default/new".to_string()),
                ("DELETED", "default/gone".to_string()),
            ]
        );
    }

    #[test(tokio::test)]
    async fn dispatch_tracks_known_pods() {
        let client = Client::try_from(kube::Config::new("http://localhost:8080".parse().unwrap()))
            .unwrap();
        let mut watcher = PodWatcher::new(client, None, PodHandler::new(MemoryDatastore::new()));

        watcher
            .dispatch(PodEvent::Added(create_test_pod("default", "web")))
            .await;
        assert!(watcher
            .known
            .contains(&("default".to_string(), "web".to_string())));
        assert!(watcher.handler.caches().labels("default.web").is_some());

        watcher
            .dispatch(PodEvent::Deleted(create_test_pod("default", "web")))
            .await;
        assert!(watcher.known.is_empty());
        assert!(watcher.handler.caches().labels("default.web").is_none());
    }
}

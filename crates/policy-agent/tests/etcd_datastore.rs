//! Integration tests for the etcd datastore against an in-process etcd v2 stand-in

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use api_types::EndpointData;
use axum::extract::Path;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::routing::put;
use axum::Form;
use axum::Json;
use axum::Router;
use policy_agent::datastore::DatastoreError;
use policy_agent::datastore::EtcdConfig;
use policy_agent::datastore::EtcdDatastore;
use policy_agent::datastore::K8S_ORCHESTRATOR_ID;
use policy_agent::DatastoreClient;
use policy_agent::Endpoint;
use serde_json::json;
use serde_json::Value;
use similar_asserts::assert_eq;

const ENDPOINT_KEY: &str = "calico/v1/host/node-1/workload/k8s/default.web/endpoint/eth0";
const STORED: &str = r#"{"state": "active", "name": "cali1", "ipv4_nets": ["10.0.0.5/32"], "labels": {"app": "web"}}"#;

type Requests = Arc<Mutex<Vec<(String, HashMap<String, String>)>>>;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

/// Answers every PUT with `status` and `body`, recording key and form.
async fn serve_puts(status: StatusCode, body: Value) -> (String, Requests) {
    let requests = Requests::default();
    let recorded = requests.clone();
    let router = Router::new().route(
        "/v2/keys/*key",
        put(
            move |Path(key): Path<String>, Form(form): Form<HashMap<String, String>>| {
                let recorded = recorded.clone();
                let body = body.clone();
                async move {
                    recorded.lock().unwrap().push((key, form));
                    (status, Json(body))
                }
            },
        ),
    );
    (serve(router).await, requests)
}

/// Answers every GET with `status` and `body`, recording key and query.
async fn serve_gets(status: StatusCode, body: Value) -> (String, Requests) {
    let requests = Requests::default();
    let recorded = requests.clone();
    let router = Router::new().route(
        "/v2/keys/*key",
        get(
            move |Path(key): Path<String>, Query(query): Query<HashMap<String, String>>| {
                let recorded = recorded.clone();
                let body = body.clone();
                async move {
                    recorded.lock().unwrap().push((key, query));
                    (status, Json(body))
                }
            },
        ),
    );
    (serve(router).await, requests)
}

fn datastore(endpoints: Vec<String>) -> EtcdDatastore {
    EtcdDatastore::new(EtcdConfig {
        endpoints,
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap()
}

fn fresh_endpoint() -> Endpoint {
    Endpoint::new(
        "node-1",
        K8S_ORCHESTRATOR_ID,
        "default.web",
        "eth0",
        EndpointData::from_json(STORED).unwrap(),
    )
}

fn stored_endpoint() -> Endpoint {
    Endpoint::from_stored(
        "node-1",
        K8S_ORCHESTRATOR_ID,
        "default.web",
        "eth0",
        STORED.to_string(),
    )
    .unwrap()
}

#[tokio::test]
async fn new_record_is_written_without_compare_value() {
    let (url, requests) = serve_puts(StatusCode::CREATED, json!({"action": "set"})).await;
    let mut endpoint = fresh_endpoint();

    datastore(vec![url]).set_endpoint(&mut endpoint).await.unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (key, form) = &requests[0];
    assert_eq!(key, ENDPOINT_KEY);
    assert!(!form.contains_key("prevValue"));
    let written: Value = serde_json::from_str(&form["value"]).unwrap();
    assert_eq!(written["labels"], json!({"app": "web"}));
    assert_eq!(endpoint.original_json(), Some(form["value"].as_str()));
}

#[tokio::test]
async fn stored_record_is_compared_and_swapped() {
    let (url, requests) = serve_puts(StatusCode::OK, json!({"action": "compareAndSwap"})).await;
    let datastore = datastore(vec![url]);
    let mut endpoint = stored_endpoint();
    endpoint.data.profile_ids = vec!["k8s_ns.default".to_string()];

    datastore.set_endpoint(&mut endpoint).await.unwrap();
    datastore.set_endpoint(&mut endpoint).await.unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests[0].1["prevValue"], STORED);
    // the second write compares against what the first one wrote
    assert_eq!(requests[1].1["prevValue"], requests[0].1["value"]);
}

#[tokio::test]
async fn compare_failure_is_a_conflict() {
    let (url, _) = serve_puts(
        StatusCode::PRECONDITION_FAILED,
        json!({"errorCode": 101, "message": "Compare failed", "cause": "[a != b]", "index": 42}),
    )
    .await;
    let mut endpoint = stored_endpoint();

    let err = datastore(vec![url])
        .set_endpoint(&mut endpoint)
        .await
        .unwrap_err();

    assert!(matches!(
        err.current_context(),
        DatastoreError::Conflict { key } if key == &format!("/{ENDPOINT_KEY}")
    ));
    assert_eq!(endpoint.original_json(), Some(STORED));
}

#[tokio::test]
async fn compare_failure_code_without_412_is_a_conflict() {
    let (url, _) = serve_puts(
        StatusCode::BAD_REQUEST,
        json!({"errorCode": 101, "message": "Compare failed"}),
    )
    .await;

    let err = datastore(vec![url])
        .set_endpoint(&mut stored_endpoint())
        .await
        .unwrap_err();

    assert!(matches!(
        err.current_context(),
        DatastoreError::Conflict { .. }
    ));
}

#[tokio::test]
async fn server_error_is_reported_with_status() {
    let (url, _) = serve_puts(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"errorCode": 300, "message": "Raft Internal Error"}),
    )
    .await;

    let err = datastore(vec![url])
        .set_endpoint(&mut fresh_endpoint())
        .await
        .unwrap_err();

    match err.current_context() {
        DatastoreError::RequestFailed { status, message } => {
            assert_eq!(*status, 500);
            assert_eq!(message, "Raft Internal Error (300)");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_host_directory_means_no_endpoints() {
    let (url, requests) = serve_gets(
        StatusCode::NOT_FOUND,
        json!({"errorCode": 100, "message": "Key not found", "cause": "/calico/v1/host", "index": 7}),
    )
    .await;

    let endpoints = datastore(vec![url])
        .get_endpoints(K8S_ORCHESTRATOR_ID)
        .await
        .unwrap();

    assert!(endpoints.is_empty());
    let requests = requests.lock().unwrap();
    assert_eq!(requests[0].0, "calico/v1/host");
    assert_eq!(requests[0].1["recursive"], "true");
}

#[tokio::test]
async fn lists_endpoints_recursively() {
    let (url, _) = serve_gets(
        StatusCode::OK,
        json!({
            "action": "get",
            "node": {
                "key": "/calico/v1/host",
                "dir": true,
                "nodes": [{
                    "key": "/calico/v1/host/node-1",
                    "dir": true,
                    "nodes": [{
                        "key": format!("/{ENDPOINT_KEY}"),
                        "value": STORED
                    }]
                }]
            }
        }),
    )
    .await;

    let endpoints = datastore(vec![url])
        .get_endpoints(K8S_ORCHESTRATOR_ID)
        .await
        .unwrap();

    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].workload_id, "default.web");
    assert_eq!(endpoints[0].original_json(), Some(STORED));
}

#[tokio::test]
async fn unreachable_endpoint_fails_over_to_next() {
    // reserve a port, then free it so nothing listens there
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}", unused.local_addr().unwrap());
    drop(unused);
    let (url, requests) = serve_puts(StatusCode::CREATED, json!({"action": "set"})).await;

    datastore(vec![dead, url])
        .set_endpoint(&mut fresh_endpoint())
        .await
        .unwrap();

    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn all_endpoints_unreachable() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}", unused.local_addr().unwrap());
    drop(unused);

    let err = datastore(vec![dead])
        .get_endpoints(K8S_ORCHESTRATOR_ID)
        .await
        .unwrap_err();

    assert!(matches!(
        err.current_context(),
        DatastoreError::ConnectionFailed { .. }
    ));
}

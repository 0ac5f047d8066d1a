pub mod cache;
pub mod config;
pub mod datastore;
pub mod endpoint;
pub mod handlers;
pub mod k8s;

pub use cache::Caches;
pub use datastore::DatastoreClient;
pub use endpoint::Endpoint;
pub use handlers::PodHandler;

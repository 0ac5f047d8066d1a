use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::k8s::KubernetesError;

/// Build the client used to list and watch pods.
///
/// An explicit kubeconfig wins; otherwise the in-cluster service account is
/// used, falling back to `~/.kube/config`.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let config = match kubeconfig {
        Some(path) => load_kubeconfig(&path).await?,
        None => Config::infer()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "no in-cluster or local kubeconfig found for the pod watcher".to_string(),
            })?,
    };

    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create pod watcher client".to_string(),
    })
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Report<KubernetesError>> {
    let invalid = || KubernetesError::InvalidKubeconfig {
        path: path.to_path_buf(),
    };

    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(invalid)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreadable_kubeconfig_is_reported_with_path() {
        let path = PathBuf::from("/nonexistent/policy-agent/kubeconfig");

        let err = init_kube_client(Some(path.clone())).await.err().unwrap();

        match err.current_context() {
            KubernetesError::InvalidKubeconfig { path: reported } => assert_eq!(reported, &path),
            other => panic!("unexpected error: {other}"),
        }
    }
}

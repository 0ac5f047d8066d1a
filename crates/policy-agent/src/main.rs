use anyhow::Result;
use clap::Parser;
use policy_agent::config::Cli;
use policy_agent::config::Commands;
use policy_agent::config::DaemonArgs;
use policy_agent::datastore::EtcdDatastore;
use policy_agent::k8s::kube_client;
use policy_agent::k8s::PodWatcher;
use policy_agent::PodHandler;
use tokio_util::sync::CancellationToken;
use utils::logging;
use utils::version;

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup_panic_hook();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    logging::init();

    tracing::info!("Starting policy agent {}", &**version::VERSION);

    let etcd_config = daemon_args.etcd.to_config();
    tracing::info!(endpoints = ?etcd_config.endpoints, "Using etcd datastore");
    let datastore = EtcdDatastore::new(etcd_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize etcd datastore: {e:?}"))?;

    let client = kube_client::init_kube_client(daemon_args.kubeconfig)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;

    let cancellation_token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancellation_token.clone()));

    let mut watcher = PodWatcher::new(
        client,
        daemon_args.k8s_namespace,
        PodHandler::new(datastore),
    );
    watcher
        .run(cancellation_token)
        .await
        .map_err(|e| anyhow::anyhow!("Pod watcher failed: {e:?}"))?;

    tracing::info!("Policy agent stopped");
    Ok(())
}

async fn shutdown_on_signal(cancellation_token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("Shutdown signal received");
    cancellation_token.cancel();
}

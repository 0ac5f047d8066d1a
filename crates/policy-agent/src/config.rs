use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::datastore::EtcdConfig;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync pod labels into workload endpoints
    Daemon(Box<DaemonArgs>),
}

#[derive(Parser)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        help = "Kubernetes namespace to watch (empty for all namespaces)"
    )]
    pub k8s_namespace: Option<String>,

    #[command(flatten)]
    pub etcd: EtcdArgs,
}

#[derive(Parser)]
pub struct EtcdArgs {
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        help = "Comma separated etcd URLs, e.g. https://10.0.0.1:2379,https://10.0.0.2:2379; takes precedence over scheme and authority"
    )]
    pub etcd_endpoints: Option<String>,

    #[arg(long, env = "ETCD_SCHEME", default_value = "http")]
    pub etcd_scheme: String,

    #[arg(long, env = "ETCD_AUTHORITY", default_value = "127.0.0.1:2379")]
    pub etcd_authority: String,

    #[arg(
        long,
        env = "ETCD_CA_CERT_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "CA certificate used to verify etcd"
    )]
    pub etcd_ca_cert_file: Option<PathBuf>,

    #[arg(
        long,
        env = "ETCD_CERT_FILE",
        value_hint = clap::ValueHint::FilePath,
        requires = "etcd_key_file",
        help = "Client certificate presented to etcd"
    )]
    pub etcd_cert_file: Option<PathBuf>,

    #[arg(
        long,
        env = "ETCD_KEY_FILE",
        value_hint = clap::ValueHint::FilePath,
        requires = "etcd_cert_file",
        help = "Private key of the etcd client certificate"
    )]
    pub etcd_key_file: Option<PathBuf>,

    #[arg(long, default_value = "10", help = "Timeout of a single etcd request in seconds")]
    pub etcd_timeout_secs: u64,
}

impl EtcdArgs {
    pub fn endpoints(&self) -> Vec<String> {
        match &self.etcd_endpoints {
            Some(endpoints) => endpoints
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![format!("{}://{}", self.etcd_scheme, self.etcd_authority)],
        }
    }

    pub fn to_config(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.endpoints(),
            timeout: Duration::from_secs(self.etcd_timeout_secs),
            ca_cert_file: self.etcd_ca_cert_file.clone(),
            cert_file: self.etcd_cert_file.clone(),
            key_file: self.etcd_key_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> DaemonArgs {
        let cli = Cli::try_parse_from(["policy-agent", "daemon"].iter().chain(args)).unwrap();
        match cli.command {
            Commands::Daemon(args) => *args,
        }
    }

    #[test]
    fn default_etcd_endpoint_from_scheme_and_authority() {
        let args = parse(&["--etcd-scheme", "https", "--etcd-authority", "etcd:2379"]);

        assert_eq!(args.etcd.endpoints(), vec!["https://etcd:2379"]);
    }

    #[test]
    fn endpoint_list_takes_precedence() {
        let args = parse(&[
            "--etcd-endpoints",
            "http://10.0.0.1:2379, http://10.0.0.2:2379,",
            "--etcd-timeout-secs",
            "3",
        ]);

        let config = args.etcd.to_config();
        assert_eq!(
            config.endpoints,
            vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        );
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn client_certificate_requires_key() {
        let result = Cli::try_parse_from([
            "policy-agent",
            "daemon",
            "--etcd-cert-file",
            "/etc/etcd/client.pem",
        ]);

        assert!(result.is_err());
    }
}

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use es_keystore_k8s::{controller, Error};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch Elasticsearch clusters in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Resync interval of converged clusters, in seconds
    #[arg(long, env = "REQUEUE_SECS", default_value_t = 300)]
    requeue_secs: u64,

    /// Timeout of each Elasticsearch API call, in seconds
    #[arg(long, env = "ES_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    es_request_timeout_secs: u64,

    /// Skip verification of the Elasticsearch HTTP certificate
    #[arg(long, env = "INSECURE_SKIP_TLS_VERIFY")]
    insecure_skip_tls_verify: bool,
}

impl RunArgs {
    fn operator_config(&self) -> controller::OperatorConfig {
        controller::OperatorConfig {
            namespace: self.namespace.clone(),
            requeue_interval: Duration::from_secs(self.requeue_secs),
            es_request_timeout: Duration::from_secs(self.es_request_timeout_secs),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("es-keystore-k8s v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!(
        "Starting Elasticsearch keystore operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let config = args.operator_config();
    let lease_namespace = std::env::var("POD_NAMESPACE")
        .ok()
        .or_else(|| config.namespace.clone())
        .unwrap_or_else(|| "default".to_string());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    let state = Arc::new(controller::ControllerState::new(
        client.clone(),
        config,
        Arc::clone(&is_leader),
    ));

    {
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            controller::run_leader_election(
                client,
                &lease_namespace,
                &holder_identity,
                is_leader,
                shutdown,
            )
            .await;
        });
    }

    controller::run_controller(state).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_defaults() {
        let args = Args::try_parse_from(["keystore-operator", "run"]).unwrap();
        let Commands::Run(run) = args.command else {
            panic!("expected run");
        };
        let config = run.operator_config();
        assert_eq!(config.requeue_interval, Duration::from_secs(300));
        assert_eq!(config.es_request_timeout, Duration::from_secs(30));
        assert!(config.namespace.is_none());
    }

    #[test]
    fn test_run_args_flags() {
        let args = Args::try_parse_from([
            "keystore-operator",
            "run",
            "--namespace",
            "elastic",
            "--requeue-secs",
            "60",
            "--insecure-skip-tls-verify",
        ])
        .unwrap();
        let Commands::Run(run) = args.command else {
            panic!("expected run");
        };
        let config = run.operator_config();
        assert_eq!(config.namespace.as_deref(), Some("elastic"));
        assert_eq!(config.requeue_interval, Duration::from_secs(60));
        assert!(config.insecure_skip_tls_verify);
    }
}

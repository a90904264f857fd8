//! KVM Kubernetes Operator
//!
//! This operator manages KvmCluster custom resources, provisioning guest
//! Kubernetes clusters whose nodes run as virtual machines inside pods of
//! the host cluster.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use kvm_operator::config::{ManifestConfig, OperatorConfig};
use kvm_operator::framework::metrics::MetricsRegistry;
use kvm_operator::framework::retry::RetryConfig;
use kvm_operator::health::{self, Readiness};
use kvm_operator::{controller, crd, pod_controller};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// KVM Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "kvm-operator")]
#[command(about = "Kubernetes operator provisioning KVM based guest clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch for KvmClusters (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Seconds between resyncs of a healthy cluster
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value_t = kvm_operator::config::DEFAULT_RESYNC_SECONDS)]
    resync_period_secs: u64,

    /// Retries of a failing resource phase before the pass is aborted
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Image of the container running the node VMs
    #[arg(long, env = "KVM_IMAGE")]
    kvm_image: Option<String>,

    /// Base domain of guest API and etcd ingresses
    #[arg(long, env = "INGRESS_DOMAIN")]
    ingress_domain: Option<String>,

    /// Storage class of master etcd volumes
    #[arg(long, env = "STORAGE_CLASS")]
    storage_class: Option<String>,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let defaults = ManifestConfig::default();
        OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            resync_period: Duration::from_secs(self.resync_period_secs),
            retry: RetryConfig::default().with_max_retries(self.max_retries),
            manifests: ManifestConfig {
                kvm_image: self.kvm_image.clone().unwrap_or(defaults.kvm_image),
                ingress_domain: self.ingress_domain.clone().unwrap_or(defaults.ingress_domain),
                storage_class: self.storage_class.clone(),
                ..defaults
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", crd::crd_manifest()?);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    config.validate().context("Invalid operator configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        resync_secs = config.resync_period.as_secs(),
        max_retries = config.retry.max_retries,
        kvm_image = %config.manifests.kvm_image,
        ingress_domain = %config.manifests.ingress_domain,
        "Starting KVM Kubernetes Operator"
    );

    let registry = Arc::new(MetricsRegistry::default());
    install_metrics_exporter(args.metrics_addr, &registry)?;

    let readiness = Arc::new(Readiness::new(&[
        controller::CONTROLLER_NAME,
        pod_controller::CONTROLLER_NAME,
    ]));
    let health_addr = args.health_addr;
    let probes = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_addr, probes).await {
            error!(address = %health_addr, error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    tokio::select! {
        result = controller::run_controller(
            client.clone(),
            config.clone(),
            registry.clone(),
            readiness.clone(),
        ) => {
            result.context("KvmCluster controller failed")?;
        }
        result = pod_controller::run_pod_controller(client, config, registry, readiness) => {
            result.context("Pod controller failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise this crate logs at `--log-level` and the
/// kube watchers only report warnings
fn init_logging(args: &Args) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = args.log_level.as_str().to_lowercase();
            EnvFilter::try_new(format!("warn,kvm_operator={level}"))
                .context("Invalid log level")?
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if args.log_json {
        builder.json().flatten_event(true).with_current_span(true).init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

/// Serves `/metrics` on `addr` from a background task of the exporter
fn install_metrics_exporter(addr: SocketAddr, registry: &MetricsRegistry) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", addr))?;
    registry.describe();

    info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

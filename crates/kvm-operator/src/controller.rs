//! KvmCluster Controller
//!
//! Watches KvmCluster custom resources and runs a reconciliation pass for
//! every event and periodic resync. Deletions are observed through the
//! operator finalizer and run the same resource list in delete mode before
//! the finalizer is released.

use crate::config::OperatorConfig;
use crate::crd::{KvmCluster, KvmClusterStatus};
use crate::error::{OperatorError, Result};
use crate::framework::metrics::MetricsRegistry;
use crate::framework::{Framework, PassOutcome, ReconcileEvent, ResourceRouter};
use crate::health::Readiness;
use crate::key;
use crate::resources::{self, Stores};
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Label of this controller's metrics and readiness
pub const CONTROLLER_NAME: &str = "kvmcluster";

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "provider.giantswarm.io/kvm-cluster-finalizer";

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Routed resource pipeline
    pub framework: Framework<KvmCluster>,
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for a controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create metrics labelled with the watched kind
    pub fn new(controller: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!(
                "kvm_operator_reconciliations_total",
                "controller" => controller
            ),
            errors: metrics::counter!(
                "kvm_operator_reconciliation_errors_total",
                "controller" => controller
            ),
            duration: metrics::histogram!(
                "kvm_operator_reconciliation_duration_seconds",
                "controller" => controller
            ),
        }
    }
}

/// Start the KvmCluster controller
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    registry: Arc<MetricsRegistry>,
    readiness: Arc<Readiness>,
) -> Result<()> {
    let stores = Stores::kube(client.clone());
    let table = resources::versioned_resources(&stores, &config, &registry)?;
    let router = ResourceRouter::new(table);

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        versions = ?router.versions(),
        "Starting KvmCluster controller"
    );

    let clusters: Api<KvmCluster> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext {
        client,
        framework: Framework::new(Arc::new(router)),
        config,
        metrics: Some(ControllerMetrics::new(CONTROLLER_NAME)),
        error_counts: dashmap::DashMap::new(),
    });

    readiness.set_running(CONTROLLER_NAME, true);
    Controller::new(clusters, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;
    readiness.set_running(CONTROLLER_NAME, false);
    warn!("KvmCluster controller stream ended");

    Ok(())
}

/// Unwraps the pass error so the error policy can classify it
pub(crate) fn from_finalizer_error(err: finalizer::Error<OperatorError>) -> OperatorError {
    match err {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        other => OperatorError::ReconcileFailed(other.to_string()),
    }
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<KvmCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let error_key = format!("{}/{}", namespace, cluster.name_any());
    let clusters: Api<KvmCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&clusters, FINALIZER_NAME, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => apply_cluster(cluster, ctx.clone()).await,
            FinalizerEvent::Cleanup(cluster) => cleanup_cluster(cluster, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&error_key);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        from_finalizer_error(e)
    })
}

/// Validates the cluster definition, flattening nested field errors into one message
pub(crate) fn validate_cluster(cluster: &KvmCluster) -> Result<()> {
    cluster.spec.validate().map_err(|errors| {
        let error_msg = errors.to_string().replace('\n', "; ");
        warn!(
            name = %cluster.name_any(),
            errors = %error_msg,
            "Cluster spec validation failed"
        );
        OperatorError::ValidationError(error_msg)
    })
}

/// Status after a completed apply pass
pub(crate) fn build_status(cluster: &KvmCluster) -> KvmClusterStatus {
    KvmClusterStatus {
        observed_generation: cluster.metadata.generation.unwrap_or(0),
        applied_version_bundle: Some(key::version_bundle_version(cluster).to_string()),
        last_reconciled: Some(Utc::now().to_rfc3339()),
    }
}

/// Apply (create/update) the cluster resources
#[instrument(skip(cluster, ctx))]
async fn apply_cluster(cluster: Arc<KvmCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    info!(
        name = %name,
        cluster_id = key::cluster_id(&cluster),
        version = key::version_bundle_version(&cluster),
        "Reconciling KvmCluster"
    );

    validate_cluster(&cluster)?;

    match ctx
        .framework
        .reconcile(cluster.as_ref(), ReconcileEvent::Apply)
        .await?
    {
        PassOutcome::Completed => {
            update_status(&ctx.client, &namespace, &name, build_status(&cluster)).await?;
            info!(name = %name, "Reconciliation complete");
        }
        PassOutcome::Cancelled { resource } => {
            info!(name = %name, resource, "Reconciliation stopped early");
        }
    }

    Ok(Action::requeue(ctx.config.resync_period))
}

/// Tear down the cluster resources when the KvmCluster is deleted
#[instrument(skip(cluster, ctx))]
async fn cleanup_cluster(cluster: Arc<KvmCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = cluster.name_any();

    info!(
        name = %name,
        cluster_id = key::cluster_id(&cluster),
        "Cleaning up KvmCluster resources"
    );

    ctx.framework
        .reconcile(cluster.as_ref(), ReconcileEvent::Delete)
        .await?;

    info!(name = %name, "Cleanup complete");

    Ok(Action::await_change())
}

/// Update the cluster status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: KvmClusterStatus,
) -> Result<()> {
    let api: Api<KvmCluster> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, version = ?status.applied_version_bundle, "Updating cluster status");

    let patch = serde_json::json!({
        "status": status
    });

    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Exponential backoff for the `retries`-th consecutive failure:
/// 30s, 60s, 120s, 240s, 480s, then capped at 600s
pub(crate) fn backoff_delay(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

/// Shared error policy: wait for a spec change on permanent errors,
/// back off exponentially on transient ones.
pub(crate) fn requeue_for(
    error_counts: &dashmap::DashMap<String, u32>,
    key: String,
    error: &OperatorError,
) -> Action {
    if !error.is_retryable() {
        error_counts.remove(&key);
        warn!(
            error = %error,
            "Reconciliation error for '{}' is not retryable, waiting for a change",
            key
        );
        return Action::await_change();
    }

    let retries = {
        let mut entry = error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = backoff_delay(retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

fn error_policy(cluster: Arc<KvmCluster>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = format!(
        "{}/{}",
        cluster.namespace().unwrap_or_else(|| "default".to_string()),
        cluster.name_any()
    );
    requeue_for(&ctx.error_counts, key, error)
}

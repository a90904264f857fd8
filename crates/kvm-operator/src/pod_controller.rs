//! Guest node pod controller
//!
//! Node pods live in the namespaces of their guest clusters, so this
//! controller always watches cluster wide, filtered by the node label
//! selector. It only acts on pods that are being deleted and still hold the
//! draining finalizer.

use crate::config::OperatorConfig;
use crate::controller::{requeue_for, ControllerMetrics};
use crate::error::Result;
use crate::framework::metrics::MetricsRegistry;
use crate::framework::{Framework, ReconcileEvent};
use crate::health::Readiness;
use crate::key::NODE_POD_SELECTOR;
use crate::resources::pod::has_draining_finalizer;
use crate::resources::{self, Stores};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Label of this controller's metrics and readiness
pub const CONTROLLER_NAME: &str = "pod";

pub struct PodControllerContext {
    pub framework: Framework<Pod>,
    pub metrics: Option<ControllerMetrics>,
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Start the guest node pod controller
pub async fn run_pod_controller(
    client: Client,
    config: OperatorConfig,
    registry: Arc<MetricsRegistry>,
    readiness: Arc<Readiness>,
) -> Result<()> {
    let stores = Stores::kube(client.clone());
    let handlers = resources::pod_resources(&stores, &config, &registry);

    let ctx = Arc::new(PodControllerContext {
        framework: Framework::new(Arc::new(handlers)),
        metrics: Some(ControllerMetrics::new(CONTROLLER_NAME)),
        error_counts: dashmap::DashMap::new(),
    });

    info!(selector = NODE_POD_SELECTOR, "Starting guest node pod controller");

    let pods: Api<Pod> = Api::all(client);
    readiness.set_running(CONTROLLER_NAME, true);
    Controller::new(pods, Config::default().labels(NODE_POD_SELECTOR))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Pod reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Pod reconciliation failed");
                }
            }
        })
        .await;
    readiness.set_running(CONTROLLER_NAME, false);
    warn!("Pod controller stream ended");

    Ok(())
}

/// Whether the pod is being deleted and waits for us
pub(crate) fn awaits_release(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some() && has_draining_finalizer(pod)
}

fn error_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

#[instrument(skip(pod, ctx), fields(name = %pod.name_any(), namespace = pod.namespace()))]
async fn reconcile(pod: Arc<Pod>, ctx: Arc<PodControllerContext>) -> Result<Action> {
    if !awaits_release(&pod) {
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = ctx
        .framework
        .reconcile(pod.as_ref(), ReconcileEvent::Delete)
        .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.errors.increment(1);
        }
    }

    result?;
    ctx.error_counts.remove(&error_key(&pod));
    Ok(Action::await_change())
}

fn error_policy(
    pod: Arc<Pod>,
    error: &crate::error::OperatorError,
    ctx: Arc<PodControllerContext>,
) -> Action {
    requeue_for(&ctx.error_counts, error_key(&pod), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DRAINING_NODES_FINALIZER;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(deleting: bool, finalizers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("worker-al9qy-w1-abcde".to_string()),
                namespace: Some("al9qy".to_string()),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_only_deleting_pods_with_finalizer_are_released() {
        assert!(awaits_release(&pod(true, &[DRAINING_NODES_FINALIZER])));
        assert!(!awaits_release(&pod(false, &[DRAINING_NODES_FINALIZER])));
        assert!(!awaits_release(&pod(true, &["example.com/other"])));
    }

    #[test]
    fn test_error_key() {
        assert_eq!(error_key(&pod(false, &[])), "al9qy/worker-al9qy-w1-abcde");
    }
}

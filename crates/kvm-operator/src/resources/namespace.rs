//! Cluster namespace
//!
//! First resource of every pass. A namespace that is already terminating
//! means the guest cluster is going away, so an apply pass stops here
//! instead of recreating objects inside it.

use super::{create_all, delete_all, get_existing};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, ReconcileEvent, Resource, ResourceKind};
use crate::key;
use crate::manifests::ManifestBuilder;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::info;

const TERMINATING: &str = "Terminating";

impl ManagedObject for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }

    fn is_modified(&self, _desired: &Self) -> bool {
        false
    }
}

fn is_terminating(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some(TERMINATING)
}

pub struct NamespaceResource {
    store: Arc<dyn ObjectStore<Namespace>>,
    manifests: Arc<ManifestConfig>,
}

impl NamespaceResource {
    pub fn new(store: Arc<dyn ObjectStore<Namespace>>, manifests: Arc<ManifestConfig>) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for NamespaceResource {
    type Object = Namespace;

    fn name(&self) -> &'static str {
        "namespace"
    }

    async fn get_current_state(
        &self,
        ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Namespace>> {
        let name = key::cluster_namespace(obj);
        let current = get_existing(self.store.as_ref(), None, &[name.clone()]).await?;

        if ctx.event() == ReconcileEvent::Apply && current.iter().any(is_terminating) {
            info!(namespace = %name, "Namespace is terminating, cancelling reconciliation");
            ctx.cancel();
        }

        Ok(current)
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Namespace>> {
        Ok(vec![ManifestBuilder::new(obj, &self.manifests)?.build_namespace()])
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Namespace],
    ) -> Result<()> {
        create_all(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Namespace],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        _change: &[Namespace],
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tests::test_cluster;
    use crate::framework::{Framework, Handler, PassOutcome, ResourceRouter};
    use crate::resources::tests::{test_config, Fixture};
    use crate::resources::versioned_resources;
    use crate::framework::metrics::MetricsRegistry;
    use k8s_openapi::api::core::v1::NamespaceStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn terminating(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NamespaceStatus {
                phase: Some(TERMINATING.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn resource(fixture: &Fixture) -> NamespaceResource {
        NamespaceResource::new(fixture.namespaces.clone(), Arc::new(ManifestConfig::default()))
    }

    #[tokio::test]
    async fn test_creates_cluster_namespace() {
        let fixture = Fixture::new();
        let ctx = ReconcileContext::new();

        resource(&fixture)
            .ensure_created(&ctx, &test_cluster("al9qy", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(fixture.namespaces.names(), vec!["al9qy"]);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_terminating_namespace_cancels_pass() {
        let fixture = Fixture::new();
        fixture.namespaces.insert(terminating("al9qy"));
        let ctx = ReconcileContext::new();

        resource(&fixture)
            .ensure_created(&ctx, &test_cluster("al9qy", "1.0.0"))
            .await
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_terminating_namespace_short_circuits_the_pipeline() {
        let fixture = Fixture::new();
        fixture.namespaces.insert(terminating("al9qy"));
        let registry = Arc::new(MetricsRegistry::default());
        let table = versioned_resources(&fixture.stores(), &test_config(), &registry).unwrap();
        let fw = Framework::new(Arc::new(ResourceRouter::new(table)));

        let outcome = fw
            .reconcile(&test_cluster("al9qy", "1.0.0"), ReconcileEvent::Apply)
            .await
            .unwrap();
        assert_eq!(outcome, PassOutcome::Cancelled { resource: "namespace" });
        assert_eq!(fixture.config_maps.len(), 0);
        assert_eq!(fixture.deployments.len(), 0);
    }

    #[tokio::test]
    async fn test_delete_pass_continues_past_terminating_namespace() {
        let fixture = Fixture::new();
        fixture.namespaces.insert(terminating("al9qy"));
        let ctx = ReconcileContext::for_event(ReconcileEvent::Delete);

        resource(&fixture)
            .ensure_deleted(&ctx, &test_cluster("al9qy", "1.0.0"))
            .await
            .unwrap();
        assert!(!ctx.is_cancelled());
        assert_eq!(fixture.namespaces.len(), 0);
    }
}

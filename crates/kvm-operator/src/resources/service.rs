//! `master` and `worker` services
//!
//! The API server allocates cluster IPs and node ports on create and rejects
//! updates that drop them, so updates merge the desired service into the
//! live one.

use super::{delete_all, get_existing, namespaced_api};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key::{self, MASTER_ID, WORKER_ID};
use crate::manifests::ManifestBuilder;
use crate::merge;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use std::sync::Arc;

impl ManagedObject for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, desired: &Self) -> bool {
        merge::needs_update(self, desired).unwrap_or(true)
    }
}

pub struct ServiceResource {
    store: Arc<dyn ObjectStore<Service>>,
    manifests: Arc<ManifestConfig>,
}

impl ServiceResource {
    pub fn new(store: Arc<dyn ObjectStore<Service>>, manifests: Arc<ManifestConfig>) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for ServiceResource {
    type Object = Service;

    fn name(&self) -> &'static str {
        "service"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Service>> {
        let namespace = key::cluster_namespace(obj);
        get_existing(
            self.store.as_ref(),
            Some(&namespace),
            &[MASTER_ID.to_string(), WORKER_ID.to_string()],
        )
        .await
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Service>> {
        Ok(ManifestBuilder::new(obj, &self.manifests)?.build_services())
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Service],
    ) -> Result<()> {
        merge::reconcile_resource_state(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Service],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Service],
    ) -> Result<()> {
        merge::reconcile_resource_state(self.store.as_ref(), change).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tests::test_cluster;
    use crate::framework::Handler;
    use crate::resources::tests::Fixture;
    use crate::store::memory::Op;
    use k8s_openapi::api::core::v1::ServicePort;

    fn resource(fixture: &Fixture) -> ServiceResource {
        ServiceResource::new(fixture.services.clone(), Arc::new(ManifestConfig::default()))
    }

    #[tokio::test]
    async fn test_update_keeps_cluster_ip() {
        let fixture = Fixture::new();
        let resource = resource(&fixture);
        let cluster = test_cluster("al9qy", "1.0.0");

        resource
            .ensure_created(&ReconcileContext::new(), &cluster)
            .await
            .unwrap();
        assert_eq!(fixture.services.names(), vec!["master", "worker"]);

        // Allocated by the API server, then somebody drops a port
        let mut live = fixture.services.stored(Some("al9qy"), "master").unwrap();
        let spec = live.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.96.0.42".to_string());
        spec.ports = Some(vec![ServicePort {
            name: Some("api".to_string()),
            port: 443,
            ..Default::default()
        }]);
        fixture.services.insert(live);

        // The snapshot still matches, drift alone is not an update trigger
        resource
            .ensure_created(&ReconcileContext::new(), &cluster)
            .await
            .unwrap();
        assert_eq!(fixture.services.calls(Op::Replace), 0);

        // A new desired port triggers the merge, which restores both ports
        let config = ManifestConfig::default();
        let mut desired = ManifestBuilder::new(&cluster, &config)
            .unwrap()
            .build_services();
        desired[0]
            .spec
            .as_mut()
            .unwrap()
            .ports
            .as_mut()
            .unwrap()
            .push(ServicePort {
                name: Some("metrics".to_string()),
                port: 9100,
                ..Default::default()
            });
        resource
            .apply_update_change(&ReconcileContext::new(), &cluster, &desired[..1])
            .await
            .unwrap();

        let merged = fixture.services.stored(Some("al9qy"), "master").unwrap();
        let spec = merged.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.42"));
        let ports: Vec<_> = spec.ports.unwrap().into_iter().filter_map(|p| p.name).collect();
        assert_eq!(ports, vec!["api", "etcd", "metrics"]);
    }

    #[tokio::test]
    async fn test_delete_removes_both_services() {
        let fixture = Fixture::new();
        let resource = resource(&fixture);
        let cluster = test_cluster("al9qy", "1.0.0");

        resource
            .ensure_created(&ReconcileContext::new(), &cluster)
            .await
            .unwrap();
        resource
            .ensure_deleted(&ReconcileContext::new(), &cluster)
            .await
            .unwrap();
        assert_eq!(fixture.services.len(), 0);
        assert_eq!(fixture.services.deletes().len(), 2);
    }
}

//! Service account the guest node pods run as

use super::{create_all, delete_all, get_existing, namespaced_api};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key;
use crate::manifests::ManifestBuilder;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{Api, Client};
use std::sync::Arc;

impl ManagedObject for ServiceAccount {
    const KIND: ResourceKind = ResourceKind::ServiceAccount;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, _desired: &Self) -> bool {
        false
    }
}

pub struct ServiceAccountResource {
    store: Arc<dyn ObjectStore<ServiceAccount>>,
    manifests: Arc<ManifestConfig>,
}

impl ServiceAccountResource {
    pub fn new(store: Arc<dyn ObjectStore<ServiceAccount>>, manifests: Arc<ManifestConfig>) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for ServiceAccountResource {
    type Object = ServiceAccount;

    fn name(&self) -> &'static str {
        "serviceaccount"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<ServiceAccount>> {
        let namespace = key::cluster_namespace(obj);
        get_existing(
            self.store.as_ref(),
            Some(&namespace),
            &[key::service_account_name(obj)],
        )
        .await
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<ServiceAccount>> {
        Ok(vec![ManifestBuilder::new(obj, &self.manifests)?.build_service_account()])
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ServiceAccount],
    ) -> Result<()> {
        create_all(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ServiceAccount],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        _change: &[ServiceAccount],
    ) -> Result<()> {
        Ok(())
    }
}

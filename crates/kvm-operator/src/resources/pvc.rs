//! Etcd volume claims of master nodes
//!
//! Claims are never updated in place; a claim only goes away together with
//! its master node or the whole cluster.

use super::{create_all, delete_all, namespaced_api};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key::{self, NodeRole};
use crate::manifests::ManifestBuilder;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Api, Client};
use std::sync::Arc;

impl ManagedObject for PersistentVolumeClaim {
    const KIND: ResourceKind = ResourceKind::PersistentVolumeClaim;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, _desired: &Self) -> bool {
        false
    }
}

pub struct PvcResource {
    store: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    manifests: Arc<ManifestConfig>,
}

impl PvcResource {
    pub fn new(
        store: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
        manifests: Arc<ManifestConfig>,
    ) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for PvcResource {
    type Object = PersistentVolumeClaim;

    fn name(&self) -> &'static str {
        "pvc"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let namespace = key::cluster_namespace(obj);
        let prefix = key::etcd_pvc_name(key::cluster_id(obj), "");
        let claims = self
            .store
            .list(Some(&namespace), &key::role_selector(obj, NodeRole::Master))
            .await?;

        Ok(claims
            .into_iter()
            .filter(|c| c.object_name().starts_with(&prefix))
            .collect())
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(ManifestBuilder::new(obj, &self.manifests)?.build_etcd_pvcs())
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[PersistentVolumeClaim],
    ) -> Result<()> {
        create_all(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[PersistentVolumeClaim],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        _change: &[PersistentVolumeClaim],
    ) -> Result<()> {
        Ok(())
    }
}

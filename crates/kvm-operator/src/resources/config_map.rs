//! Per node config maps carrying the cloud-config of each VM
//!
//! Replacing a config map does not restart the pod consuming it. Updated
//! names are recorded in the pass context so the deployment resource can
//! roll the matching node later in the same pass.

use super::{create_all, delete_all, namespaced_api, replace_all};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key::{self, MASTER_ID, WORKER_ID};
use crate::manifests::ManifestBuilder;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::sync::Arc;

impl ManagedObject for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, desired: &Self) -> bool {
        self.data != desired.data
    }
}

/// Selector for the node objects of one cluster
pub(crate) fn node_selector(cluster: &KvmCluster) -> String {
    format!(
        "{}={},{} in ({},{})",
        key::LABEL_CLUSTER,
        key::cluster_id(cluster),
        key::LABEL_APP,
        MASTER_ID,
        WORKER_ID
    )
}

pub struct ConfigMapResource {
    store: Arc<dyn ObjectStore<ConfigMap>>,
    manifests: Arc<ManifestConfig>,
}

impl ConfigMapResource {
    pub fn new(store: Arc<dyn ObjectStore<ConfigMap>>, manifests: Arc<ManifestConfig>) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for ConfigMapResource {
    type Object = ConfigMap;

    fn name(&self) -> &'static str {
        "configmap"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<ConfigMap>> {
        let namespace = key::cluster_namespace(obj);
        self.store.list(Some(&namespace), &node_selector(obj)).await
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<ConfigMap>> {
        ManifestBuilder::new(obj, &self.manifests)?.build_config_maps()
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ConfigMap],
    ) -> Result<()> {
        create_all(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ConfigMap],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ConfigMap],
    ) -> Result<()> {
        replace_all(self.store.as_ref(), change).await?;
        for config_map in change {
            ctx.record_updated_config_map(config_map.object_name());
        }
        Ok(())
    }
}

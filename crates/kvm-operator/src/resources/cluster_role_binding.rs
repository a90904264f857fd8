//! Cluster role bindings of the guest service account
//!
//! Cluster scoped. The API server rejects changes to `roleRef`, so a binding
//! whose role changed is recreated; a binding whose subjects changed is
//! replaced in place.

use super::{create_all, delete_all, get_existing, replace_all};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key;
use crate::manifests::ManifestBuilder;
use crate::store::{get_optional, ObjectStore};
use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::info;

impl ManagedObject for ClusterRoleBinding {
    const KIND: ResourceKind = ResourceKind::ClusterRoleBinding;

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }

    fn is_modified(&self, desired: &Self) -> bool {
        self.subjects != desired.subjects || self.role_ref != desired.role_ref
    }
}

pub struct ClusterRoleBindingResource {
    store: Arc<dyn ObjectStore<ClusterRoleBinding>>,
    manifests: Arc<ManifestConfig>,
}

impl ClusterRoleBindingResource {
    pub fn new(
        store: Arc<dyn ObjectStore<ClusterRoleBinding>>,
        manifests: Arc<ManifestConfig>,
    ) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for ClusterRoleBindingResource {
    type Object = ClusterRoleBinding;

    fn name(&self) -> &'static str {
        "clusterrolebinding"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<ClusterRoleBinding>> {
        let names = [
            key::cluster_role_binding_name(obj),
            key::cluster_role_binding_psp_name(obj),
        ];
        get_existing(self.store.as_ref(), None, &names).await
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<ClusterRoleBinding>> {
        Ok(ManifestBuilder::new(obj, &self.manifests)?.build_cluster_role_bindings())
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ClusterRoleBinding],
    ) -> Result<()> {
        create_all(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ClusterRoleBinding],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[ClusterRoleBinding],
    ) -> Result<()> {
        let mut in_place = Vec::new();
        for binding in change {
            let current = get_optional(self.store.as_ref(), None, binding.object_name()).await?;
            match current {
                Some(current) if current.role_ref != binding.role_ref => {
                    info!(
                        name = binding.object_name(),
                        from = %current.role_ref.name,
                        to = %binding.role_ref.name,
                        "Role of cluster role binding changed, recreating"
                    );
                    delete_all(self.store.as_ref(), std::slice::from_ref(&current), None).await?;
                    create_all(self.store.as_ref(), std::slice::from_ref(binding)).await?;
                }
                Some(_) => in_place.push(binding.clone()),
                None => create_all(self.store.as_ref(), std::slice::from_ref(binding)).await?,
            }
        }
        replace_all(self.store.as_ref(), &in_place).await
    }
}

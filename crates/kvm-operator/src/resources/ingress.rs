//! `etcd` and `api` ingresses of the guest masters
//!
//! Ingress controllers and admission webhooks add their own annotations and
//! status, so ingresses are written through the three-way merge in
//! [`crate::merge`] instead of being replaced wholesale.

use super::{delete_all, get_existing, namespaced_api};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::{ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key;
use crate::manifests::ManifestBuilder;
use crate::merge;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use std::sync::Arc;

const INGRESS_NAMES: [&str; 2] = ["etcd", "api"];

impl ManagedObject for Ingress {
    const KIND: ResourceKind = ResourceKind::Ingress;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, desired: &Self) -> bool {
        merge::needs_update(self, desired).unwrap_or(true)
    }
}

pub struct IngressResource {
    store: Arc<dyn ObjectStore<Ingress>>,
    manifests: Arc<ManifestConfig>,
}

impl IngressResource {
    pub fn new(store: Arc<dyn ObjectStore<Ingress>>, manifests: Arc<ManifestConfig>) -> Self {
        Self { store, manifests }
    }
}

#[async_trait]
impl Resource<KvmCluster> for IngressResource {
    type Object = Ingress;

    fn name(&self) -> &'static str {
        "ingress"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Ingress>> {
        let namespace = key::cluster_namespace(obj);
        let names: Vec<String> = INGRESS_NAMES.iter().map(|n| n.to_string()).collect();
        get_existing(self.store.as_ref(), Some(&namespace), &names).await
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Ingress>> {
        Ok(ManifestBuilder::new(obj, &self.manifests)?.build_ingresses())
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Ingress],
    ) -> Result<()> {
        merge::reconcile_resource_state(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Ingress],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Ingress],
    ) -> Result<()> {
        merge::reconcile_resource_state(self.store.as_ref(), change).await
    }
}

//! Per node deployments running the guest VMs
//!
//! Creates and scale-down deletes are applied right away. Updates replace a
//! node's VM, so they are rolled: nothing is updated while any node is still
//! coming up, and at most one node is updated per pass. The pod template
//! carries a checksum of the node's config map, so a cloud-config change
//! stays pending on every node until that node was rolled.

use super::config_map::node_selector;
use super::{create_all, delete_all, namespaced_api, replace_all};
use crate::config::ManifestConfig;
use crate::crd::KvmCluster;
use crate::diff;
use crate::error::Result;
use crate::framework::{ChangeSet, ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key::{self, CONFIG_CHECKSUM_ANNOTATION, VERSION_BUNDLE_ANNOTATION};
use crate::manifests::{EtcdStorage, ManifestBuilder};
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

fn version_of(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(VERSION_BUNDLE_ANNOTATION))
        .map(String::as_str)
}

fn config_checksum_of(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(CONFIG_CHECKSUM_ANNOTATION))
        .map(String::as_str)
}

fn replicas_of(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

fn containers_of(deployment: &Deployment) -> &[Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
}

/// Whether every desired replica is available
pub fn is_available(deployment: &Deployment) -> bool {
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    available >= replicas_of(deployment)
}

impl ManagedObject for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, desired: &Self) -> bool {
        if version_of(self) != version_of(desired)
            || replicas_of(self) != replicas_of(desired)
            || config_checksum_of(self) != config_checksum_of(desired)
        {
            return true;
        }

        let current: HashMap<&str, &Container> = containers_of(self)
            .iter()
            .map(|c| (c.name.as_str(), c))
            .collect();
        let wanted = containers_of(desired);

        current.len() != wanted.len()
            || wanted.iter().any(|w| match current.get(w.name.as_str()) {
                Some(c) => c.image != w.image || c.env != w.env,
                None => true,
            })
    }
}

pub struct DeploymentResource {
    store: Arc<dyn ObjectStore<Deployment>>,
    manifests: Arc<ManifestConfig>,
    etcd: EtcdStorage,
}

impl DeploymentResource {
    pub fn new(
        store: Arc<dyn ObjectStore<Deployment>>,
        manifests: Arc<ManifestConfig>,
        etcd: EtcdStorage,
    ) -> Self {
        Self {
            store,
            manifests,
            etcd,
        }
    }
}

#[async_trait]
impl Resource<KvmCluster> for DeploymentResource {
    type Object = Deployment;

    fn name(&self) -> &'static str {
        "deployment"
    }

    async fn get_current_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Deployment>> {
        let namespace = key::cluster_namespace(obj);
        self.store.list(Some(&namespace), &node_selector(obj)).await
    }

    async fn get_desired_state(
        &self,
        _ctx: &ReconcileContext,
        obj: &KvmCluster,
    ) -> Result<Vec<Deployment>> {
        ManifestBuilder::new(obj, &self.manifests)?.build_deployments(self.etcd)
    }

    async fn new_update_patch(
        &self,
        ctx: &ReconcileContext,
        _obj: &KvmCluster,
        current: &[Deployment],
        desired: &[Deployment],
    ) -> Result<ChangeSet<Deployment>> {
        let mut patch = ChangeSet {
            create: diff::create_change(current, desired),
            delete: diff::delete_change_for_update(current, desired),
            update: Vec::new(),
        };

        let mut candidates = diff::update_change(current, desired);
        // Config maps and deployments share names
        let existing: Vec<&str> = current.iter().map(|d| d.object_name()).collect();
        for deployment in desired {
            let name = deployment.object_name();
            if ctx.config_map_updated(name)
                && existing.contains(&name)
                && !candidates.iter().any(|c| c.object_name() == name)
            {
                candidates.push(deployment.clone());
            }
        }

        if candidates.is_empty() {
            return Ok(patch);
        }

        if let Some(pending) = current.iter().find(|d| !is_available(d)) {
            debug!(
                waiting_for = pending.object_name(),
                candidates = candidates.len(),
                "Deployment not available yet, postponing updates"
            );
            return Ok(patch);
        }

        patch.update = candidates.into_iter().take(1).collect();
        Ok(patch)
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Deployment],
    ) -> Result<()> {
        create_all(self.store.as_ref(), change).await
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Deployment],
    ) -> Result<()> {
        delete_all(self.store.as_ref(), change, None).await
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &KvmCluster,
        change: &[Deployment],
    ) -> Result<()> {
        for deployment in change {
            info!(
                name = deployment.object_name(),
                version = version_of(deployment).unwrap_or_default(),
                "Rolling guest node"
            );
        }
        replace_all(self.store.as_ref(), change).await
    }
}

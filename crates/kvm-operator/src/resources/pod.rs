//! Guest node pods
//!
//! Node pods are created by their deployments and carry the
//! `draining-nodes` finalizer. When such a pod is deleted, this resource
//! releases the finalizer and finishes the delete without a grace period.
//! Guest node draining itself is not orchestrated here.

use super::{delete_all, namespaced_api};
use crate::error::Result;
use crate::framework::{ChangeSet, ManagedObject, ReconcileContext, Resource, ResourceKind};
use crate::key::DRAINING_NODES_FINALIZER;
use crate::store::{get_optional, ObjectStore};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, info};

impl ManagedObject for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn is_modified(&self, _desired: &Self) -> bool {
        false
    }
}

/// Whether the pod still holds the draining finalizer
pub fn has_draining_finalizer(pod: &Pod) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == DRAINING_NODES_FINALIZER))
}

pub struct PodResource {
    store: Arc<dyn ObjectStore<Pod>>,
}

impl PodResource {
    pub fn new(store: Arc<dyn ObjectStore<Pod>>) -> Self {
        Self { store }
    }

    /// Returns false when the pod changed underneath us
    async fn release_finalizer(&self, pod: &Pod) -> Result<bool> {
        if !has_draining_finalizer(pod) {
            return Ok(true);
        }

        let mut released = pod.clone();
        if let Some(finalizers) = released.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != DRAINING_NODES_FINALIZER);
        }

        match self.store.replace(&released).await {
            Ok(_) => {
                debug!(pod = pod.object_name(), "Removed draining finalizer");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                info!(
                    pod = pod.object_name(),
                    "Pod changed while releasing finalizer, waiting for next event"
                );
                Ok(false)
            }
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Resource<Pod> for PodResource {
    type Object = Pod;

    fn name(&self) -> &'static str {
        "pod"
    }

    async fn get_current_state(&self, _ctx: &ReconcileContext, obj: &Pod) -> Result<Vec<Pod>> {
        let namespace = obj.metadata.namespace.as_deref();
        Ok(get_optional(self.store.as_ref(), namespace, obj.object_name())
            .await?
            .into_iter()
            .collect())
    }

    async fn get_desired_state(&self, _ctx: &ReconcileContext, obj: &Pod) -> Result<Vec<Pod>> {
        Ok(vec![obj.clone()])
    }

    async fn new_create_patch(
        &self,
        _ctx: &ReconcileContext,
        _obj: &Pod,
        _current: &[Pod],
        _desired: &[Pod],
    ) -> Result<ChangeSet<Pod>> {
        Ok(ChangeSet::default())
    }

    async fn new_update_patch(
        &self,
        _ctx: &ReconcileContext,
        _obj: &Pod,
        _current: &[Pod],
        _desired: &[Pod],
    ) -> Result<ChangeSet<Pod>> {
        Ok(ChangeSet::default())
    }

    async fn apply_create_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &Pod,
        _change: &[Pod],
    ) -> Result<()> {
        Ok(())
    }

    async fn apply_delete_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &Pod,
        change: &[Pod],
    ) -> Result<()> {
        for pod in change {
            if !self.release_finalizer(pod).await? {
                return Ok(());
            }
            delete_all(self.store.as_ref(), std::slice::from_ref(pod), Some(0)).await?;
        }
        Ok(())
    }

    async fn apply_update_change(
        &self,
        _ctx: &ReconcileContext,
        _obj: &Pod,
        _change: &[Pod],
    ) -> Result<()> {
        Ok(())
    }
}

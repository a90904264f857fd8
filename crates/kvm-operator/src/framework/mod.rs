//! Declarative reconciliation framework
//!
//! Every managed kind is reconciled through the same five phase contract:
//!
//! 1. read the current state from the API server
//! 2. compute the desired state from the custom object
//! 3. diff both into a [`ChangeSet`]
//! 4. apply creates, deletes and updates
//! 5. repeat on the next event or resync, from scratch
//!
//! A kind implements [`Resource`]. [`retry::RetryResource`] and
//! [`metrics::MetricsResource`] wrap a resource phase by phase, and the
//! blanket [`Handler`] implementation turns any wrapped resource into a step
//! of the ordered pipeline that [`pipeline::Framework`] runs for a pass.

pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod router;

use crate::crd::KvmCluster;
use crate::diff;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Resource as KubeResource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub use pipeline::{Framework, PassOutcome, ReconcileEvent, ResourceSet};
pub use router::{ResourceRouter, VersionedObject, VersionedResourceTable};

/// The kinds of child objects the operator manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Namespace,
    ServiceAccount,
    ClusterRoleBinding,
    ConfigMap,
    PersistentVolumeClaim,
    Deployment,
    Ingress,
    Service,
    Pod,
}

impl ResourceKind {
    /// Lowercase form used as metric label
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::ServiceAccount => "serviceaccount",
            ResourceKind::ClusterRoleBinding => "clusterrolebinding",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaim",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Ingress => "ingress",
            ResourceKind::Service => "service",
            ResourceKind::Pod => "pod",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Service => "Service",
            ResourceKind::Pod => "Pod",
        };
        f.write_str(kind)
    }
}

/// Identity of a managed object: (kind, namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Watched objects name the namespace their child objects live in. Metrics
/// are labelled with it and retry jitter is keyed by it.
pub trait ObjectScope {
    fn reconcile_scope(&self) -> String;
}

impl ObjectScope for KvmCluster {
    fn reconcile_scope(&self) -> String {
        crate::key::cluster_namespace(self)
    }
}

impl ObjectScope for Pod {
    fn reconcile_scope(&self) -> String {
        self.namespace().unwrap_or_default()
    }
}

/// A Kubernetes object type one [`Resource`] owns.
pub trait ManagedObject:
    KubeResource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: ResourceKind;

    /// Api handle scoped to `namespace`; cluster scoped kinds ignore it.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    /// Whether `desired` carries a payload the live object does not have yet.
    fn is_modified(&self, desired: &Self) -> bool;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey {
            kind: Self::KIND,
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    fn object_name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

/// Output of a diff between current and desired state.
///
/// An object identity appears in at most one of the three collections.
/// `update` holds the replacement objects built from desired state.
#[derive(Debug, Clone)]
pub struct ChangeSet<K> {
    pub create: Vec<K>,
    pub delete: Vec<K>,
    pub update: Vec<K>,
}

impl<K> Default for ChangeSet<K> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            delete: Vec::new(),
            update: Vec::new(),
        }
    }
}

impl<K> ChangeSet<K> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty() && self.update.is_empty()
    }
}

/// The phases of a reconciliation step, used in logs, metrics and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CurrentState,
    DesiredState,
    CreatePatch,
    UpdatePatch,
    DeletePatch,
    ApplyCreate,
    ApplyDelete,
    ApplyUpdate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::CurrentState => "current_state",
            Phase::DesiredState => "desired_state",
            Phase::CreatePatch => "create_patch",
            Phase::UpdatePatch => "update_patch",
            Phase::DeletePatch => "delete_patch",
            Phase::ApplyCreate => "apply_create",
            Phase::ApplyDelete => "apply_delete",
            Phase::ApplyUpdate => "apply_update",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by every step of a single reconciliation pass.
///
/// Created fresh for each pass and dropped at its end; nothing in here
/// survives into the next pass.
#[derive(Debug, Default)]
pub struct ReconcileContext {
    event: ReconcileEvent,
    cancelled: AtomicBool,
    updated_config_maps: Mutex<BTreeSet<String>>,
}

impl ReconcileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_event(event: ReconcileEvent) -> Self {
        Self {
            event,
            ..Self::default()
        }
    }

    /// The event that started this pass
    pub fn event(&self) -> ReconcileEvent {
        self.event
    }

    /// Stops the pass before its next phase. Not an error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Records a config map whose data was replaced during this pass
    pub fn record_updated_config_map(&self, name: impl Into<String>) {
        self.updated_config_maps.lock().insert(name.into());
    }

    pub fn config_map_updated(&self, name: &str) -> bool {
        self.updated_config_maps.lock().contains(name)
    }

    pub fn updated_config_maps(&self) -> Vec<String> {
        self.updated_config_maps.lock().iter().cloned().collect()
    }
}

/// Reconciliation contract for one managed kind.
///
/// `T` is the watched object the state is derived from. Reads and diffs are
/// free of side effects; only the `apply_*` methods talk to the API server,
/// and they treat `AlreadyExists` on create and `NotFound` on delete as
/// success.
#[async_trait]
pub trait Resource<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    type Object: ManagedObject;

    /// Stable identifier used for metrics and logging
    fn name(&self) -> &'static str;

    async fn get_current_state(&self, ctx: &ReconcileContext, obj: &T)
        -> Result<Vec<Self::Object>>;

    async fn get_desired_state(&self, ctx: &ReconcileContext, obj: &T)
        -> Result<Vec<Self::Object>>;

    /// Objects that have to be created
    async fn new_create_patch(
        &self,
        _ctx: &ReconcileContext,
        _obj: &T,
        current: &[Self::Object],
        desired: &[Self::Object],
    ) -> Result<ChangeSet<Self::Object>> {
        Ok(ChangeSet {
            create: diff::create_change(current, desired),
            ..Default::default()
        })
    }

    /// Creates, scale-down deletes and payload updates
    async fn new_update_patch(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        current: &[Self::Object],
        desired: &[Self::Object],
    ) -> Result<ChangeSet<Self::Object>> {
        let mut patch = self.new_create_patch(ctx, obj, current, desired).await?;
        patch.delete = diff::delete_change_for_update(current, desired);
        patch.update = diff::update_change(current, desired);
        Ok(patch)
    }

    /// Teardown of everything that still exists
    async fn new_delete_patch(
        &self,
        _ctx: &ReconcileContext,
        _obj: &T,
        current: &[Self::Object],
        desired: &[Self::Object],
    ) -> Result<ChangeSet<Self::Object>> {
        Ok(ChangeSet {
            delete: diff::delete_change_for_delete(current, desired),
            ..Default::default()
        })
    }

    async fn apply_create_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[Self::Object],
    ) -> Result<()>;

    async fn apply_delete_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[Self::Object],
    ) -> Result<()>;

    async fn apply_update_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[Self::Object],
    ) -> Result<()>;
}

/// Object safe view of a [`Resource`], as stored in a resource set.
#[async_trait]
pub trait Handler<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    fn resource_name(&self) -> &'static str;

    /// Converge towards the desired state: create, scale down, update.
    async fn ensure_created(&self, ctx: &ReconcileContext, obj: &T) -> Result<()>;

    /// Tear down whatever of the desired state still exists.
    async fn ensure_deleted(&self, ctx: &ReconcileContext, obj: &T) -> Result<()>;
}

fn in_phase(resource: &'static str, phase: Phase) -> impl FnOnce(OperatorError) -> OperatorError {
    move |source| OperatorError::Resource {
        resource,
        phase,
        source: Box::new(source),
    }
}

macro_rules! stop_if_cancelled {
    ($ctx:expr, $name:expr, $phase:expr) => {
        if $ctx.is_cancelled() {
            debug!(resource = $name, phase = %$phase, "Pass cancelled");
            return Ok(());
        }
    };
}

#[async_trait]
impl<T, R> Handler<T> for R
where
    T: Send + Sync + 'static,
    R: Resource<T>,
{
    fn resource_name(&self) -> &'static str {
        <R as Resource<T>>::name(self)
    }

    async fn ensure_created(&self, ctx: &ReconcileContext, obj: &T) -> Result<()> {
        let name = <R as Resource<T>>::name(self);

        let current = self
            .get_current_state(ctx, obj)
            .await
            .map_err(in_phase(name, Phase::CurrentState))?;
        stop_if_cancelled!(ctx, name, Phase::CurrentState);

        let desired = self
            .get_desired_state(ctx, obj)
            .await
            .map_err(in_phase(name, Phase::DesiredState))?;
        stop_if_cancelled!(ctx, name, Phase::DesiredState);

        let patch = self
            .new_update_patch(ctx, obj, &current, &desired)
            .await
            .map_err(in_phase(name, Phase::UpdatePatch))?;
        stop_if_cancelled!(ctx, name, Phase::UpdatePatch);

        debug!(
            resource = name,
            create = patch.create.len(),
            delete = patch.delete.len(),
            update = patch.update.len(),
            "Computed update patch"
        );

        if !patch.create.is_empty() {
            self.apply_create_change(ctx, obj, &patch.create)
                .await
                .map_err(in_phase(name, Phase::ApplyCreate))?;
            stop_if_cancelled!(ctx, name, Phase::ApplyCreate);
        }

        if !patch.delete.is_empty() {
            self.apply_delete_change(ctx, obj, &patch.delete)
                .await
                .map_err(in_phase(name, Phase::ApplyDelete))?;
            stop_if_cancelled!(ctx, name, Phase::ApplyDelete);
        }

        if !patch.update.is_empty() {
            self.apply_update_change(ctx, obj, &patch.update)
                .await
                .map_err(in_phase(name, Phase::ApplyUpdate))?;
        }

        Ok(())
    }

    async fn ensure_deleted(&self, ctx: &ReconcileContext, obj: &T) -> Result<()> {
        let name = <R as Resource<T>>::name(self);

        let current = self
            .get_current_state(ctx, obj)
            .await
            .map_err(in_phase(name, Phase::CurrentState))?;
        stop_if_cancelled!(ctx, name, Phase::CurrentState);

        let desired = self
            .get_desired_state(ctx, obj)
            .await
            .map_err(in_phase(name, Phase::DesiredState))?;
        stop_if_cancelled!(ctx, name, Phase::DesiredState);

        let patch = self
            .new_delete_patch(ctx, obj, &current, &desired)
            .await
            .map_err(in_phase(name, Phase::DeletePatch))?;
        stop_if_cancelled!(ctx, name, Phase::DeletePatch);

        if !patch.delete.is_empty() {
            debug!(resource = name, delete = patch.delete.len(), "Computed delete patch");
            self.apply_delete_change(ctx, obj, &patch.delete)
                .await
                .map_err(in_phase(name, Phase::ApplyDelete))?;
        }

        Ok(())
    }
}

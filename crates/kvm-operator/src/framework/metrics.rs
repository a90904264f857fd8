//! Metrics decorator for resources
//!
//! Records per resource action counts and durations, phase errors and the
//! number of live objects per version bundle version. Version counts are
//! kept per kind and namespace so that gauges of versions which disappeared
//! drop back to zero instead of going stale.

use super::{ChangeSet, ManagedObject, ObjectScope, Phase, ReconcileContext, Resource};
use crate::error::Result;
use crate::key::{parse_version, VERSION_BUNDLE_ANNOTATION};
use async_trait::async_trait;
use kube::Resource as _;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Default metric name prefix
pub const METRICS_PREFIX: &str = "kvm_operator";

type Version = (u64, u64, u64);

/// Operator wide metric handles shared by every wrapped resource
#[derive(Debug)]
pub struct MetricsRegistry {
    prefix: String,
    versions: Mutex<BTreeMap<(String, String), BTreeMap<Version, u64>>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(METRICS_PREFIX)
    }
}

impl MetricsRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    fn metric(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    /// Registers help texts with the installed recorder
    pub fn describe(&self) {
        metrics::describe_counter!(
            self.metric("reconciliations_total"),
            "Reconciliation passes started per controller"
        );
        metrics::describe_counter!(
            self.metric("reconciliation_errors_total"),
            "Reconciliation passes that failed per controller"
        );
        metrics::describe_histogram!(
            self.metric("reconciliation_duration_seconds"),
            metrics::Unit::Seconds,
            "Duration of a reconciliation pass"
        );
        metrics::describe_counter!(
            self.metric("resource_action_total"),
            "Creates, updates and deletes per namespace and kind"
        );
        metrics::describe_gauge!(
            self.metric("resource_action_milliseconds"),
            metrics::Unit::Milliseconds,
            "Duration of the last create, update or delete"
        );
        metrics::describe_counter!(
            self.metric("resource_error_total"),
            "Failed resource phases per kind"
        );
        metrics::describe_gauge!(
            self.metric("version_bundle_version_total"),
            "Live objects per kind and version bundle version"
        );
    }

    /// Counts and times one create, update or delete action
    pub fn record_action(
        &self,
        namespace: &str,
        kind: &str,
        action: &'static str,
        elapsed: std::time::Duration,
    ) {
        let labels = [
            ("namespace", namespace.to_string()),
            ("kind", kind.to_string()),
            ("action", action.to_string()),
        ];
        metrics::counter!(self.metric("resource_action_total"), &labels).increment(1);
        metrics::gauge!(self.metric("resource_action_milliseconds"), &labels)
            .set(elapsed.as_secs_f64() * 1000.0);
    }

    /// Counts a failed phase
    pub fn record_error(&self, kind: &str, phase: Phase) {
        metrics::counter!(
            self.metric("resource_error_total"),
            "kind" => kind.to_string(),
            "phase" => phase.as_str()
        )
        .increment(1);
    }

    /// Updates the per version gauges from the live objects of one kind.
    ///
    /// Returns the counts that were set, versions that vanished included.
    pub fn observe_versions<K: ManagedObject>(
        &self,
        kind: &str,
        namespace: &str,
        objects: &[K],
    ) -> BTreeMap<Version, u64> {
        let mut counts: BTreeMap<Version, u64> = BTreeMap::new();
        for obj in objects {
            let version = obj
                .meta()
                .annotations
                .as_ref()
                .and_then(|a| a.get(VERSION_BUNDLE_ANNOTATION))
                .and_then(|v| parse_version(v));
            if let Some(version) = version {
                *counts.entry(version).or_default() += 1;
            }
        }

        let scope = (kind.to_string(), namespace.to_string());
        let previous = {
            let mut versions = self.versions.lock();
            let replaced = if counts.is_empty() {
                versions.remove(&scope)
            } else {
                versions.insert(scope, counts)
            };
            replaced.unwrap_or_default()
        };

        let mut totals = self.version_totals(kind);
        for version in previous.keys() {
            totals.entry(*version).or_default();
        }

        for ((major, minor, patch), count) in &totals {
            metrics::gauge!(
                self.metric("version_bundle_version_total"),
                "kind" => kind.to_string(),
                "major" => major.to_string(),
                "minor" => minor.to_string(),
                "patch" => patch.to_string()
            )
            .set(*count as f64);
        }

        totals
    }

    /// Live objects per version over every namespace of one kind
    pub fn version_totals(&self, kind: &str) -> BTreeMap<Version, u64> {
        let mut totals: BTreeMap<Version, u64> = BTreeMap::new();
        for ((k, _), per_ns) in self.versions.lock().iter() {
            if k != kind {
                continue;
            }
            for (version, count) in per_ns {
                *totals.entry(*version).or_default() += count;
            }
        }
        totals
    }
}

/// Wraps a [`Resource`] and records metrics for it
pub struct MetricsResource<R> {
    inner: R,
    registry: Arc<MetricsRegistry>,
}

impl<R> MetricsResource<R> {
    pub fn new(inner: R, registry: Arc<MetricsRegistry>) -> Self {
        Self { inner, registry }
    }

    async fn observe<T, F>(&self, kind: &str, phase: Phase, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = fut.await;
        if result.is_err() {
            self.registry.record_error(kind, phase);
        }
        result
    }

    async fn timed<F>(
        &self,
        namespace: &str,
        kind: &str,
        action: &'static str,
        phase: Phase,
        fut: F,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let start = Instant::now();
        let result = self.observe(kind, phase, fut).await;
        self.registry
            .record_action(namespace, kind, action, start.elapsed());
        result
    }
}

#[async_trait]
impl<T, R> Resource<T> for MetricsResource<R>
where
    T: ObjectScope + Send + Sync + 'static,
    R: Resource<T>,
{
    type Object = R::Object;

    fn name(&self) -> &'static str {
        <R as Resource<T>>::name(&self.inner)
    }

    async fn get_current_state(&self, ctx: &ReconcileContext, obj: &T) -> Result<Vec<R::Object>> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        let current = self
            .observe(kind, Phase::CurrentState, self.inner.get_current_state(ctx, obj))
            .await?;
        // Also with nothing left, so gauges of removed objects drop to zero
        let namespace = obj.reconcile_scope();
        let totals = self.registry.observe_versions(kind, &namespace, &current);
        trace!(kind, namespace = %namespace, versions = totals.len(), "Observed versions");
        Ok(current)
    }

    async fn get_desired_state(&self, ctx: &ReconcileContext, obj: &T) -> Result<Vec<R::Object>> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        self.observe(kind, Phase::DesiredState, self.inner.get_desired_state(ctx, obj))
            .await
    }

    async fn new_create_patch(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        current: &[R::Object],
        desired: &[R::Object],
    ) -> Result<ChangeSet<R::Object>> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        self.observe(
            kind,
            Phase::CreatePatch,
            self.inner.new_create_patch(ctx, obj, current, desired),
        )
        .await
    }

    async fn new_update_patch(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        current: &[R::Object],
        desired: &[R::Object],
    ) -> Result<ChangeSet<R::Object>> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        self.observe(
            kind,
            Phase::UpdatePatch,
            self.inner.new_update_patch(ctx, obj, current, desired),
        )
        .await
    }

    async fn new_delete_patch(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        current: &[R::Object],
        desired: &[R::Object],
    ) -> Result<ChangeSet<R::Object>> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        self.observe(
            kind,
            Phase::DeletePatch,
            self.inner.new_delete_patch(ctx, obj, current, desired),
        )
        .await
    }

    async fn apply_create_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[R::Object],
    ) -> Result<()> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        let fut = self.inner.apply_create_change(ctx, obj, change);
        if change.is_empty() {
            return fut.await;
        }
        self.timed(&obj.reconcile_scope(), kind, "create", Phase::ApplyCreate, fut)
            .await
    }

    async fn apply_delete_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[R::Object],
    ) -> Result<()> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        let fut = self.inner.apply_delete_change(ctx, obj, change);
        if change.is_empty() {
            return fut.await;
        }
        self.timed(&obj.reconcile_scope(), kind, "delete", Phase::ApplyDelete, fut)
            .await
    }

    async fn apply_update_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[R::Object],
    ) -> Result<()> {
        let kind = <R::Object as ManagedObject>::KIND.label();
        let fut = self.inner.apply_update_change(ctx, obj, change);
        if change.is_empty() {
            return fut.await;
        }
        self.timed(&obj.reconcile_scope(), kind, "update", Phase::ApplyUpdate, fut)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn versioned(name: &str, namespace: &str, version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(
                    [(VERSION_BUNDLE_ANNOTATION.to_string(), version.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_version_counts_per_kind() {
        let registry = MetricsRegistry::default();

        let totals = registry.observe_versions(
            "configmap",
            "al9qy",
            &[
                versioned("a", "al9qy", "1.0.0"),
                versioned("b", "al9qy", "1.0.0"),
                versioned("c", "al9qy", "not-a-version"),
            ],
        );
        assert_eq!(totals.get(&(1, 0, 0)), Some(&2));
        assert_eq!(totals.len(), 1);

        let totals = registry.observe_versions(
            "configmap",
            "p2k1w",
            &[versioned("d", "p2k1w", "1.1.0")],
        );
        assert_eq!(totals.get(&(1, 0, 0)), Some(&2));
        assert_eq!(totals.get(&(1, 1, 0)), Some(&1));
    }

    #[test]
    fn test_vanished_versions_drop_to_zero() {
        let registry = MetricsRegistry::default();
        registry.observe_versions("deployment", "al9qy", &[versioned("a", "al9qy", "1.0.0")]);

        let totals =
            registry.observe_versions("deployment", "al9qy", &[versioned("a", "al9qy", "1.1.0")]);
        assert_eq!(totals.get(&(1, 0, 0)), Some(&0));
        assert_eq!(totals.get(&(1, 1, 0)), Some(&1));
    }

    #[test]
    fn test_empty_namespace_resets_its_counts() {
        let registry = MetricsRegistry::default();
        registry.observe_versions("deployment", "al9qy", &[versioned("a", "al9qy", "1.0.0")]);
        registry.observe_versions("deployment", "p2k1w", &[versioned("b", "p2k1w", "1.0.0")]);

        let totals = registry.observe_versions::<ConfigMap>("deployment", "al9qy", &[]);
        assert_eq!(totals.get(&(1, 0, 0)), Some(&1));

        let totals = registry.observe_versions::<ConfigMap>("deployment", "p2k1w", &[]);
        assert_eq!(totals.get(&(1, 0, 0)), Some(&0));
        assert!(registry.version_totals("deployment").is_empty());
    }

    #[test]
    fn test_kinds_are_counted_separately() {
        let registry = MetricsRegistry::new("test");
        registry.observe_versions("configmap", "al9qy", &[versioned("a", "al9qy", "1.0.0")]);
        let totals =
            registry.observe_versions("service", "al9qy", &[versioned("a", "al9qy", "1.1.0")]);
        assert_eq!(totals.get(&(1, 0, 0)), None);
        assert_eq!(totals.get(&(1, 1, 0)), Some(&1));
    }
}

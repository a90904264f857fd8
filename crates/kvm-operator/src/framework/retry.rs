//! Retry decorator for resources
//!
//! Every phase of the wrapped resource is retried with exponential backoff
//! as long as the error is transient (see [`crate::error::OperatorError::is_retryable`]).

use super::{ChangeSet, ObjectScope, Phase, ReconcileContext, Resource};
use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff of a failing resource phase
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further one
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction the delay may move up or down, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Same delay before every retry
    pub fn fixed_delay(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the `retry`th retry (1-based) of `resource` while
    /// reconciling the cluster in `scope`.
    ///
    /// The jitter is derived from resource, scope and retry, so one object
    /// always backs off the same way while the clusters sharing an API
    /// server outage spread their retries.
    pub fn backoff(&self, retry: u32, resource: &str, scope: &str) -> Duration {
        let doublings = retry.saturating_sub(1).min(16);
        let nominal = self
            .base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);
        if nominal.is_zero() || self.jitter <= 0.0 {
            return nominal;
        }

        let factor = 1.0 + self.jitter.min(1.0) * spread(resource, scope, retry);
        nominal.mul_f64(factor.max(0.0))
    }
}

/// Stable value in [-1, 1]
fn spread(resource: &str, scope: &str, retry: u32) -> f64 {
    let digest = Sha256::new()
        .chain_update(resource.as_bytes())
        .chain_update([0])
        .chain_update(scope.as_bytes())
        .chain_update(retry.to_be_bytes())
        .finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) as f64 / u64::MAX as f64 * 2.0 - 1.0
}

/// Runs `operation` until it succeeds, fails permanently or the retries are
/// exhausted. The last error is returned unchanged.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    resource: &'static str,
    scope: &str,
    phase: Phase,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts <= config.max_retries => {
                let delay = config.backoff(attempts, resource, scope);
                warn!(
                    resource,
                    scope,
                    phase = %phase,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying resource phase"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a [`Resource`] so that each of its phases is retried
pub struct RetryResource<R> {
    inner: R,
    config: RetryConfig,
}

impl<R> RetryResource<R> {
    pub fn new(inner: R, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<T, R> Resource<T> for RetryResource<R>
where
    T: ObjectScope + Send + Sync + 'static,
    R: Resource<T>,
{
    type Object = R::Object;

    fn name(&self) -> &'static str {
        <R as Resource<T>>::name(&self.inner)
    }

    async fn get_current_state(&self, ctx: &ReconcileContext, obj: &T) -> Result<Vec<R::Object>> {
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::CurrentState,
            || self.inner.get_current_state(ctx, obj),
        )
        .await
    }

    async fn get_desired_state(&self, ctx: &ReconcileContext, obj: &T) -> Result<Vec<R::Object>> {
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::DesiredState,
            || self.inner.get_desired_state(ctx, obj),
        )
        .await
    }

    async fn new_create_patch(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        current: &[R::Object],
        desired: &[R::Object],
    ) -> Result<ChangeSet<R::Object>> {
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::CreatePatch,
            || self.inner.new_create_patch(ctx, obj, current, desired),
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
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::UpdatePatch,
            || self.inner.new_update_patch(ctx, obj, current, desired),
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
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::DeletePatch,
            || self.inner.new_delete_patch(ctx, obj, current, desired),
        )
        .await
    }

    async fn apply_create_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[R::Object],
    ) -> Result<()> {
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::ApplyCreate,
            || self.inner.apply_create_change(ctx, obj, change),
        )
        .await
    }

    async fn apply_delete_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[R::Object],
    ) -> Result<()> {
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::ApplyDelete,
            || self.inner.apply_delete_change(ctx, obj, change),
        )
        .await
    }

    async fn apply_update_change(
        &self,
        ctx: &ReconcileContext,
        obj: &T,
        change: &[R::Object],
    ) -> Result<()> {
        retry(
            &self.config,
            <R as Resource<T>>::name(&self.inner),
            &obj.reconcile_scope(),
            Phase::ApplyUpdate,
            || self.inner.apply_update_change(ctx, obj, change),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{api_error, OperatorError};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.backoff(1, "configmap", "al9qy"), Duration::from_millis(200));
        assert_eq!(config.backoff(2, "configmap", "al9qy"), Duration::from_millis(400));
        assert_eq!(config.backoff(20, "configmap", "al9qy"), Duration::from_secs(5));

        let fixed = RetryConfig::fixed_delay(3, Duration::from_millis(50));
        assert_eq!(fixed.backoff(1, "service", "al9qy"), Duration::from_millis(50));
        assert_eq!(fixed.backoff(3, "service", "al9qy"), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_is_keyed_by_resource_and_cluster() {
        let config = RetryConfig::default();
        let nominal = Duration::from_millis(400);
        let low = nominal.mul_f64(0.8);
        let high = nominal.mul_f64(1.2);

        let first = config.backoff(2, "deployment", "al9qy");
        assert_eq!(config.backoff(2, "deployment", "al9qy"), first);
        assert!(first >= low && first <= high, "{:?}", first);

        let delays: Vec<Duration> = ["al9qy", "p2k1w", "x7b3c", "q0n8d"]
            .iter()
            .map(|cluster| config.backoff(2, "deployment", cluster))
            .collect();
        assert!(delays.iter().all(|d| *d >= low && *d <= high));
        assert!(delays.iter().any(|d| *d != first));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = RetryConfig::fixed_delay(3, Duration::ZERO);

        let result = retry(&config, "configmap", "al9qy", Phase::ApplyUpdate, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(api_error(503, "ServiceUnavailable", "etcd leader changed"))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = RetryConfig::fixed_delay(2, Duration::ZERO);

        let result: Result<()> = retry(&config, "service", "al9qy", Phase::CurrentState, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(api_error(500, "InternalError", "boom"))
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = RetryConfig::fixed_delay(5, Duration::ZERO);

        let result: Result<()> = retry(&config, "deployment", "al9qy", Phase::DesiredState, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OperatorError::InvalidVersionBundle("9.9.9".to_string()))
        })
        .await;

        assert!(matches!(result, Err(OperatorError::InvalidVersionBundle(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

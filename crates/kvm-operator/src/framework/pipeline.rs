//! Reconciliation pass
//!
//! A pass resolves the handler list for the watched object and runs every
//! handler in order. Handlers share one [`ReconcileContext`]; a handler that
//! cancels the context ends the pass early without an error.

use super::{Handler, ReconcileContext, ResourceRouter, VersionedObject};
use crate::error::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// What triggered the pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// Object added, modified or resynced
    #[default]
    Apply,
    /// Object is being deleted
    Delete,
}

impl ReconcileEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileEvent::Apply => "apply",
            ReconcileEvent::Delete => "delete",
        }
    }
}

/// How a pass ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every handler ran
    Completed,
    /// A handler cancelled the pass
    Cancelled { resource: &'static str },
}

/// Source of the ordered handler list for an object
pub trait ResourceSet<T>: Send + Sync {
    fn resources(&self, ctx: &ReconcileContext, obj: &T) -> Result<Vec<Arc<dyn Handler<T>>>>;
}

impl<T> ResourceSet<T> for ResourceRouter<T>
where
    T: VersionedObject + Send + Sync + 'static,
{
    fn resources(&self, ctx: &ReconcileContext, obj: &T) -> Result<Vec<Arc<dyn Handler<T>>>> {
        ResourceRouter::resources(self, ctx, obj)
    }
}

/// A fixed list, used for watched kinds without version bundles
impl<T> ResourceSet<T> for Vec<Arc<dyn Handler<T>>>
where
    T: Send + Sync + 'static,
{
    fn resources(&self, _ctx: &ReconcileContext, _obj: &T) -> Result<Vec<Arc<dyn Handler<T>>>> {
        Ok(self.clone())
    }
}

/// Runs reconciliation passes for objects of type `T`
pub struct Framework<T> {
    resource_set: Arc<dyn ResourceSet<T>>,
}

impl<T> Clone for Framework<T> {
    fn clone(&self) -> Self {
        Self {
            resource_set: Arc::clone(&self.resource_set),
        }
    }
}

impl<T> Framework<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(resource_set: Arc<dyn ResourceSet<T>>) -> Self {
        Self { resource_set }
    }

    /// Runs one pass with a fresh context.
    ///
    /// The first failing handler aborts the pass; handlers that already
    /// succeeded are not rolled back and simply run again next time.
    pub async fn reconcile(&self, obj: &T, event: ReconcileEvent) -> Result<PassOutcome> {
        let ctx = ReconcileContext::for_event(event);
        let start = Instant::now();
        let handlers = self.resource_set.resources(&ctx, obj)?;

        for handler in &handlers {
            let resource = handler.resource_name();
            debug!(resource, event = event.as_str(), "Running resource");

            match event {
                ReconcileEvent::Apply => handler.ensure_created(&ctx, obj).await?,
                ReconcileEvent::Delete => handler.ensure_deleted(&ctx, obj).await?,
            }

            if ctx.is_cancelled() {
                info!(resource, event = event.as_str(), "Reconciliation pass cancelled");
                return Ok(PassOutcome::Cancelled { resource });
            }
        }

        debug!(
            event = event.as_str(),
            resources = handlers.len(),
            updated_config_maps = ?ctx.updated_config_maps(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reconciliation pass completed"
        );
        Ok(PassOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{api_error, OperatorError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Step {
        name: &'static str,
        journal: Arc<Journal>,
        cancel: bool,
        fail: bool,
    }

    #[async_trait]
    impl Handler<String> for Step {
        fn resource_name(&self) -> &'static str {
            self.name
        }

        async fn ensure_created(&self, ctx: &ReconcileContext, _obj: &String) -> Result<()> {
            self.journal.0.lock().push(format!("create:{}", self.name));
            if self.fail {
                return Err(api_error(500, "InternalError", "boom"));
            }
            if self.cancel {
                ctx.cancel();
            }
            Ok(())
        }

        async fn ensure_deleted(&self, _ctx: &ReconcileContext, _obj: &String) -> Result<()> {
            self.journal.0.lock().push(format!("delete:{}", self.name));
            Ok(())
        }
    }

    fn framework(journal: &Arc<Journal>, steps: &[(&'static str, bool, bool)]) -> Framework<String> {
        let handlers: Vec<Arc<dyn Handler<String>>> = steps
            .iter()
            .map(|&(name, cancel, fail)| {
                Arc::new(Step {
                    name,
                    journal: Arc::clone(journal),
                    cancel,
                    fail,
                }) as Arc<dyn Handler<String>>
            })
            .collect();
        Framework::new(Arc::new(handlers))
    }

    #[tokio::test]
    async fn test_handlers_run_in_order() {
        let journal = Arc::new(Journal::default());
        let fw = framework(&journal, &[("namespace", false, false), ("service", false, false)]);

        let outcome = fw.reconcile(&"al9qy".to_string(), ReconcileEvent::Apply).await.unwrap();
        assert_eq!(outcome, PassOutcome::Completed);
        assert_eq!(journal.entries(), vec!["create:namespace", "create:service"]);

        fw.reconcile(&"al9qy".to_string(), ReconcileEvent::Delete).await.unwrap();
        assert_eq!(
            journal.entries()[2..],
            ["delete:namespace".to_string(), "delete:service".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_pass_without_error() {
        let journal = Arc::new(Journal::default());
        let fw = framework(&journal, &[("namespace", true, false), ("service", false, false)]);

        let outcome = fw.reconcile(&"al9qy".to_string(), ReconcileEvent::Apply).await.unwrap();
        assert_eq!(outcome, PassOutcome::Cancelled { resource: "namespace" });
        assert_eq!(journal.entries(), vec!["create:namespace"]);

        // the next pass starts with a fresh context
        let outcome = fw.reconcile(&"al9qy".to_string(), ReconcileEvent::Delete).await.unwrap();
        assert_eq!(outcome, PassOutcome::Completed);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_handlers() {
        let journal = Arc::new(Journal::default());
        let fw = framework(
            &journal,
            &[("namespace", false, false), ("configmap", false, true), ("service", false, false)],
        );

        let err = fw
            .reconcile(&"al9qy".to_string(), ReconcileEvent::Apply)
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::KubeError(_)));
        assert_eq!(journal.entries(), vec!["create:namespace", "create:configmap"]);
    }
}

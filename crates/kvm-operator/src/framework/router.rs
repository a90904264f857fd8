//! Version bundle routing
//!
//! Every custom object declares the version bundle it was created for. The
//! router resolves that version to the ordered handler list registered for
//! it, so clusters on old bundles keep being reconciled with the resources
//! they were built with.

use super::{Handler, ReconcileContext};
use crate::crd::KvmCluster;
use crate::error::{OperatorError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Objects that declare a version bundle version
pub trait VersionedObject {
    /// Empty when the object predates version bundles
    fn version_bundle_version(&self) -> &str;
}

impl VersionedObject for KvmCluster {
    fn version_bundle_version(&self) -> &str {
        crate::key::version_bundle_version(self)
    }
}

/// Ordered handler lists keyed by exact version bundle version
pub struct VersionedResourceTable<T> {
    entries: HashMap<String, Vec<Arc<dyn Handler<T>>>>,
}

impl<T> Default for VersionedResourceTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> VersionedResourceTable<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handlers for one version. Registering a version twice
    /// is a configuration error.
    pub fn register(
        &mut self,
        version: impl Into<String>,
        handlers: Vec<Arc<dyn Handler<T>>>,
    ) -> Result<()> {
        let version = version.into();
        if self.entries.contains_key(&version) {
            return Err(OperatorError::InvalidConfig(format!(
                "resources for version bundle '{}' registered twice",
                version
            )));
        }
        self.entries.insert(version, handlers);
        Ok(())
    }

    /// Registered versions, sorted
    pub fn versions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        versions.sort_unstable();
        versions
    }

    fn lookup(&self, version: &str) -> Option<&[Arc<dyn Handler<T>>]> {
        self.entries.get(version).map(Vec::as_slice)
    }
}

/// Resolves the resource list of an object from its version bundle
pub struct ResourceRouter<T> {
    table: VersionedResourceTable<T>,
}

impl<T> ResourceRouter<T>
where
    T: VersionedObject + Send + Sync + 'static,
{
    pub fn new(table: VersionedResourceTable<T>) -> Self {
        Self { table }
    }

    /// Exact match on the object's version. Unknown versions are an error
    /// and never fall back to another resource set.
    pub fn resources(&self, _ctx: &ReconcileContext, obj: &T) -> Result<Vec<Arc<dyn Handler<T>>>> {
        let version = obj.version_bundle_version();
        match self.table.lookup(version) {
            Some(handlers) => {
                debug!(version, handlers = handlers.len(), "Resolved resource set");
                Ok(handlers.to_vec())
            }
            None => Err(OperatorError::InvalidVersionBundle(version.to_string())),
        }
    }

    pub fn versions(&self) -> Vec<&str> {
        self.table.versions()
    }
}

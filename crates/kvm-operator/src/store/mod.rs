//! Access to the objects a resource manages.
//!
//! Resources never hold a `kube::Api` directly. They go through
//! [`ObjectStore`], which the operator backs with the API server
//! ([`KubeStore`]) and the tests back with an in-memory map.

#[cfg(test)]
pub(crate) mod memory;

use crate::error::Result;
use crate::framework::ManagedObject;
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::trace;

/// CRUD access to one object kind
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    /// Fails with a 404 API error when the object does not exist
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>>;

    /// Fails with a 409 `AlreadyExists` API error when the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Fails with a 409 `Conflict` API error on a stale resource version
    async fn replace(&self, obj: &K) -> Result<K>;

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;
}

/// Like [`ObjectStore::get`], mapping 404 to `None`
pub async fn get_optional<K>(
    store: &dyn ObjectStore<K>,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>> {
    match store.get(namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K: ManagedObject> ObjectStore<K> for KubeStore {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        trace!(kind = %K::KIND, name, "GET");
        let api = K::api(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        trace!(kind = %K::KIND, selector = label_selector, "LIST");
        let api = K::api(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        trace!(kind = %K::KIND, name = obj.object_name(), "CREATE");
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        trace!(kind = %K::KIND, name = obj.object_name(), "UPDATE");
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        Ok(api
            .replace(obj.object_name(), &PostParams::default(), obj)
            .await?)
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        trace!(kind = %K::KIND, name, "DELETE");
        let api = K::api(self.client.clone(), namespace);
        let dp = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        api.delete(name, &dp).await?;
        Ok(())
    }
}

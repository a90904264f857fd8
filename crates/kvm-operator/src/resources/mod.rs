//! Managed resources of a guest cluster
//!
//! One module per child kind. Each resource implements
//! [`crate::framework::Resource`] for the object it is derived from and is
//! registered, wrapped in retry and metrics decorators, in the resource set
//! of every version bundle it applies to.

pub mod cluster_role_binding;
pub mod config_map;
pub mod deployment;
pub mod ingress;
pub mod namespace;
pub mod pod;
pub mod pvc;
pub mod service;
pub mod service_account;

use crate::config::{ManifestConfig, OperatorConfig};
use crate::crd::KvmCluster;
use crate::error::Result;
use crate::framework::metrics::{MetricsRegistry, MetricsResource};
use crate::framework::retry::{RetryConfig, RetryResource};
use crate::framework::{Handler, ManagedObject, Resource, VersionedResourceTable};
use crate::manifests::EtcdStorage;
use crate::store::{get_optional, KubeStore, ObjectStore};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, Pod, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, info};

/// Version bundles reconciled with etcd on host paths
pub const LEGACY_VERSIONS: &[&str] = &["", "0.1.0"];

/// Version bundles reconciled with etcd on persistent volumes
pub const CURRENT_VERSIONS: &[&str] = &["1.0.0", "1.1.0"];

/// Object stores of every managed kind
#[derive(Clone)]
pub struct Stores {
    pub namespaces: Arc<dyn ObjectStore<Namespace>>,
    pub service_accounts: Arc<dyn ObjectStore<ServiceAccount>>,
    pub cluster_role_bindings: Arc<dyn ObjectStore<ClusterRoleBinding>>,
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    pub pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    pub ingresses: Arc<dyn ObjectStore<Ingress>>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
}

impl Stores {
    /// Stores backed by the API server
    pub fn kube(client: Client) -> Self {
        let store = KubeStore::new(client);
        Self {
            namespaces: Arc::new(store.clone()),
            service_accounts: Arc::new(store.clone()),
            cluster_role_bindings: Arc::new(store.clone()),
            config_maps: Arc::new(store.clone()),
            pvcs: Arc::new(store.clone()),
            deployments: Arc::new(store.clone()),
            ingresses: Arc::new(store.clone()),
            services: Arc::new(store.clone()),
            pods: Arc::new(store),
        }
    }
}

/// Api handle for a namespaced kind
pub(crate) fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Reads the objects of the given names, omitting those that do not exist
pub(crate) async fn get_existing<K: ManagedObject>(
    store: &dyn ObjectStore<K>,
    namespace: Option<&str>,
    names: &[String],
) -> Result<Vec<K>> {
    let mut found = Vec::with_capacity(names.len());
    for name in names {
        if let Some(obj) = get_optional(store, namespace, name).await? {
            found.push(obj);
        }
    }
    Ok(found)
}

/// Creates every object, treating `AlreadyExists` as success
pub(crate) async fn create_all<K: ManagedObject>(store: &dyn ObjectStore<K>, objects: &[K]) -> Result<()> {
    for obj in objects {
        match store.create(obj).await {
            Ok(_) => info!(kind = %K::KIND, name = obj.object_name(), "Created object"),
            Err(e) if e.is_already_exists() => {
                debug!(kind = %K::KIND, name = obj.object_name(), "Object already exists")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Deletes every object, treating `NotFound` as success
pub(crate) async fn delete_all<K: ManagedObject>(
    store: &dyn ObjectStore<K>,
    objects: &[K],
    grace_period_seconds: Option<u32>,
) -> Result<()> {
    for obj in objects {
        let namespace = obj.meta().namespace.as_deref();
        match store.delete(namespace, obj.object_name(), grace_period_seconds).await {
            Ok(()) => info!(kind = %K::KIND, name = obj.object_name(), "Deleted object"),
            Err(e) if e.is_not_found() => {
                debug!(kind = %K::KIND, name = obj.object_name(), "Object already gone")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Replaces every object with its desired form
pub(crate) async fn replace_all<K: ManagedObject>(store: &dyn ObjectStore<K>, objects: &[K]) -> Result<()> {
    for obj in objects {
        store.replace(obj).await?;
        info!(kind = %K::KIND, name = obj.object_name(), "Updated object");
    }
    Ok(())
}

fn wrap<R>(resource: R, retry: &RetryConfig, registry: &Arc<MetricsRegistry>) -> Arc<dyn Handler<KvmCluster>>
where
    R: Resource<KvmCluster> + 'static,
{
    Arc::new(MetricsResource::new(
        RetryResource::new(resource, retry.clone()),
        Arc::clone(registry),
    ))
}

/// Ordered resource list of one version bundle
pub fn cluster_resources(
    stores: &Stores,
    config: &OperatorConfig,
    registry: &Arc<MetricsRegistry>,
    etcd: EtcdStorage,
) -> Vec<Arc<dyn Handler<KvmCluster>>> {
    let manifests: Arc<ManifestConfig> = Arc::new(config.manifests.clone());
    let retry = &config.retry;

    let mut resources = vec![
        wrap(
            namespace::NamespaceResource::new(stores.namespaces.clone(), manifests.clone()),
            retry,
            registry,
        ),
        wrap(
            service_account::ServiceAccountResource::new(
                stores.service_accounts.clone(),
                manifests.clone(),
            ),
            retry,
            registry,
        ),
        wrap(
            cluster_role_binding::ClusterRoleBindingResource::new(
                stores.cluster_role_bindings.clone(),
                manifests.clone(),
            ),
            retry,
            registry,
        ),
        wrap(
            config_map::ConfigMapResource::new(stores.config_maps.clone(), manifests.clone()),
            retry,
            registry,
        ),
    ];

    if etcd == EtcdStorage::PersistentVolume {
        resources.push(wrap(
            pvc::PvcResource::new(stores.pvcs.clone(), manifests.clone()),
            retry,
            registry,
        ));
    }

    resources.extend([
        wrap(
            deployment::DeploymentResource::new(stores.deployments.clone(), manifests.clone(), etcd),
            retry,
            registry,
        ),
        wrap(
            ingress::IngressResource::new(stores.ingresses.clone(), manifests.clone()),
            retry,
            registry,
        ),
        wrap(
            service::ServiceResource::new(stores.services.clone(), manifests),
            retry,
            registry,
        ),
    ]);

    resources
}

/// Resource sets of every supported version bundle
pub fn versioned_resources(
    stores: &Stores,
    config: &OperatorConfig,
    registry: &Arc<MetricsRegistry>,
) -> Result<VersionedResourceTable<KvmCluster>> {
    let mut table = VersionedResourceTable::new();
    for version in LEGACY_VERSIONS {
        table.register(
            *version,
            cluster_resources(stores, config, registry, EtcdStorage::HostPath),
        )?;
    }
    for version in CURRENT_VERSIONS {
        table.register(
            *version,
            cluster_resources(stores, config, registry, EtcdStorage::PersistentVolume),
        )?;
    }
    Ok(table)
}

/// Resource list of the guest node pod controller
pub fn pod_resources(
    stores: &Stores,
    config: &OperatorConfig,
    registry: &Arc<MetricsRegistry>,
) -> Vec<Arc<dyn Handler<Pod>>> {
    let drain: Arc<dyn Handler<Pod>> = Arc::new(MetricsResource::new(
        RetryResource::new(pod::PodResource::new(stores.pods.clone()), config.retry.clone()),
        Arc::clone(registry),
    ));
    vec![drain]
}

//! Kubernetes manifest builders
//!
//! This module generates the child objects of a guest cluster (namespace,
//! RBAC, per node config maps, deployments and volumes, services and
//! ingresses) from a `KvmCluster`. Builders are pure; reading or writing the
//! API is the job of the resources in [`crate::resources`].

use crate::config::ManifestConfig;
use crate::crd::{KvmCluster, NodeSpec};
use crate::error::{OperatorError, Result};
use crate::key::{
    self, NodeRole, CONFIG_CHECKSUM_ANNOTATION, DRAINING_NODES_FINALIZER, MASTER_ID, WORKER_ID,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, HostPathVolumeSource, Namespace,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Name of the container running the virtual machine
pub const KVM_CONTAINER_NAME: &str = "k8s-kvm";

/// Config map key holding the node's cloud-config
pub const USER_DATA_KEY: &str = "user_data";

/// App label of cluster wide objects that belong to no node role
pub const OPERATOR_APP: &str = "kvm-operator";

const CLOUD_CONFIG_VOLUME: &str = "cloud-config";
const CLOUD_CONFIG_MOUNT_PATH: &str = "/cloudconfig";
const ETCD_VOLUME: &str = "etcd-data";
const ETCD_MOUNT_PATH: &str = "/etc/kubernetes/data/etcd";

const API_PORT: i32 = 443;
const ETCD_PORT: i32 = 2379;
const WORKER_HTTP_NODE_PORT: i32 = 30010;
const WORKER_HTTPS_NODE_PORT: i32 = 30011;

/// Hex encoded SHA-256 over the config map data, keys in order
pub fn config_checksum(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in data {
        hasher.update(k.as_bytes());
        hasher.update([0]);
        hasher.update(v.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Where master nodes keep their etcd data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtcdStorage {
    /// Directory on the host, used by the legacy resource set
    HostPath,
    /// One persistent volume claim per master
    PersistentVolume,
}

#[derive(Serialize)]
struct CloudConfig {
    hostname: String,
    write_files: Vec<CloudConfigFile>,
    runcmd: Vec<String>,
}

#[derive(Serialize)]
struct CloudConfigFile {
    path: String,
    permissions: String,
    content: String,
}

/// Builder for the child objects of one guest cluster
pub struct ManifestBuilder<'a> {
    cluster: &'a KvmCluster,
    config: &'a ManifestConfig,
    cluster_id: &'a str,
    namespace: String,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(cluster: &'a KvmCluster, config: &'a ManifestConfig) -> Result<Self> {
        let cluster_id = key::cluster_id(cluster);
        if cluster_id.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "cluster id is required".to_string(),
            ));
        }

        Ok(Self {
            cluster,
            config,
            cluster_id,
            namespace: key::cluster_namespace(cluster),
        })
    }

    /// Ingress domain of the cluster, the operator default unless overridden
    pub fn ingress_domain(&self) -> &str {
        self.cluster
            .spec
            .cluster
            .ingress_domain
            .as_deref()
            .unwrap_or(&self.config.ingress_domain)
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    /// The namespace holding every namespaced child object
    pub fn build_namespace(&self) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: Some(key::cluster_labels(self.cluster, OPERATOR_APP)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(
                key::service_account_name(self.cluster),
                key::cluster_labels(self.cluster, OPERATOR_APP),
            ),
            ..Default::default()
        }
    }

    /// General and pod security policy bindings of the guest service account
    pub fn build_cluster_role_bindings(&self) -> Vec<ClusterRoleBinding> {
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: key::service_account_name(self.cluster),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        };

        [
            (
                key::cluster_role_binding_name(self.cluster),
                &self.config.cluster_role,
            ),
            (
                key::cluster_role_binding_psp_name(self.cluster),
                &self.config.psp_cluster_role,
            ),
        ]
        .into_iter()
        .map(|(name, role)| ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(key::cluster_labels(self.cluster, OPERATOR_APP)),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: role.clone(),
            },
            subjects: Some(vec![subject.clone()]),
        })
        .collect()
    }

    fn cloud_config(&self, role: NodeRole, node: &NodeSpec) -> Result<String> {
        let domain = self.ingress_domain();
        let env = [
            ("CLUSTER_ID", self.cluster_id.to_string()),
            ("CUSTOMER_ID", key::customer_id(self.cluster).to_string()),
            ("NODE_ID", node.id.clone()),
            ("ROLE", role.to_string()),
            ("API_DOMAIN", key::api_domain(self.cluster, domain)),
            ("ETCD_DOMAIN", key::etcd_domain(self.cluster, domain)),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect::<String>();

        let config = CloudConfig {
            hostname: key::deployment_name(role, self.cluster_id, &node.id),
            write_files: vec![CloudConfigFile {
                path: "/etc/kubernetes/cluster.env".to_string(),
                permissions: "0644".to_string(),
                content: env,
            }],
            runcmd: vec![format!("systemctl enable --now k8s-{}.service", role)],
        };

        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&config)?))
    }

    fn config_map_data(&self, role: NodeRole, node: &NodeSpec) -> Result<BTreeMap<String, String>> {
        let mut data = BTreeMap::new();
        data.insert(USER_DATA_KEY.to_string(), self.cloud_config(role, node)?);
        Ok(data)
    }

    /// One config map per node carrying its cloud-config
    pub fn build_config_maps(&self) -> Result<Vec<ConfigMap>> {
        self.cluster
            .spec
            .nodes()
            .map(|(role, node)| {
                Ok(ConfigMap {
                    metadata: self.metadata(
                        key::config_map_name(role, self.cluster_id, &node.id),
                        key::node_labels(self.cluster, role, node),
                    ),
                    data: Some(self.config_map_data(role, node)?),
                    ..Default::default()
                })
            })
            .collect()
    }

    /// One etcd volume claim per master
    pub fn build_etcd_pvcs(&self) -> Vec<PersistentVolumeClaim> {
        self.cluster
            .spec
            .cluster
            .masters
            .iter()
            .map(|node| {
                let mut requests = BTreeMap::new();
                requests.insert(
                    "storage".to_string(),
                    Quantity(self.config.etcd_volume_size.clone()),
                );

                PersistentVolumeClaim {
                    metadata: self.metadata(
                        key::etcd_pvc_name(self.cluster_id, &node.id),
                        key::node_labels(self.cluster, NodeRole::Master, node),
                    ),
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                        storage_class_name: self.config.storage_class.clone(),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(requests),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            })
            .collect()
    }

    fn env(role: NodeRole, cluster_id: &str, node: &NodeSpec) -> Vec<EnvVar> {
        [
            ("ROLE", role.to_string()),
            ("CLUSTER_ID", cluster_id.to_string()),
            ("NODE_ID", node.id.clone()),
            ("CORES", node.cpus.to_string()),
            ("MEMORY", node.memory.clone()),
            ("DISK", node.disk.clone()),
            (
                "CLOUD_CONFIG_PATH",
                format!("{}/{}", CLOUD_CONFIG_MOUNT_PATH, USER_DATA_KEY),
            ),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect()
    }

    fn etcd_volume(&self, storage: EtcdStorage, node: &NodeSpec) -> Volume {
        match storage {
            EtcdStorage::HostPath => Volume {
                name: ETCD_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: format!(
                        "{}/{}/{}",
                        self.config.etcd_host_path, self.cluster_id, node.id
                    ),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            },
            EtcdStorage::PersistentVolume => Volume {
                name: ETCD_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: key::etcd_pvc_name(self.cluster_id, &node.id),
                    read_only: None,
                }),
                ..Default::default()
            },
        }
    }

    fn build_deployment(
        &self,
        role: NodeRole,
        node: &NodeSpec,
        storage: EtcdStorage,
    ) -> Result<Deployment> {
        let name = key::deployment_name(role, self.cluster_id, &node.id);
        let labels = key::node_labels(self.cluster, role, node);
        let annotations = key::version_annotations(self.cluster);
        // Pod template follows the node's cloud-config
        let mut template_annotations = annotations.clone();
        template_annotations.insert(
            CONFIG_CHECKSUM_ANNOTATION.to_string(),
            config_checksum(&self.config_map_data(role, node)?),
        );

        let mut volumes = vec![Volume {
            name: CLOUD_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: key::config_map_name(role, self.cluster_id, &node.id).into(),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut volume_mounts = vec![VolumeMount {
            name: CLOUD_CONFIG_VOLUME.to_string(),
            mount_path: CLOUD_CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];
        if role == NodeRole::Master {
            volumes.push(self.etcd_volume(storage, node));
            volume_mounts.push(VolumeMount {
                name: ETCD_VOLUME.to_string(),
                mount_path: ETCD_MOUNT_PATH.to_string(),
                ..Default::default()
            });
        }

        let container = Container {
            name: KVM_CONTAINER_NAME.to_string(),
            image: Some(self.config.kvm_image.clone()),
            env: Some(Self::env(role, self.cluster_id, node)),
            volume_mounts: Some(volume_mounts),
            // The VM needs /dev/kvm and tap devices
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        Ok(Deployment {
            metadata: ObjectMeta {
                annotations: Some(annotations),
                ..self.metadata(name, labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(template_annotations),
                        finalizers: Some(vec![DRAINING_NODES_FINALIZER.to_string()]),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes),
                        service_account_name: Some(key::service_account_name(self.cluster)),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// One single replica deployment per node, masters first
    pub fn build_deployments(&self, storage: EtcdStorage) -> Result<Vec<Deployment>> {
        self.cluster
            .spec
            .nodes()
            .map(|(role, node)| self.build_deployment(role, node, storage))
            .collect()
    }

    fn ingress(&self, name: &str, host: String, port: i32) -> Ingress {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nginx.ingress.kubernetes.io/ssl-passthrough".to_string(),
            "true".to_string(),
        );

        Ingress {
            metadata: ObjectMeta {
                annotations: Some(annotations),
                ..self.metadata(name.to_string(), key::cluster_labels(self.cluster, MASTER_ID))
            },
            spec: Some(IngressSpec {
                tls: Some(vec![IngressTLS {
                    hosts: Some(vec![host.clone()]),
                    ..Default::default()
                }]),
                rules: Some(vec![IngressRule {
                    host: Some(host),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: MASTER_ID.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(port),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// `etcd` and `api` ingresses in front of the master service
    pub fn build_ingresses(&self) -> Vec<Ingress> {
        let domain = self.ingress_domain();
        vec![
            self.ingress("etcd", key::etcd_domain(self.cluster, domain), ETCD_PORT),
            self.ingress("api", key::api_domain(self.cluster, domain), API_PORT),
        ]
    }

    fn port(name: &str, port: i32, target: i32) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            target_port: Some(IntOrString::Int(target)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    fn selector(&self, app: &str) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(key::LABEL_APP.to_string(), app.to_string());
        selector.insert(key::LABEL_CLUSTER.to_string(), self.cluster_id.to_string());
        selector
    }

    /// `master` and `worker` services
    pub fn build_services(&self) -> Vec<Service> {
        vec![
            Service {
                metadata: self.metadata(
                    MASTER_ID.to_string(),
                    key::cluster_labels(self.cluster, MASTER_ID),
                ),
                spec: Some(ServiceSpec {
                    type_: Some("ClusterIP".to_string()),
                    selector: Some(self.selector(MASTER_ID)),
                    ports: Some(vec![
                        Self::port("api", API_PORT, API_PORT),
                        Self::port("etcd", ETCD_PORT, ETCD_PORT),
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Service {
                metadata: self.metadata(
                    WORKER_ID.to_string(),
                    key::cluster_labels(self.cluster, WORKER_ID),
                ),
                spec: Some(ServiceSpec {
                    type_: Some("NodePort".to_string()),
                    selector: Some(self.selector(WORKER_ID)),
                    ports: Some(vec![
                        Self::port("http", 80, WORKER_HTTP_NODE_PORT),
                        Self::port("https", 443, WORKER_HTTPS_NODE_PORT),
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]
    }
}

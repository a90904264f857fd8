//! Custom Resource Definition for the KVM operator
//!
//! A `KvmCluster` describes one guest Kubernetes cluster whose nodes run as
//! KVM virtual machines inside pods of the host cluster.

use kube::{CustomResource, CustomResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for `<major>.<minor>.<patch>`
static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate an id that becomes part of object names
fn validate_id(value: &str) -> Result<(), ValidationError> {
    // Longest derived name is "pvc-master-etcd-<cluster>-<node>"
    if value.len() > 20 {
        return Err(
            ValidationError::new("id_too_long").with_message("id exceeds 20 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_id").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Empty means the legacy resource set
fn validate_bundle_version(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || VERSION_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_version").with_message(
            format!("'{}' is not a <major>.<minor>.<patch> version", value).into(),
        ))
    }
}

fn validate_unique_nodes(spec: &ClusterSpec) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for node in spec.masters.iter().chain(spec.workers.iter()) {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError::new("duplicate_node_id")
                .with_message(format!("node id '{}' is used twice", node.id).into()));
        }
    }
    Ok(())
}

/// KvmCluster custom resource definition
///
/// The operator derives a namespace plus the per node deployments, config
/// maps, services, ingresses and volumes of the guest cluster from it.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "provider.giantswarm.io",
    version = "v1alpha1",
    kind = "KvmCluster",
    plural = "kvmclusters",
    shortname = "kvm",
    namespaced,
    status = "KvmClusterStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster.id"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.versionBundle.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KvmClusterSpec {
    /// Guest cluster topology
    #[validate(nested)]
    pub cluster: ClusterSpec,

    /// Version bundle selecting the resource set used to reconcile this cluster
    #[serde(default)]
    #[validate(nested)]
    pub version_bundle: VersionBundleSpec,
}

/// Guest cluster identity and node topology
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_unique_nodes"))]
pub struct ClusterSpec {
    /// Cluster id, also the name of the cluster namespace
    #[validate(custom(function = "validate_id"))]
    pub id: String,

    /// Customer owning the cluster
    #[validate(length(min = 1, max = 63, message = "customer id must be 1-63 characters"))]
    pub customer_id: String,

    /// Master nodes (at least one)
    #[validate(
        length(min = 1, message = "at least one master node is required"),
        nested
    )]
    pub masters: Vec<NodeSpec>,

    /// Worker nodes
    #[serde(default)]
    #[validate(nested)]
    pub workers: Vec<NodeSpec>,

    /// Base domain of the guest API and etcd ingresses, overrides the
    /// operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_domain: Option<String>,
}

/// A single guest node and the capabilities of its virtual machine
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Node id, unique within the cluster
    #[validate(custom(function = "validate_id"))]
    pub id: String,

    /// Virtual CPUs
    #[serde(default = "default_cpus")]
    #[validate(range(min = 1, max = 64, message = "cpus must be between 1 and 64"))]
    pub cpus: i32,

    /// Virtual machine memory
    #[serde(default = "default_memory")]
    #[validate(custom(function = "validate_quantity"))]
    pub memory: String,

    /// Root disk size
    #[serde(default = "default_disk")]
    #[validate(custom(function = "validate_quantity"))]
    pub disk: String,
}

/// Version bundle reference
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VersionBundleSpec {
    /// `<major>.<minor>.<patch>`, empty for the legacy resource set
    #[serde(default)]
    #[validate(custom(function = "validate_bundle_version"))]
    pub version: String,
}

/// Status of a KvmCluster resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KvmClusterStatus {
    /// Current observed generation
    pub observed_generation: i64,

    /// Version bundle of the last successful reconciliation
    pub applied_version_bundle: Option<String>,

    /// Last time the cluster was reconciled
    pub last_reconciled: Option<String>,
}

fn default_cpus() -> i32 {
    2
}

fn default_memory() -> String {
    "2G".to_string()
}

fn default_disk() -> String {
    "20G".to_string()
}

impl KvmClusterSpec {
    /// Masters and workers, masters first
    pub fn nodes(&self) -> impl Iterator<Item = (crate::key::NodeRole, &NodeSpec)> {
        use crate::key::NodeRole;

        self.cluster
            .masters
            .iter()
            .map(|n| (NodeRole::Master, n))
            .chain(self.cluster.workers.iter().map(|n| (NodeRole::Worker, n)))
    }
}

/// Installable CRD manifest
pub fn crd_manifest() -> crate::error::Result<String> {
    Ok(serde_yaml::to_string(&KvmCluster::crd())?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) fn node(id: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            cpus: default_cpus(),
            memory: default_memory(),
            disk: default_disk(),
        }
    }

    pub(crate) fn test_cluster(id: &str, version: &str) -> KvmCluster {
        KvmCluster {
            metadata: ObjectMeta {
                name: Some(id.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: KvmClusterSpec {
                cluster: ClusterSpec {
                    id: id.to_string(),
                    customer_id: "acme".to_string(),
                    masters: vec![node("m1")],
                    workers: vec![node("w1"), node("w2")],
                    ingress_domain: None,
                },
                version_bundle: VersionBundleSpec {
                    version: version.to_string(),
                },
            },
            status: None,
        }
    }

    #[test]
    fn test_valid_spec() {
        let cluster = test_cluster("al9qy", "1.0.0");
        assert!(cluster.spec.validate().is_ok());
    }

    #[test]
    fn test_legacy_version_is_valid() {
        let cluster = test_cluster("al9qy", "");
        assert!(cluster.spec.validate().is_ok());
    }

    #[test]
    fn test_invalid_version() {
        let cluster = test_cluster("al9qy", "v1");
        assert!(cluster.spec.validate().is_err());
    }

    #[test]
    fn test_requires_master() {
        let mut cluster = test_cluster("al9qy", "1.0.0");
        cluster.spec.cluster.masters.clear();
        assert!(cluster.spec.validate().is_err());
    }

    #[test]
    fn test_duplicate_node_ids() {
        let mut cluster = test_cluster("al9qy", "1.0.0");
        cluster.spec.cluster.workers.push(node("m1"));
        assert!(cluster.spec.validate().is_err());
    }

    #[test]
    fn test_invalid_ids() {
        let mut cluster = test_cluster("Al9qy", "1.0.0");
        assert!(cluster.spec.validate().is_err());

        cluster = test_cluster("al9qy", "1.0.0");
        cluster.spec.cluster.workers[0].memory = "lots".to_string();
        assert!(cluster.spec.validate().is_err());
    }

    #[test]
    fn test_nodes_order() {
        let cluster = test_cluster("al9qy", "1.0.0");
        let ids: Vec<_> = cluster.spec.nodes().map(|(_, n)| n.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "w1", "w2"]);
    }

    #[test]
    fn test_spec_deserialization_defaults() {
        let json = serde_json::json!({
            "cluster": {
                "id": "al9qy",
                "customerId": "acme",
                "masters": [{"id": "m1"}]
            }
        });
        let spec: KvmClusterSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.version_bundle.version, "");
        assert_eq!(spec.cluster.masters[0].cpus, 2);
        assert!(spec.cluster.workers.is_empty());
    }

    #[test]
    fn test_crd_manifest() {
        let manifest = crd_manifest().unwrap();
        assert!(manifest.contains("kind: CustomResourceDefinition"));
        assert!(manifest.contains("name: kvmclusters.provider.giantswarm.io"));
        assert!(manifest.contains("- kvm"));
    }
}

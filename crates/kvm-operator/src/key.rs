//! Deterministic names, labels and annotations derived from a [`KvmCluster`].
//!
//! Every child object name is a pure function of the cluster id and, for per
//! node objects, the node id. Nothing here talks to the API server.

use crate::crd::{KvmCluster, NodeSpec};
use std::collections::BTreeMap;

/// Serialized snapshot of the object as it was last written by the operator
pub const LAST_APPLIED_ANNOTATION: &str = "cluster-controller.giantswarm.io/last-configuration";

/// Version bundle version the object was written for
pub const VERSION_BUNDLE_ANNOTATION: &str = "giantswarm.io/version-bundle-version";

/// Checksum of the node config map data, set on the deployment pod template
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "kvm-operator.giantswarm.io/config-checksum";

/// Finalizer kept on guest node pods until the operator released them
pub const DRAINING_NODES_FINALIZER: &str = "draining-nodes";

pub const LABEL_APP: &str = "app";
pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_CUSTOMER: &str = "customer";
pub const LABEL_NODE: &str = "node";

pub const MASTER_ID: &str = "master";
pub const WORKER_ID: &str = "worker";

/// Label selector matching every guest node pod
pub const NODE_POD_SELECTOR: &str = "app in (master,worker)";

/// Role of a guest cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => MASTER_ID,
            NodeRole::Worker => WORKER_ID,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn cluster_id(cluster: &KvmCluster) -> &str {
    &cluster.spec.cluster.id
}

pub fn customer_id(cluster: &KvmCluster) -> &str {
    &cluster.spec.cluster.customer_id
}

/// Namespace holding every namespaced child object of the cluster
pub fn cluster_namespace(cluster: &KvmCluster) -> String {
    cluster_id(cluster).to_string()
}

pub fn version_bundle_version(cluster: &KvmCluster) -> &str {
    &cluster.spec.version_bundle.version
}

/// `<prefix>-<clusterID>-<nodeID>`
pub fn deployment_name(role: NodeRole, cluster_id: &str, node_id: &str) -> String {
    format!("{}-{}-{}", role, cluster_id, node_id)
}

/// Config maps share the deployment naming scheme
pub fn config_map_name(role: NodeRole, cluster_id: &str, node_id: &str) -> String {
    deployment_name(role, cluster_id, node_id)
}

pub fn etcd_pvc_name(cluster_id: &str, node_id: &str) -> String {
    format!("pvc-master-etcd-{}-{}", cluster_id, node_id)
}

pub fn service_account_name(cluster: &KvmCluster) -> String {
    cluster_id(cluster).to_string()
}

pub fn cluster_role_binding_name(cluster: &KvmCluster) -> String {
    cluster_id(cluster).to_string()
}

pub fn cluster_role_binding_psp_name(cluster: &KvmCluster) -> String {
    format!("{}-psp", cluster_id(cluster))
}

/// Guest API endpoint served by the master ingress
pub fn api_domain(cluster: &KvmCluster, ingress_domain: &str) -> String {
    format!("api.{}.{}", cluster_id(cluster), ingress_domain)
}

/// Guest etcd endpoint served by the etcd ingress
pub fn etcd_domain(cluster: &KvmCluster, ingress_domain: &str) -> String {
    format!("etcd.{}.{}", cluster_id(cluster), ingress_domain)
}

/// Labels carried by every object owned by the cluster
pub fn cluster_labels(cluster: &KvmCluster, app: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), app.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster_id(cluster).to_string());
    labels.insert(LABEL_CUSTOMER.to_string(), customer_id(cluster).to_string());
    labels
}

/// Labels of per node objects; these also select the node's pods
pub fn node_labels(cluster: &KvmCluster, role: NodeRole, node: &NodeSpec) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster, role.as_str());
    labels.insert(LABEL_NODE.to_string(), node.id.clone());
    labels
}

/// Label selector string for objects of one role in one cluster
pub fn role_selector(cluster: &KvmCluster, role: NodeRole) -> String {
    format!(
        "{}={},{}={}",
        LABEL_CLUSTER,
        cluster_id(cluster),
        LABEL_APP,
        role.as_str()
    )
}

/// Version annotation stamped on created and updated objects
pub fn version_annotations(cluster: &KvmCluster) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        VERSION_BUNDLE_ANNOTATION.to_string(),
        version_bundle_version(cluster).to_string(),
    );
    annotations
}

/// Splits a `<major>.<minor>.<patch>` string. Anything else yields `None`.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tests::test_cluster;

    #[test]
    fn test_node_names() {
        assert_eq!(
            deployment_name(NodeRole::Master, "al9qy", "5xchu"),
            "master-al9qy-5xchu"
        );
        assert_eq!(
            config_map_name(NodeRole::Worker, "al9qy", "p2k1w"),
            "worker-al9qy-p2k1w"
        );
        assert_eq!(etcd_pvc_name("al9qy", "5xchu"), "pvc-master-etcd-al9qy-5xchu");
    }

    #[test]
    fn test_cluster_names() {
        let cluster = test_cluster("al9qy", "1.0.0");
        assert_eq!(cluster_namespace(&cluster), "al9qy");
        assert_eq!(cluster_role_binding_psp_name(&cluster), "al9qy-psp");
        assert_eq!(api_domain(&cluster, "k8s.example.com"), "api.al9qy.k8s.example.com");
    }

    #[test]
    fn test_node_labels() {
        let cluster = test_cluster("al9qy", "1.0.0");
        let labels = node_labels(&cluster, NodeRole::Worker, &cluster.spec.cluster.workers[0]);
        assert_eq!(labels.get(LABEL_APP).map(String::as_str), Some("worker"));
        assert_eq!(labels.get(LABEL_CLUSTER).map(String::as_str), Some("al9qy"));
        assert_eq!(labels.get(LABEL_CUSTOMER).map(String::as_str), Some("acme"));
        assert!(labels.contains_key(LABEL_NODE));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("1.2"), None);
        assert_eq!(parse_version("1.2.x"), None);
    }
}

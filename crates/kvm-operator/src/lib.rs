//! # KVM Kubernetes Operator
//!
//! Kubernetes operator that provisions guest Kubernetes clusters whose
//! nodes are virtual machines running inside pods of the host cluster.
//!
//! A `KvmCluster` custom resource describes one guest cluster: its id,
//! customer, master and worker nodes, and the version bundle. The operator
//! maintains the child objects of every cluster (namespace, service account,
//! cluster role bindings, per node config maps, etcd volume claims and
//! deployments, ingresses and services) and releases guest node pods when
//! they are deleted.
//!
//! ## Architecture
//!
//! 1. **Watch**: KvmClusters, and guest node pods labelled
//!    `app in (master,worker)`
//! 2. **Route**: pick the resource list registered for the cluster's
//!    version bundle
//! 3. **Reconcile**: run every resource's read, diff and apply phases in
//!    order, wrapped in retry and metrics decorators
//! 4. **Status**: record the applied version bundle on the KvmCluster
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`controller`] - KvmCluster controller setup and error policy
//! - [`pod_controller`] - guest node pod controller
//! - [`framework`] - resource contract, pipeline, router and decorators
//! - [`resources`] - one resource per managed kind
//! - [`manifests`] - builders for the desired child objects
//! - [`diff`] - set difference of current and desired objects
//! - [`merge`] - annotation tracked three-way merge
//! - [`store`] - object access behind a trait
//! - [`error`] - Error types for operator operations
//! - [`health`] - liveness and readiness probes
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: provider.giantswarm.io/v1alpha1
//! kind: KvmCluster
//! metadata:
//!   name: al9qy
//! spec:
//!   cluster:
//!     id: al9qy
//!     customerId: acme
//!     masters:
//!       - id: m1
//!     workers:
//!       - id: w1
//!         cpus: 4
//!         memory: 8G
//!   versionBundle:
//!     version: 1.1.0
//! ```
//!
//! ## Metrics
//!
//! - `kvm_operator_reconciliations_total` - Total reconciliation attempts
//! - `kvm_operator_reconciliation_errors_total` - Reconciliation errors
//! - `kvm_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `kvm_operator_resource_action_total` - Creates, updates and deletes per kind
//! - `kvm_operator_resource_action_milliseconds` - Duration of the last action
//! - `kvm_operator_resource_error_total` - Failed resource phases
//! - `kvm_operator_version_bundle_version_total` - Objects per version bundle

pub mod config;
pub mod controller;
pub mod crd;
pub mod diff;
pub mod error;
pub mod framework;
pub mod health;
pub mod key;
pub mod manifests;
pub mod merge;
pub mod pod_controller;
pub mod resources;
pub mod store;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::{ManifestConfig, OperatorConfig};
    pub use crate::controller::{run_controller, ControllerContext, ControllerMetrics};
    pub use crate::crd::{ClusterSpec, KvmCluster, KvmClusterSpec, KvmClusterStatus, NodeSpec};
    pub use crate::error::{OperatorError, Result};
    pub use crate::framework::metrics::MetricsRegistry;
    pub use crate::framework::{
        Framework, Handler, PassOutcome, ReconcileContext, ReconcileEvent, Resource,
    };
    pub use crate::pod_controller::{run_pod_controller, PodControllerContext};
}

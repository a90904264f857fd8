//! Operator configuration
//!
//! Built once at startup from the command line and handed to the
//! controllers; nothing in here changes while the operator runs.

use crate::error::{OperatorError, Result};
use crate::framework::retry::RetryConfig;
use std::time::Duration;

/// Default interval between periodic resyncs of a healthy cluster
pub const DEFAULT_RESYNC_SECONDS: u64 = 300;

/// Settings of the generated child objects
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// Image of the container running the node's virtual machine
    pub kvm_image: String,
    /// Base domain for the guest API and etcd ingresses
    pub ingress_domain: String,
    /// Storage class of master etcd volumes, cluster default when unset
    pub storage_class: Option<String>,
    /// Size of master etcd volumes
    pub etcd_volume_size: String,
    /// Host directory backing etcd of clusters on the legacy resource set
    pub etcd_host_path: String,
    /// Cluster role bound to the guest cluster service account
    pub cluster_role: String,
    /// Pod security policy cluster role bound to the guest service account
    pub psp_cluster_role: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            kvm_image: "quay.io/giantswarm/k8s-kvm:latest".to_string(),
            ingress_domain: "k8s.local".to_string(),
            storage_class: None,
            etcd_volume_size: "15Gi".to_string(),
            etcd_host_path: "/var/lib/etcd".to_string(),
            cluster_role: "kvm-operator-guest".to_string(),
            psp_cluster_role: "kvm-operator-guest-psp".to_string(),
        }
    }
}

/// Everything the controllers need besides the Kubernetes client
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, `None` for cluster wide
    pub namespace: Option<String>,
    /// Requeue interval after a successful pass
    pub resync_period: Duration,
    /// Retry policy wrapped around every resource phase
    pub retry: RetryConfig,
    pub manifests: ManifestConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            retry: RetryConfig::default(),
            manifests: ManifestConfig::default(),
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resync_period.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "resync period must be greater than zero".to_string(),
            ));
        }
        if self.manifests.kvm_image.trim().is_empty() {
            return Err(OperatorError::InvalidConfig(
                "kvm image must not be empty".to_string(),
            ));
        }
        if self.manifests.ingress_domain.trim().is_empty() {
            return Err(OperatorError::InvalidConfig(
                "ingress domain must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resync_period, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_rejects_zero_resync() {
        let config = OperatorConfig {
            resync_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_image() {
        let mut config = OperatorConfig::default();
        config.manifests.kvm_image = " ".to_string();
        assert!(config.validate().is_err());
    }
}

//! Controller configuration
//!
//! Tunables for the health-check controller, loaded once at startup from a
//! mounted YAML file. Tests substitute values by building a `Context` with a
//! bespoke config; nothing here is process-global.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Coordination lease configuration
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Remediation timing configuration
    #[serde(default)]
    pub remediation: RemediationConfig,

    /// Periodic full-resync interval in seconds; bounds detection latency
    /// for condition-duration thresholds even without node events
    #[serde(default = "default_resync_seconds", rename = "resyncSeconds")]
    pub resync_seconds: u64,

    /// Whether the OpenShift collaborators (cluster-version upgrade probe,
    /// machine health checker observer) are wired in
    #[serde(default, rename = "openshiftIntegration")]
    pub openshift_integration: bool,
}

/// Coordination lease configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseConfig {
    /// Namespace the per-node leases are created in
    #[serde(default = "default_lease_namespace")]
    pub namespace: String,

    /// Default lease hold duration in seconds, used when an escalation step
    /// has no timeout of its own
    #[serde(default = "default_lease_duration", rename = "durationSeconds")]
    pub duration_seconds: u64,

    /// Safety buffer added on top of the requested hold duration
    #[serde(default = "default_lease_buffer", rename = "bufferSeconds")]
    pub buffer_seconds: u64,

    /// How long to wait before retrying a lease held by someone else
    #[serde(default = "default_lease_retry", rename = "retrySeconds")]
    pub retry_seconds: u64,
}

/// Remediation timing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemediationConfig {
    /// Age after which a request object that has not recovered its node is
    /// flagged as stale
    #[serde(default = "default_stale_hours", rename = "staleRequestHours")]
    pub stale_request_hours: u64,

    /// How long a request may report Succeeded=False before the attempt is
    /// failed over early
    #[serde(
        default = "default_progressing_timeout",
        rename = "progressingHardTimeoutSeconds"
    )]
    pub progressing_hard_timeout_seconds: u64,

    /// Requeue interval while the cluster is upgrading
    #[serde(
        default = "default_upgrade_requeue",
        rename = "upgradeRequeueSeconds"
    )]
    pub upgrade_requeue_seconds: u64,
}

fn default_lease_namespace() -> String {
    "node-healthcheck-leases".to_string()
}
fn default_lease_duration() -> u64 {
    60
}
fn default_lease_buffer() -> u64 {
    5
}
fn default_lease_retry() -> u64 {
    10
}
fn default_stale_hours() -> u64 {
    48
}
fn default_progressing_timeout() -> u64 {
    300
}
fn default_upgrade_requeue() -> u64 {
    60
}
fn default_resync_seconds() -> u64 {
    60
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            namespace: default_lease_namespace(),
            duration_seconds: default_lease_duration(),
            buffer_seconds: default_lease_buffer(),
            retry_seconds: default_lease_retry(),
        }
    }
}

impl Default for RemediationConfig {
    fn default() -> Self {
        RemediationConfig {
            stale_request_hours: default_stale_hours(),
            progressing_hard_timeout_seconds: default_progressing_timeout(),
            upgrade_requeue_seconds: default_upgrade_requeue(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            lease: LeaseConfig::default(),
            remediation: RemediationConfig::default(),
            resync_seconds: default_resync_seconds(),
            openshift_integration: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.lease.namespace.is_empty() {
            return Err("lease.namespace must not be empty".to_string());
        }
        if self.lease.duration_seconds == 0 {
            return Err("lease.durationSeconds must be positive".to_string());
        }
        if self.lease.retry_seconds == 0 {
            return Err("lease.retrySeconds must be positive".to_string());
        }
        if self.resync_seconds == 0 {
            return Err("resyncSeconds must be positive".to_string());
        }
        Ok(())
    }

    /// Requeue delay when a lease is contended
    #[must_use]
    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_secs(self.lease.retry_seconds)
    }

    /// Requeue delay while the cluster is upgrading
    #[must_use]
    pub fn upgrade_requeue(&self) -> Duration {
        Duration::from_secs(self.remediation.upgrade_requeue_seconds)
    }

    /// Age threshold for the stale-request alert
    #[must_use]
    pub fn stale_request_timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(self.remediation.stale_request_hours as i64)
    }

    /// Succeeded=False hard timeout for early failover
    #[must_use]
    pub fn progressing_hard_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.remediation.progressing_hard_timeout_seconds as i64)
    }

    /// Periodic full-resync interval
    #[must_use]
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.lease.namespace, "node-healthcheck-leases");
        assert_eq!(config.lease.duration_seconds, 60);
        assert_eq!(config.lease.buffer_seconds, 5);
        assert_eq!(config.remediation.stale_request_hours, 48);
        assert_eq!(config.resync_seconds, 60);
        assert!(!config.openshift_integration);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r"
lease:
  namespace: custom-leases
  retrySeconds: 30
remediation:
  staleRequestHours: 24
";
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.lease.namespace, "custom-leases");
        assert_eq!(config.lease.retry_seconds, 30);
        // untouched fields keep their defaults
        assert_eq!(config.lease.duration_seconds, 60);
        assert_eq!(config.remediation.stale_request_hours, 24);
        assert_eq!(config.resync_seconds, 60);
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = ControllerConfig::default();
        config.resync_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.lease.duration_seconds = 0;
        assert!(config.validate().is_err());
    }
}

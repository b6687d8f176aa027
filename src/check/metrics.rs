//! Controller metrics
//!
//! Counter vector for stale remediation requests, sampled once per
//! (request object, first stale detection) and exported through the
//! binary's `/metrics` endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Shared metrics registry
#[derive(Clone, Default)]
pub struct Metrics {
    /// (node, namespace) -> number of first-stale detections
    old_remediation_cr: Arc<RwLock<HashMap<(String, String), u64>>>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a remediation request for `node` crossed the stale
    /// threshold for the first time
    pub async fn observe_old_remediation_cr(&self, node: &str, namespace: &str) {
        let mut counters = self.old_remediation_cr.write().await;
        let count = counters
            .entry((node.to_string(), namespace.to_string()))
            .or_insert(0);
        *count += 1;
        debug!(node, namespace, count = *count, "observed stale remediation request");
    }

    /// Snapshot of the stale-request counter vector, keyed
    /// `<namespace>/<node>`
    pub async fn old_remediation_cr_snapshot(&self) -> HashMap<String, u64> {
        self.old_remediation_cr
            .read()
            .await
            .iter()
            .map(|((node, namespace), count)| (format!("{namespace}/{node}"), *count))
            .collect()
    }
}

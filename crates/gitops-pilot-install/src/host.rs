//! Host discovery
//!
//! Polls the Argo CD server service until its load balancer has an ingress
//! address.

use std::time::Duration;

use gitops_pilot_core::{RetryError, RetryPolicy, ServiceEndpoint, retry};
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::cluster::ClusterApi;
use crate::error::{InstallError, KubeError};

/// Delay between service lookups
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Wall-clock budget for the whole discovery
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

/// Why one lookup did not produce an address
#[derive(Debug, Error)]
enum NotReady {
    #[error("no service matches {0}")]
    NoService(String),

    #[error("load balancer has no ingress yet")]
    Pending,

    #[error(transparent)]
    Api(#[from] KubeError),
}

/// The default discovery policy
pub fn discovery_policy() -> RetryPolicy {
    RetryPolicy::poll(POLL_INTERVAL, DISCOVERY_TIMEOUT)
}

/// Wait for the service selected by `selector` to get an external address.
///
/// Every failure counts as "not ready yet"; only the time budget ends the
/// wait early.
pub async fn discover_host(
    cluster: &dyn ClusterApi,
    namespace: &str,
    selector: &str,
    policy: &RetryPolicy,
) -> Result<ServiceEndpoint, InstallError> {
    let lookup = || async move {
        match cluster.service_endpoint(namespace, selector).await {
            Ok(Some(endpoint)) => Ok(endpoint),
            Ok(None) => Err(NotReady::Pending),
            Err(KubeError::ServiceNotFound(s)) => Err(NotReady::NoService(s)),
            Err(e) => Err(NotReady::Api(e)),
        }
    };

    let start = Instant::now();
    match retry(policy, "retrieve argo host", |_: &NotReady| true, lookup).await {
        Ok(endpoint) => {
            info!(host = %endpoint, "argo host resolved");
            Ok(endpoint)
        }
        Err(RetryError::TimedOut {
            attempts,
            elapsed,
            last,
        }) => Err(InstallError::HostDiscoveryTimeout {
            elapsed,
            attempts,
            last: last.to_string(),
        }),
        Err(other) => {
            let attempts = other.attempts();
            Err(InstallError::HostDiscoveryTimeout {
                elapsed: start.elapsed(),
                attempts,
                last: other.into_last().to_string(),
            })
        }
    }
}

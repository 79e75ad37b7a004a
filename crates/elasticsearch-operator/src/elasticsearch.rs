//! The narrow Elasticsearch-facing seam used around coordinated restarts.
//!
//! The full cluster HTTP client lives outside this core; the restart
//! controller only needs the three calls below plus a readiness probe of
//! the cluster's external service.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use snafu::Snafu;

use crate::client::{self, ObjectStore};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Elasticsearch {operation} call failed: {message}"))]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl Error {
    pub fn api(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Api {
            operation,
            message: message.into(),
        }
    }
}

/// Cluster-level settings calls performed while stopping and starting
/// nodes.
#[async_trait]
pub trait ElasticsearchClient: Send + Sync {
    /// Sets `cluster.routing.allocation.enable` to `primaries`, so replica
    /// shards stay put while nodes go down.
    async fn disable_replicas_shard_allocation(&self) -> Result<()>;

    /// Re-enables shard allocation after all nodes are back.
    async fn enable_shard_allocation(&self) -> Result<()>;

    /// Performs a synced flush. Purely an optimization for recovery speed;
    /// callers treat failures as non-fatal.
    async fn synced_flush(&self) -> Result<()>;
}

/// Whether the cluster's external service has at least one ready endpoint
/// address.
pub async fn is_service_ready<S>(
    store: &S,
    namespace: &str,
    service_name: &str,
) -> Result<bool, client::Error>
where
    S: ObjectStore,
{
    let endpoints: Option<Endpoints> = store.get(namespace, service_name).await?;

    Ok(endpoints.is_some_and(|endpoints| {
        endpoints.subsets.unwrap_or_default().iter().any(|subset| {
            subset
                .addresses
                .as_ref()
                .is_some_and(|addresses| !addresses.is_empty())
        })
    }))
}

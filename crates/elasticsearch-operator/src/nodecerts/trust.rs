//! The per-node trust-restrictions document (`trust.yml`).
//!
//! Elasticsearch restricts which certificate subjects may join the cluster;
//! the operator renders the allowed subject patterns into each node
//! certificate secret. Change detection is byte equality of the serialized
//! document, so rendering must stay deterministic.

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize trust restrictions"))]
    Serialize { source: serde_yaml::Error },
}

/// `{trust: {subject_name: [...]}}`, as consumed by Elasticsearch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRestrictions {
    pub trust: Trust,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    pub subject_name: Vec<String>,
}

/// An external trust declaration: extra CA material and subject patterns
/// merged into every node's trust configuration. The custom resource
/// carrying these lives outside this core.
#[derive(Clone, Debug, Default)]
pub struct TrustRelationship {
    pub name: String,
    /// Additional trusted CA certificates, PEM.
    pub ca_cert: String,
    pub trust_restrictions: TrustRestrictions,
}

/// The subject pattern matching every node of the cluster.
pub fn trust_pattern(owner_name: &str, namespace: &str) -> String {
    format!("*.node.{owner_name}.{namespace}.es.cluster.local")
}

/// Builds the cluster's trust restrictions: the default node pattern first,
/// then the patterns of each relationship in list order. Duplicates are
/// kept, Elasticsearch accepts them.
pub fn build_trust_restrictions(
    owner_name: &str,
    namespace: &str,
    relationships: &[TrustRelationship],
) -> TrustRestrictions {
    let mut subject_name = vec![trust_pattern(owner_name, namespace)];
    for relationship in relationships {
        subject_name.extend(
            relationship
                .trust_restrictions
                .trust
                .subject_name
                .iter()
                .cloned(),
        );
    }

    TrustRestrictions {
        trust: Trust { subject_name },
    }
}

/// The document bytes stored under `trust.yml`.
pub fn serialize_trust_restrictions(restrictions: &TrustRestrictions) -> Result<Vec<u8>> {
    serde_yaml::to_string(restrictions)
        .map(String::into_bytes)
        .context(SerializeSnafu)
}

/// The additional trusted CA PEM blobs, in relationship list order.
pub fn additional_ca_certs(relationships: &[TrustRelationship]) -> Vec<String> {
    relationships
        .iter()
        .filter(|relationship| !relationship.ca_cert.is_empty())
        .map(|relationship| relationship.ca_cert.clone())
        .collect()
}

//! The annotation, label and secret-key vocabulary shared with nodes and
//! other controllers. Everything here is boundary-visible: changing a value
//! breaks running clusters.

use std::collections::BTreeMap;

/// Stamped on every managed resource the operator writes.
pub const CONTROLLER_VERSION_ANNOTATION: &str = "k8s.elastic.co/controller-version";

/// Poked on a pod after its certificate secret changed, to expedite kubelet
/// mount propagation.
pub const POD_UPDATE_TIMESTAMP_ANNOTATION: &str = "update.k8s.elastic.co/timestamp";

/// On the owning cluster object: requests a fresh restart cycle, value is
/// the strategy.
pub const CLUSTER_RESTART_ANNOTATION: &str = "elasticsearch.k8s.elastic.co/restart";

/// Per-pod restart state.
pub const RESTART_PHASE_ANNOTATION: &str = "elasticsearch.k8s.elastic.co/restart-phase";
pub const RESTART_STRATEGY_ANNOTATION: &str = "elasticsearch.k8s.elastic.co/restart-strategy";
pub const RESTART_START_TIME_ANNOTATION: &str = "elasticsearch.k8s.elastic.co/restart-start-time";

/// On a node certificate secret: RFC3339 timestamp of the last CSR refresh.
pub const LAST_CSR_UPDATE_ANNOTATION: &str =
    "nodecerts.elasticsearch.k8s.elastic.co/last-csr-update";

/// Name of the owning cluster, on every resource belonging to it.
pub const CLUSTER_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/cluster-name";

pub const SECRET_USAGE_LABEL: &str = "nodecerts.elasticsearch.k8s.elastic.co/secret-usage";
pub const SECRET_USAGE_NODE_CERTIFICATES: &str = "node-certificates";

pub const CERTIFICATE_TYPE_LABEL: &str =
    "nodecerts.elasticsearch.k8s.elastic.co/node-certificate-type";
pub const CERTIFICATE_TYPE_ELASTICSEARCH_ALL: &str = "elasticsearch.all";

/// Pod a node certificate secret belongs to.
pub const ASSOCIATED_POD_LABEL: &str = "nodecerts.elasticsearch.k8s.elastic.co/associated-pod";

/// Keys inside certificate secrets.
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CERT_KEY: &str = "tls.crt";
pub const PRIVATE_KEY_KEY: &str = "tls.key";
pub const CSR_KEY: &str = "tls.csr";
pub const TRUST_RESTRICTIONS_KEY: &str = "trust.yml";

/// Records the operator version on a resource it is about to write.
pub fn stamp_controller_version(annotations: &mut BTreeMap<String, String>) {
    annotations.insert(
        CONTROLLER_VERSION_ANNOTATION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
}

/// The full label set of a node certificate secret.
pub fn node_certificate_labels(cluster_name: &str, pod_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (
            SECRET_USAGE_LABEL.to_string(),
            SECRET_USAGE_NODE_CERTIFICATES.to_string(),
        ),
        (
            CERTIFICATE_TYPE_LABEL.to_string(),
            CERTIFICATE_TYPE_ELASTICSEARCH_ALL.to_string(),
        ),
        (ASSOCIATED_POD_LABEL.to_string(), pod_name.to_string()),
    ])
}

/// Label selector matching all node certificate secrets of a cluster.
pub fn node_certificate_selector(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (
            SECRET_USAGE_LABEL.to_string(),
            SECRET_USAGE_NODE_CERTIFICATES.to_string(),
        ),
    ])
}

/// Labels on cluster-scoped certificate secrets (CA material, public certs).
pub fn cluster_secret_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_certificate_labels_match_their_selector() {
        let labels = node_certificate_labels("foo", "foo-es-0");
        let selector = node_certificate_selector("foo");

        for (key, value) in &selector {
            assert_eq!(labels.get(key), Some(value));
        }
        assert_eq!(labels.get(ASSOCIATED_POD_LABEL).unwrap(), "foo-es-0");
    }
}

//! Node certificate issuance.
//!
//! Every Elasticsearch pod owns a certificate secret holding its signing
//! request, its signed leaf certificate, the CA trust bundle, and the
//! trust-restrictions document. The driver below walks all of a cluster's
//! certificate secrets each reconciliation pass, garbage-collects orphans,
//! and hands live ones to the per-pod issuer.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use snafu::ResultExt;
use tracing::{debug, info, instrument, warn};

use crate::{
    Duration,
    client::{ObjectStore, StoreObject},
    labels,
    names::Namer,
    pods,
};

pub mod csr;
pub mod issuer;
pub mod template;
pub mod trust;

pub use issuer::{
    CERT_INITIALIZER_CONTAINER_NAME, CSR_REQUEST_DELAY, Error, NodeCertContext, Result,
    ensure_node_certificate_secret_exists, reconcile_node_certificate,
    should_issue_new_certificate,
};

/// How long an orphaned certificate secret (no associated pod) survives
/// before it is deleted. Young orphans are kept: their pod may simply not
/// be visible yet.
pub const ORPHAN_SECRET_GRACE_PERIOD: Duration = Duration::from_minutes(5);

/// Reconciles all node certificate secrets of a cluster.
///
/// Member pods get a placeholder secret when missing; stored secrets whose
/// pod vanished are garbage-collected after [`ORPHAN_SECRET_GRACE_PERIOD`];
/// the rest are reconciled one by one.
#[instrument(skip_all, fields(owner = %owner.name_any()))]
pub async fn reconcile_node_certificate_secrets<S, C, O>(
    ctx: &NodeCertContext<'_, S, C>,
    namer: &Namer,
    owner: &O,
    pods: &[Pod],
) -> Result<()>
where
    S: ObjectStore,
    C: csr::CsrClient,
    O: StoreObject,
{
    for pod in pods {
        ensure_node_certificate_secret_exists(ctx.store, namer, owner, pod).await?;
    }

    let secrets: Vec<Secret> = ctx
        .store
        .list(
            ctx.namespace,
            &labels::node_certificate_selector(ctx.owner_name),
        )
        .await
        .context(issuer::StoreSnafu)?;

    for secret in secrets {
        let secret_name = secret.name_any();
        let Some(pod_name) = secret.labels().get(labels::ASSOCIATED_POD_LABEL).cloned() else {
            warn!(
                secret = %secret_name,
                "node certificate secret without associated-pod label, skipping"
            );
            continue;
        };

        let pod: Option<Pod> = ctx
            .store
            .get(ctx.namespace, &pod_name)
            .await
            .context(issuer::StoreSnafu)?;

        let Some(pod) = pod else {
            garbage_collect_orphan(ctx.store, ctx.namespace, &secret).await?;
            continue;
        };

        if pods::pod_ip(&pod).is_none() {
            debug!(pod = %pod_name, "pod has no IP yet, skipping");
            continue;
        }

        match secret
            .labels()
            .get(labels::CERTIFICATE_TYPE_LABEL)
            .map(String::as_str)
        {
            Some(labels::CERTIFICATE_TYPE_ELASTICSEARCH_ALL) => {
                reconcile_node_certificate(ctx, secret, &pod).await?;
            }
            certificate_type => {
                warn!(
                    secret = %secret_name,
                    certificate_type, "unknown certificate type, skipping"
                );
            }
        }
    }

    Ok(())
}

/// Deletes an orphaned certificate secret once it outlived the grace
/// period; younger orphans are left alone.
async fn garbage_collect_orphan<S>(store: &S, namespace: &str, secret: &Secret) -> Result<()>
where
    S: ObjectStore,
{
    let Some(created) = secret.metadata.creation_timestamp.as_ref() else {
        // without a creation timestamp the age is unknowable; keep it
        return Ok(());
    };

    let age = Utc::now().signed_duration_since(created.0);
    if age <= ORPHAN_SECRET_GRACE_PERIOD.as_chrono() {
        debug!(
            secret = %secret.name_any(),
            "orphaned certificate secret is within the grace period, keeping"
        );
        return Ok(());
    }

    info!(
        secret = %secret.name_any(),
        "deleting orphaned node certificate secret"
    );
    store
        .delete::<Secret>(namespace, &secret.name_any())
        .await
        .context(issuer::StoreSnafu)
}

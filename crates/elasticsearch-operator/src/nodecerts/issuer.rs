//! Per-pod node certificate reconciliation.
//!
//! One pass over a pod's certificate secret: refresh the CSR from the init
//! container when allowed, issue or re-issue the leaf certificate when
//! needed, and keep the trust bundle and trust-restrictions document in
//! sync. All writes are compared first, so an up-to-date secret makes the
//! pass a no-op.

use std::{collections::BTreeMap, net::IpAddr, time::SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use elasticsearch_certs::{ca::CertificateAuthority, common_name, pem, template::{
    due_for_rotation, subject_alt_names_extension,
}};
use k8s_openapi::{
    ByteString,
    api::core::v1::{Pod, Secret, Service},
};
use kube::{Resource, ResourceExt};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};
use x509_cert::{der::{Decode, Encode}, request::CertReq};

use crate::{
    Duration,
    certificates::RotationParams,
    client::{self, ObjectStore, StoreObject, apply_annotations},
    labels,
    nodecerts::{
        csr::{self, CsrClient},
        template::{ExpectedNodeCertificate, create_validated_certificate_template},
    },
    pods,
};

/// Init container whose `Running` state gates CSR retrieval.
pub const CERT_INITIALIZER_CONTAINER_NAME: &str = "cert-initializer";

/// Minimum spacing between two CSR requests to the same pod.
pub const CSR_REQUEST_DELAY: Duration = Duration::from_minutes(1);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object store access failed"))]
    Store { source: client::Error },

    #[snafu(display("failed to retrieve CSR from pod {pod}"))]
    RetrieveCsr { source: csr::Error, pod: String },

    #[snafu(display("failed to parse stored CSR"))]
    ParseCsr { source: x509_cert::der::Error },

    #[snafu(display("failed to compute expected certificate contents"))]
    ExpectedCertificate {
        source: crate::nodecerts::template::Error,
    },

    #[snafu(display("failed to validate certificate template"))]
    ValidateTemplate {
        source: crate::nodecerts::template::Error,
    },

    #[snafu(display("failed to sign node certificate"))]
    SignCertificate {
        source: elasticsearch_certs::ca::Error,
    },

    #[snafu(display("failed to serialize CA material"))]
    SerializeCa {
        source: elasticsearch_certs::ca::Error,
    },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: x509_cert::der::Error },
}

/// Everything a per-pod reconciliation needs besides the secret and pod
/// themselves.
pub struct NodeCertContext<'a, S, C> {
    pub store: &'a S,
    pub csr_client: &'a C,
    pub owner_name: &'a str,
    pub namespace: &'a str,
    pub ca: &'a CertificateAuthority,
    pub services: &'a [Service],
    pub extra_san_ips: &'a [IpAddr],
    /// Additional trusted CA certificates (PEM), in trust-relationship
    /// list order.
    pub additional_ca_certs: &'a [String],
    /// Serialized trust-restrictions document.
    pub trust_restrictions: &'a [u8],
    pub rotation: RotationParams,
}

/// Reconciles one pod's certificate secret. The secret may be a fresh
/// placeholder without data or annotations.
#[instrument(skip_all, fields(pod = %pod.name_any(), secret = %secret.name_any()))]
pub async fn reconcile_node_certificate<S, C>(
    ctx: &NodeCertContext<'_, S, C>,
    mut secret: Secret,
    pod: &Pod,
) -> Result<()>
where
    S: ObjectStore,
    C: CsrClient,
{
    let mut data = secret.data.take().unwrap_or_default();
    let mut annotations = secret.metadata.annotations.take().unwrap_or_default();

    let mut csr_bytes = data
        .get(labels::CSR_KEY)
        .map(|bytes| bytes.0.clone())
        .unwrap_or_default();
    let mut last_csr_update = annotations
        .get(labels::LAST_CSR_UPDATE_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    let expected = ExpectedNodeCertificate::for_pod(
        pod,
        ctx.owner_name,
        ctx.namespace,
        ctx.services,
        ctx.extra_san_ips,
    )
    .context(ExpectedCertificateSnafu)?;

    let mut issue_new_certificate = should_issue_new_certificate(
        &data,
        ctx.ca,
        &expected,
        SystemTime::now(),
        ctx.rotation,
    );

    // A pod only serves its CSR while the cert-initializer runs, and we
    // never hammer it: at most one request per minute per pod.
    if should_request_csr(&last_csr_update, Utc::now())
        && pods::is_init_container_running(pod, CERT_INITIALIZER_CONTAINER_NAME)
    {
        let retrieved = ctx
            .csr_client
            .retrieve_candidate_csr(pod)
            .await
            .context(RetrieveCsrSnafu {
                pod: pod.name_any(),
            })?;

        if !retrieved.is_empty() && retrieved != csr_bytes {
            debug!("pod serves a new CSR");
            csr_bytes = retrieved;
            issue_new_certificate = true;
            last_csr_update = Utc::now().to_rfc3339();
        }
    }

    if csr_bytes.is_empty() {
        debug!("no CSR available yet, waiting for the next pass");
        return Ok(());
    }

    let mut changed = false;

    if issue_new_certificate {
        let csr = CertReq::from_der(&csr_bytes).context(ParseCsrSnafu)?;
        let template = create_validated_certificate_template(
            ctx.owner_name,
            &csr,
            &expected,
            *ctx.rotation.validity,
        )
        .context(ValidateTemplateSnafu)?;
        let leaf_der = ctx
            .ca
            .create_certificate(&template)
            .context(SignCertificateSnafu)?;
        let ca_der = ctx
            .ca
            .certificate()
            .to_der()
            .context(SerializeCertificateSnafu)?;
        let chain = pem::encode_certificates([&leaf_der, &ca_der]);

        data.insert(labels::CSR_KEY.to_string(), ByteString(csr_bytes.clone()));
        data.insert(labels::CERT_KEY.to_string(), ByteString(chain.into_bytes()));
        annotations.insert(
            labels::LAST_CSR_UPDATE_ANNOTATION.to_string(),
            last_csr_update.clone(),
        );
        changed = true;
        info!(common_name = %expected.common_name, "issued node certificate");
    }

    // trust bundle: our CA first, then the additional CAs in list order
    let mut trust_bundle = ctx.ca.certificate_pem().context(SerializeCaSnafu)?;
    for extra in ctx.additional_ca_certs {
        trust_bundle.push_str(extra);
    }
    if data.get(labels::CA_CERT_KEY).map(|bytes| bytes.0.as_slice())
        != Some(trust_bundle.as_bytes())
    {
        data.insert(
            labels::CA_CERT_KEY.to_string(),
            ByteString(trust_bundle.into_bytes()),
        );
        changed = true;
    }

    if data
        .get(labels::TRUST_RESTRICTIONS_KEY)
        .map(|bytes| bytes.0.as_slice())
        != Some(ctx.trust_restrictions)
    {
        data.insert(
            labels::TRUST_RESTRICTIONS_KEY.to_string(),
            ByteString(ctx.trust_restrictions.to_vec()),
        );
        changed = true;
    }

    if changed {
        labels::stamp_controller_version(&mut annotations);
        secret.data = Some(data);
        secret.metadata.annotations = Some(annotations);
        ctx.store.update(&secret).await.context(StoreSnafu)?;

        // poke the pod so the kubelet refreshes the secret mount sooner;
        // purely an acceleration, so failures only get logged
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        if let Err(error) = apply_annotations(
            ctx.store,
            pod,
            BTreeMap::from([(labels::POD_UPDATE_TIMESTAMP_ANNOTATION, Some(timestamp))]),
        )
        .await
        {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to annotate pod after certificate update"
            );
        }
    }

    Ok(())
}

/// Whether a fresh leaf certificate must be issued for this secret.
///
/// True when the stored certificate is missing or unparseable, carries the
/// wrong common name, does not verify against the current CA, is within
/// the rotation margin of expiry, or its subject-alternative-names
/// extension differs byte-for-byte from the expected one.
pub fn should_issue_new_certificate(
    data: &BTreeMap<String, ByteString>,
    ca: &CertificateAuthority,
    expected: &ExpectedNodeCertificate,
    now: SystemTime,
    rotation: RotationParams,
) -> bool {
    let Some(certificate_bytes) = data.get(labels::CERT_KEY) else {
        info!("no certificate found, issuing a new one");
        return true;
    };

    let Ok(chain) = pem::parse_certificates(&certificate_bytes.0) else {
        info!("stored certificate does not parse, issuing a new one");
        return true;
    };

    let Some(certificate) = chain.iter().find(|certificate| {
        common_name(&certificate.tbs_certificate.subject).as_deref()
            == Some(expected.common_name.as_str())
    }) else {
        info!(
            common_name = %expected.common_name,
            "no certificate with the expected common name, issuing a new one"
        );
        return true;
    };

    if let Err(error) = ca.verify_issued(certificate, now) {
        info!(
            error = &error as &dyn std::error::Error,
            "certificate does not verify against the current CA, issuing a new one"
        );
        return true;
    }

    if due_for_rotation(certificate, now, *rotation.rotate_before) {
        info!("certificate is due for rotation, issuing a new one");
        return true;
    }

    match subject_alt_names_extension(certificate) {
        Some(extension)
            if extension.extn_value.as_bytes() == expected.subject_alt_names_der =>
        {
            false
        }
        _ => {
            info!("subject alternative names changed, issuing a new one");
            true
        }
    }
}

/// Whether enough time passed since the last CSR refresh to ask the pod
/// again. An unparseable or missing timestamp always allows a request.
fn should_request_csr(last_csr_update: &str, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(last_csr_update) {
        Ok(last_update) => {
            let elapsed = now.signed_duration_since(last_update.with_timezone(&Utc));
            // negative elapsed time means a clock jumped; treat as stale
            !(elapsed > chrono::TimeDelta::zero() && elapsed < CSR_REQUEST_DELAY.as_chrono())
        }
        Err(_) => true,
    }
}

/// Ensures the labelled placeholder secret for a pod exists, so the next
/// reconciliation pass can fill it. Called for every member pod; the
/// pod-creation flow relies on it too.
pub async fn ensure_node_certificate_secret_exists<S, O>(
    store: &S,
    namer: &crate::names::Namer,
    owner: &O,
    pod: &Pod,
) -> Result<Secret>
where
    S: ObjectStore,
    O: StoreObject,
{
    use kube::api::ObjectMeta;

    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();
    let secret_name = crate::names::node_certificate_secret_name(namer, &pod_name);

    if let Some(existing) = store
        .get::<Secret>(&namespace, &secret_name)
        .await
        .context(StoreSnafu)?
    {
        return Ok(existing);
    }

    let mut annotations = BTreeMap::new();
    labels::stamp_controller_version(&mut annotations);

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name),
            namespace: Some(namespace),
            labels: Some(labels::node_certificate_labels(
                &owner.name_any(),
                &pod_name,
            )),
            annotations: Some(annotations),
            owner_references: owner.controller_owner_ref(&()).map(|reference| vec![reference]),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    };
    store.create(&secret).await.context(StoreSnafu)?;

    debug!(pod = %pod_name, "created node certificate placeholder secret");
    Ok(secret)
}

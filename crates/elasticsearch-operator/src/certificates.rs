//! Per-cluster certificate authority reconciliation.
//!
//! Every owning cluster gets one CA per role (transport and HTTP), stored
//! in a dedicated secret. Reconciliation reads the stored material back,
//! reuses it while it is healthy, and renews it when it is missing,
//! unparseable, not yet valid, or within the rotation margin of expiry.
//! Rotation never cross-signs; consumers pick up the new CA on their next
//! pass.

use std::{collections::BTreeMap, time::SystemTime};

use elasticsearch_certs::{
    ca::{CertificateAuthority, SelfSignedOptions},
    keys::{SigningKey, private_matches_public_key},
    pem,
    template::due_for_rotation,
};
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use rand::{Rng, distributions::Alphanumeric};
use rsa::{RsaPublicKey, pkcs1::DecodeRsaPublicKey};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};

use crate::{
    Duration,
    client::{self, ObjectStore, StoreObject},
    labels,
    names::{self, Namer},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object store access failed"))]
    Store { source: client::Error },

    #[snafu(display("failed to build a new certificate authority"))]
    BuildCa {
        source: elasticsearch_certs::ca::Error,
    },

    #[snafu(display("failed to serialize certificate authority material"))]
    SerializeCa {
        source: elasticsearch_certs::ca::Error,
    },

    #[snafu(display("owning object has no namespace"))]
    MissingNamespace,

    #[snafu(display("owning object cannot own resources, it has no uid"))]
    MissingOwnerReference,
}

/// The two per-cluster CA roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum CaRole {
    /// Issues certificates for the inter-node transport layer.
    Transport,
    /// Issues certificates for the HTTP layer, including the process
    /// manager endpoints.
    Http,
}

/// How long issued certificates live and how far before expiry they are
/// replaced.
#[derive(Clone, Copy, Debug)]
pub struct RotationParams {
    pub validity: Duration,
    pub rotate_before: Duration,
}

impl RotationParams {
    /// Panics when `rotate_before` does not leave a usable validity window;
    /// that is a configuration bug, not a runtime condition.
    pub fn new(validity: Duration, rotate_before: Duration) -> Self {
        assert!(
            rotate_before < validity,
            "rotate_before ({rotate_before}) must be smaller than validity ({validity})"
        );

        Self {
            validity,
            rotate_before,
        }
    }
}

impl Default for RotationParams {
    fn default() -> Self {
        Self::new(Duration::from_days(365), Duration::from_hours(24))
    }
}

/// Reconciles the CA of `owner`/`role`: returns the stored CA when it can
/// still be used, otherwise creates, persists and returns a fresh one.
#[instrument(
    skip_all,
    fields(owner = %owner.name_any(), role = %role),
)]
pub async fn reconcile_ca_for_owner<S, O>(
    store: &S,
    namer: &Namer,
    owner: &O,
    role: CaRole,
    secret_labels: &BTreeMap<String, String>,
    rotation: RotationParams,
) -> Result<CertificateAuthority>
where
    S: ObjectStore,
    O: StoreObject,
{
    let namespace = owner.namespace().context(MissingNamespaceSnafu)?;
    let owner_name = owner.name_any();
    let secret_name = names::ca_internal_secret_name(namer, &owner_name, role.as_ref());

    let existing: Option<Secret> = store
        .get(&namespace, &secret_name)
        .await
        .context(StoreSnafu)?;

    if let Some(secret) = &existing {
        match parse_stored_ca(secret, &secret_name) {
            Some(ca) if can_reuse_ca(&ca, SystemTime::now(), rotation.rotate_before) => {
                debug!(secret = %secret_name, "reusing stored CA");
                return Ok(ca);
            }
            Some(_) => info!(secret = %secret_name, "stored CA is due for renewal"),
            None => info!(
                secret = %secret_name,
                "stored CA material is missing or invalid, renewing"
            ),
        }
    }

    renew_ca(
        store,
        owner,
        role,
        &owner_name,
        &secret_name,
        secret_labels,
        rotation,
        existing,
    )
    .await
}

/// Recovers a CA from the PEM entries of its storage secret. Any missing or
/// malformed part yields [`None`], which the caller turns into a renewal.
fn parse_stored_ca(secret: &Secret, secret_name: &str) -> Option<CertificateAuthority> {
    let data = secret.data.as_ref()?;
    let certificate_pem = data.get(labels::CERT_KEY)?;
    let private_key_pem = data.get(labels::PRIVATE_KEY_KEY)?;

    let certificates = pem::parse_certificates(&certificate_pem.0).ok()?;
    let certificate = match certificates.as_slice() {
        [] => return None,
        [certificate] => certificate.clone(),
        [first, ..] => {
            warn!(
                secret = %secret_name,
                count = certificates.len(),
                "more than one certificate in CA storage entry, using the first"
            );
            first.clone()
        }
    };

    let private_key = pem::parse_private_key(&private_key_pem.0).ok()?;

    Some(CertificateAuthority::from_parts(
        certificate,
        SigningKey::from_private_key(private_key),
    ))
}

/// A stored CA may be reused iff its private key belongs to its
/// certificate and `now` lies inside `[not_before, not_after −
/// rotate_before)`.
fn can_reuse_ca(ca: &CertificateAuthority, now: SystemTime, rotate_before: Duration) -> bool {
    let Ok(public_key) = RsaPublicKey::from_pkcs1_der(
        ca.certificate()
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    ) else {
        return false;
    };

    if !private_matches_public_key(&public_key, ca.key().private_key()) {
        return false;
    }

    let not_before = ca
        .certificate()
        .tbs_certificate
        .validity
        .not_before
        .to_system_time();

    now >= not_before && !due_for_rotation(ca.certificate(), now, *rotate_before)
}

#[allow(clippy::too_many_arguments)]
async fn renew_ca<S, O>(
    store: &S,
    owner: &O,
    role: CaRole,
    owner_name: &str,
    secret_name: &str,
    secret_labels: &BTreeMap<String, String>,
    rotation: RotationParams,
    existing: Option<Secret>,
) -> Result<CertificateAuthority>
where
    S: ObjectStore,
    O: StoreObject,
{
    let ca = CertificateAuthority::new_self_signed(
        SelfSignedOptions::default()
            .common_name(format!("{role}-{}", random_alphanumeric(16)))
            .organizational_unit(owner_name)
            .expire_in(*rotation.validity),
    )
    .context(BuildCaSnafu)?;

    let mut data = BTreeMap::new();
    data.insert(
        labels::CERT_KEY.to_string(),
        ByteString(ca.certificate_pem().context(SerializeCaSnafu)?.into_bytes()),
    );
    data.insert(
        labels::PRIVATE_KEY_KEY.to_string(),
        ByteString(
            ca.private_key_pem()
                .context(SerializeCaSnafu)?
                .as_bytes()
                .to_vec(),
        ),
    );

    let owner_reference = owner
        .controller_owner_ref(&())
        .context(MissingOwnerReferenceSnafu)?;

    match existing {
        Some(mut secret) => {
            secret.data = Some(data);
            decorate_metadata(&mut secret.metadata, secret_labels);
            secret.metadata.owner_references = Some(vec![owner_reference]);
            store.update(&secret).await.context(StoreSnafu)?;
        }
        None => {
            let mut metadata = ObjectMeta {
                name: Some(secret_name.to_string()),
                namespace: owner.namespace(),
                owner_references: Some(vec![owner_reference]),
                ..ObjectMeta::default()
            };
            decorate_metadata(&mut metadata, secret_labels);

            let secret = Secret {
                metadata,
                data: Some(data),
                ..Secret::default()
            };
            store.create(&secret).await.context(StoreSnafu)?;
        }
    }

    info!(secret = secret_name, "persisted renewed CA");
    Ok(ca)
}

/// Publishes the HTTP CA certificate in the cluster's public-certs secret,
/// where TLS clients (including the restart controller's process-manager
/// calls) pick up their trust roots.
#[instrument(skip_all, fields(owner = %owner.name_any()))]
pub async fn publish_http_public_certs<S, O>(
    store: &S,
    namer: &Namer,
    owner: &O,
    ca: &CertificateAuthority,
) -> Result<()>
where
    S: ObjectStore,
    O: StoreObject,
{
    let namespace = owner.namespace().context(MissingNamespaceSnafu)?;
    let owner_name = owner.name_any();
    let secret_name = names::http_public_certs_secret_name(namer, &owner_name);

    let certificate_pem = ca.certificate_pem().context(SerializeCaSnafu)?;
    let expected = BTreeMap::from([(
        labels::CA_CERT_KEY.to_string(),
        ByteString(certificate_pem.into_bytes()),
    )]);

    match store
        .get::<Secret>(&namespace, &secret_name)
        .await
        .context(StoreSnafu)?
    {
        Some(secret) if secret.data.as_ref() == Some(&expected) => Ok(()),
        Some(mut secret) => {
            secret.data = Some(expected);
            decorate_metadata(&mut secret.metadata, &labels::cluster_secret_labels(&owner_name));
            store.update(&secret).await.context(StoreSnafu)
        }
        None => {
            let owner_reference = owner
                .controller_owner_ref(&())
                .context(MissingOwnerReferenceSnafu)?;
            let mut metadata = ObjectMeta {
                name: Some(secret_name),
                namespace: Some(namespace),
                owner_references: Some(vec![owner_reference]),
                ..ObjectMeta::default()
            };
            decorate_metadata(&mut metadata, &labels::cluster_secret_labels(&owner_name));

            let secret = Secret {
                metadata,
                data: Some(expected),
                ..Secret::default()
            };
            store.create(&secret).await.context(StoreSnafu)
        }
    }
}

fn decorate_metadata(metadata: &mut ObjectMeta, secret_labels: &BTreeMap<String, String>) {
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(secret_labels.clone());
    labels::stamp_controller_version(metadata.annotations.get_or_insert_with(BTreeMap::new));
}

fn random_alphanumeric(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

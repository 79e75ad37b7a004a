//! Construction of node certificate templates from pod signing requests.
//!
//! The template's subject-alternative-names sequence is the contract
//! between issuance and rotation detection: both sides call
//! [`expected_subject_alt_names`], so a certificate is reissued exactly
//! when the freshly computed extension bytes differ from the ones it
//! carries.

use std::{net::IpAddr, str::FromStr, time::Duration};

use elasticsearch_certs::template::{
    self, CertificateTemplate, OTHER_NAME_COMMON_NAME_OID, ValidatedCertificateTemplate,
    dns_name, ip_address, other_name,
};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use rsa::{RsaPublicKey, pkcs1::DecodeRsaPublicKey, pkcs1v15};
use sha2::Sha256;
use signature::Verifier;
use snafu::{OptionExt, ResultExt, Snafu};
use x509_cert::{
    der::Encode, ext::pkix::SubjectAltName, name::Name, request::CertReq,
};

use crate::pods;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("pod {pod} does not yet have an IP"))]
    MissingPodIp { pod: String },

    #[snafu(display("pod {pod} has an unparseable IP {ip:?}"))]
    InvalidPodIp {
        source: std::net::AddrParseError,
        pod: String,
        ip: String,
    },

    #[snafu(display("failed to build subject alternative name"))]
    BuildGeneralName { source: template::Error },

    #[snafu(display("failed to serialize subject alternative names"))]
    SerializeSubjectAltNames { source: template::Error },

    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to build certificate template"))]
    BuildTemplate { source: template::Error },

    #[snafu(display("failed to encode CSR body for verification"))]
    EncodeCsrInfo { source: x509_cert::der::Error },

    #[snafu(display("the CSR public key is not a PKCS#1 RSA key"))]
    DecodeCsrPublicKey { source: rsa::pkcs1::Error },

    #[snafu(display("the CSR signature is not a PKCS#1 v1.5 signature"))]
    DecodeCsrSignature { source: signature::Error },

    #[snafu(display("the CSR is not signed by the key it carries"))]
    CsrSignatureMismatch { source: signature::Error },
}

/// The common name bound into a node's certificate.
pub fn node_common_name(pod_name: &str, owner_name: &str, namespace: &str) -> String {
    format!("{pod_name}.node.{owner_name}.{namespace}.es.cluster.local")
}

/// What the freshly issued certificate of a pod must look like: used both
/// to fill templates and to detect drift on existing certificates.
#[derive(Clone, Debug)]
pub struct ExpectedNodeCertificate {
    pub common_name: String,
    pub subject_alt_names: SubjectAltName,
    pub subject_alt_names_der: Vec<u8>,
}

impl ExpectedNodeCertificate {
    pub fn for_pod(
        pod: &Pod,
        owner_name: &str,
        namespace: &str,
        services: &[Service],
        extra_san_ips: &[IpAddr],
    ) -> Result<Self> {
        let common_name = node_common_name(&pod.name_any(), owner_name, namespace);
        let subject_alt_names =
            expected_subject_alt_names(pod, &common_name, namespace, services, extra_san_ips)?;
        let subject_alt_names_der = template::encode_subject_alt_names(&subject_alt_names)
            .context(SerializeSubjectAltNamesSnafu)?;

        Ok(Self {
            common_name,
            subject_alt_names,
            subject_alt_names_der,
        })
    }
}

/// Builds the canonical subject-alternative-names sequence of a node
/// certificate:
///
/// 1. the custom `otherName` carrying the common name,
/// 2. DNS names: common name, pod name, every service name, every service
///    `<name>.<namespace>.svc.cluster.local`,
/// 3. IP addresses (4-byte form where possible): pod IP, `127.0.0.1`,
///    every service cluster IP, every user-supplied SAN IP.
fn expected_subject_alt_names(
    pod: &Pod,
    common_name: &str,
    namespace: &str,
    services: &[Service],
    extra_san_ips: &[IpAddr],
) -> Result<SubjectAltName> {
    let mut names = vec![
        other_name(OTHER_NAME_COMMON_NAME_OID, common_name).context(BuildGeneralNameSnafu)?,
        dns_name(common_name).context(BuildGeneralNameSnafu)?,
        dns_name(&pod.name_any()).context(BuildGeneralNameSnafu)?,
    ];

    for service in services {
        if let Some(service_name) = &service.metadata.name {
            names.push(dns_name(service_name).context(BuildGeneralNameSnafu)?);
        }
    }
    for service in services {
        if let Some(service_name) = &service.metadata.name {
            let service_namespace = service.metadata.namespace.as_deref().unwrap_or(namespace);
            names.push(
                dns_name(&format!(
                    "{service_name}.{service_namespace}.svc.cluster.local"
                ))
                .context(BuildGeneralNameSnafu)?,
            );
        }
    }

    let pod_ip = pods::pod_ip(pod).context(MissingPodIpSnafu {
        pod: pod.name_any(),
    })?;
    let pod_ip = IpAddr::from_str(pod_ip).context(InvalidPodIpSnafu {
        pod: pod.name_any(),
        ip: pod_ip,
    })?;

    names.push(ip_address(pod_ip).context(BuildGeneralNameSnafu)?);
    names.push(
        ip_address(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)).context(BuildGeneralNameSnafu)?,
    );

    for service in services {
        // headless services carry "None" (or nothing) here; skip anything
        // that is not an address
        if let Some(cluster_ip) = service.spec.as_ref().and_then(|spec| spec.cluster_ip.as_ref())
        {
            if let Ok(address) = IpAddr::from_str(cluster_ip) {
                names.push(ip_address(address).context(BuildGeneralNameSnafu)?);
            }
        }
    }

    for address in extra_san_ips {
        names.push(ip_address(*address).context(BuildGeneralNameSnafu)?);
    }

    Ok(SubjectAltName(names))
}

/// Verifies and converts a pod's CSR into a signable template.
///
/// This is the only producer of [`ValidatedCertificateTemplate`]: the CSR
/// signature is checked against the key it embeds before that key is bound
/// to the expected node identity.
pub fn create_validated_certificate_template(
    owner_name: &str,
    csr: &CertReq,
    expected: &ExpectedNodeCertificate,
    expire_in: Duration,
) -> Result<ValidatedCertificateTemplate> {
    verify_csr_signature(csr)?;

    let subject = format!(
        "CN={common_name},OU={owner_name}",
        common_name = expected.common_name
    );
    let subject = Name::from_str(&subject).context(ParseSubjectSnafu { subject })?;

    let template = CertificateTemplate::leaf(
        subject,
        expected.subject_alt_names.clone(),
        csr.info.public_key.clone(),
        expire_in,
    )
    .context(BuildTemplateSnafu)?;

    Ok(ValidatedCertificateTemplate::new(template))
}

/// Checks that the CSR is self-consistent: its signature verifies with the
/// public key it carries.
fn verify_csr_signature(csr: &CertReq) -> Result<()> {
    let message = csr.info.to_der().context(EncodeCsrInfoSnafu)?;
    let public_key =
        RsaPublicKey::from_pkcs1_der(csr.info.public_key.subject_public_key.raw_bytes())
            .context(DecodeCsrPublicKeySnafu)?;
    let signature = pkcs1v15::Signature::try_from(csr.signature.raw_bytes())
        .context(DecodeCsrSignatureSnafu)?;

    pkcs1v15::VerifyingKey::<Sha256>::new(public_key)
        .verify(&message, &signature)
        .context(CsrSignatureMismatchSnafu)
}

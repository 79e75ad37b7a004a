//! Leaf-certificate templates and subject-alternative-name construction.
//!
//! Node certificates carry a subject-alternative-names extension whose
//! first entry is a custom `otherName` holding the certificate common name
//! as a UTF-8 string. Issuance and rotation detection both rely on the DER
//! encoding of this extension, so the same [`SubjectAltName`] value is used
//! to build certificates and to compute the expected extension bytes.

use std::{
    net::IpAddr,
    time::{Duration, SystemTime},
};

use snafu::{ResultExt, Snafu};
use x509_cert::{
    Certificate,
    der::{
        Any, Encode,
        asn1::{Ia5String, OctetString, Utf8StringRef},
    },
    ext::{
        Extension,
        pkix::{
            ExtendedKeyUsage, ID_CE_SUBJECT_ALT_NAME, KeyUsage, KeyUsages, SubjectAltName,
            name::{GeneralName, OtherName},
        },
    },
    name::Name,
    spki::{ObjectIdentifier, SubjectPublicKeyInfoOwned},
    time::Validity,
};

use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};

use crate::ca;

/// Private OID identifying the `otherName` entry that carries the node
/// certificate common name.
pub const OTHER_NAME_COMMON_NAME_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.9999.2.5");

/// Lifetime of a leaf certificate when the caller does not choose one.
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Leaf certificates are backdated by ten minutes: nodes may validate them
/// immediately after issuance, before their clocks have converged.
const CERTIFICATE_NOT_BEFORE_BACKDATE: Duration = Duration::from_secs(10 * 60);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the subject alternative DNS name {dns_name:?} is not an IA5 string"))]
    InvalidDnsName {
        dns_name: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to encode IP address octets"))]
    EncodeIpAddress { source: x509_cert::der::Error },

    #[snafu(display("failed to encode otherName value {value:?}"))]
    EncodeOtherName {
        value: String,
        source: x509_cert::der::Error,
    },

    #[snafu(display("failed to encode validity window"))]
    EncodeValidity { source: ca::Error },

    #[snafu(display("failed to serialize subject alternative names"))]
    SerializeSubjectAltNames { source: x509_cert::der::Error },
}

/// An unvalidated description of a leaf certificate to issue.
///
/// A template becomes signable only once the node-certificate issuer has
/// checked the signing request it was built from and wrapped it into a
/// [`ValidatedCertificateTemplate`].
#[derive(Clone, Debug)]
pub struct CertificateTemplate {
    pub subject: Name,
    pub subject_alt_names: SubjectAltName,
    pub key_usage: KeyUsage,
    pub extended_key_usages: ExtendedKeyUsage,
    pub validity: Validity,
    pub public_key: SubjectPublicKeyInfoOwned,
}

impl CertificateTemplate {
    /// Builds a node leaf template: digital signature and key encipherment
    /// usage, server and client authentication, backdated by ten minutes
    /// and expiring after `expire_in`.
    pub fn leaf(
        subject: Name,
        subject_alt_names: SubjectAltName,
        public_key: SubjectPublicKeyInfoOwned,
        expire_in: Duration,
    ) -> Result<Self> {
        let validity = ca::validity_window(CERTIFICATE_NOT_BEFORE_BACKDATE, expire_in)
            .context(EncodeValiditySnafu)?;

        Ok(Self {
            subject,
            subject_alt_names,
            key_usage: KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment),
            extended_key_usages: ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH, ID_KP_CLIENT_AUTH]),
            validity,
            public_key,
        })
    }
}

/// A certificate template that passed issuer-side validation.
///
/// [`crate::CertificateAuthority::create_certificate`] only accepts this
/// type; constructing one is the issuer's assertion that the embedded
/// public key comes from a verified signing request.
#[derive(Clone, Debug)]
pub struct ValidatedCertificateTemplate(CertificateTemplate);

impl ValidatedCertificateTemplate {
    pub fn new(template: CertificateTemplate) -> Self {
        Self(template)
    }

    pub(crate) fn template(&self) -> &CertificateTemplate {
        &self.0
    }
}

/// Builds the custom `otherName` general name: the given OID with a UTF-8
/// string value.
pub fn other_name(type_id: ObjectIdentifier, value: &str) -> Result<GeneralName> {
    let utf8 = Utf8StringRef::new(value).context(EncodeOtherNameSnafu { value })?;
    let any = Any::encode_from(&utf8).context(EncodeOtherNameSnafu { value })?;

    Ok(GeneralName::OtherName(OtherName {
        type_id,
        value: any,
    }))
}

/// Builds a DNS general name.
pub fn dns_name(name: &str) -> Result<GeneralName> {
    Ok(GeneralName::DnsName(Ia5String::new(name).context(
        InvalidDnsNameSnafu { dns_name: name },
    )?))
}

/// Builds an IP-address general name. IPv4 addresses use the 4-byte form.
pub fn ip_address(address: IpAddr) -> Result<GeneralName> {
    let octets = match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };

    Ok(GeneralName::IpAddress(
        OctetString::new(octets).context(EncodeIpAddressSnafu)?,
    ))
}

/// DER encoding of a subject-alternative-names value, i.e. the bytes an
/// issued certificate carries in the extension's `extnValue`.
pub fn encode_subject_alt_names(subject_alt_names: &SubjectAltName) -> Result<Vec<u8>> {
    subject_alt_names
        .to_der()
        .context(SerializeSubjectAltNamesSnafu)
}

/// Returns the subject-alternative-names extension of `certificate`, if
/// present.
pub fn subject_alt_names_extension(certificate: &Certificate) -> Option<&Extension> {
    certificate
        .tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|extension| extension.extn_id == ID_CE_SUBJECT_ALT_NAME)
}

/// Checks whether `at` is within `rotate_before` of the certificate's
/// expiry (or past it).
pub fn due_for_rotation(certificate: &Certificate, at: SystemTime, rotate_before: Duration) -> bool {
    let not_after = certificate
        .tbs_certificate
        .validity
        .not_after
        .to_system_time();

    match not_after.checked_sub(rotate_before) {
        Some(rotation_point) => at >= rotation_point,
        // shorter-lived than the rotation window, always rotate
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use x509_cert::der::Decode;

    use super::*;

    #[test]
    fn ipv4_addresses_use_the_four_byte_form() {
        let name = ip_address(IpAddr::V4(Ipv4Addr::new(10, 0, 42, 7))).unwrap();
        match name {
            GeneralName::IpAddress(octets) => assert_eq!(octets.as_bytes(), &[10, 0, 42, 7]),
            other => panic!("expected IP address general name, got {other:?}"),
        }
    }

    #[test]
    fn other_name_roundtrips_utf8_value() {
        let name = other_name(OTHER_NAME_COMMON_NAME_OID, "node-0.cluster.local").unwrap();
        let GeneralName::OtherName(other) = name else {
            panic!("expected otherName general name");
        };

        assert_eq!(other.type_id, OTHER_NAME_COMMON_NAME_OID);
        let value = other.value.decode_as::<Utf8StringRef>().unwrap();
        assert_eq!(value.as_str(), "node-0.cluster.local");
    }

    #[test]
    fn encoding_is_deterministic() {
        let sans = SubjectAltName(vec![
            other_name(OTHER_NAME_COMMON_NAME_OID, "cn").unwrap(),
            dns_name("cn").unwrap(),
            ip_address(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap(),
        ]);

        let first = encode_subject_alt_names(&sans).unwrap();
        let second = encode_subject_alt_names(&sans).unwrap();
        assert_eq!(first, second);

        // the encoding parses back to the same value
        let decoded = SubjectAltName::from_der(&first).unwrap();
        assert_eq!(decoded, sans);
    }
}

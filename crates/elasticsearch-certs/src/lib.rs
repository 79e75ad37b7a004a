//! X.509 primitives for the Elasticsearch operator.
//!
//! This crate knows nothing about Kubernetes. It provides the building
//! blocks the operator's reconcilers assemble into per-cluster PKI:
//!
//! - a PEM codec for certificates and PKCS#1 RSA private keys ([`pem`]),
//! - RSA key generation and key/certificate matching ([`keys`]),
//! - self-signed certificate authorities which sign validated leaf
//!   certificate templates ([`ca`]),
//! - leaf templates carrying the custom subject-alternative-names
//!   extension consumed by Elasticsearch nodes ([`template`]).
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://datatracker.ietf.org/doc/html/rfc8017>

use x509_cert::{
    der::asn1::{PrintableStringRef, Utf8StringRef},
    name::Name,
};

pub mod ca;
pub mod keys;
pub mod pem;
pub mod template;

pub use ca::{CertificateAuthority, SelfSignedOptions};
pub use template::{CertificateTemplate, ValidatedCertificateTemplate};

/// Extracts the common name (CN) attribute from an X.501 [`Name`].
///
/// Returns [`None`] when the name carries no CN attribute or its value is
/// neither a UTF-8 nor a printable string.
pub fn common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == const_oid::db::rfc4519::CN)
        .and_then(|atv| {
            atv.value
                .decode_as::<Utf8StringRef>()
                .map(|cn| cn.to_string())
                .or_else(|_| {
                    atv.value
                        .decode_as::<PrintableStringRef>()
                        .map(|cn| cn.to_string())
                })
                .ok()
        })
}

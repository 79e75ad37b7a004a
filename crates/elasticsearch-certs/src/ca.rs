//! Creation of self-signed certificate authorities and signing of leaf
//! certificates.
//!
//! A [`CertificateAuthority`] is scoped to one owning cluster and one role
//! (transport or HTTP); it self-signs its own certificate and signs leaf
//! certificates from [`ValidatedCertificateTemplate`]s. Storage of the CA
//! material is the caller's concern.

use std::{
    str::FromStr,
    time::{Duration, SystemTime},
};

use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use rand_core::{OsRng, RngCore};
use rsa::{RsaPublicKey, pkcs1::DecodeRsaPublicKey, pkcs1v15};
use sha2::Sha256;
use signature::Verifier;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::Encode,
    ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages},
    name::Name,
    serial_number::SerialNumber,
    time::{Time, Validity},
};
use zeroize::Zeroizing;

use crate::{keys, keys::SigningKey, pem, template::ValidatedCertificateTemplate};

/// Lifetime of a CA certificate when the caller does not choose one.
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Common name of a CA certificate when the caller does not choose one.
pub const DEFAULT_CA_COMMON_NAME: &str = "root-ca";

/// CA certificates are backdated by one minute to absorb clock skew between
/// the operator and the nodes validating against them.
const CA_NOT_BEFORE_BACKDATE: Duration = Duration::from_secs(60);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate CA signing key"))]
    GenerateSigningKey { source: keys::Error },

    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to encode validity window"))]
    EncodeValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to encode serial number"))]
    EncodeSerialNumber { source: x509_cert::der::Error },

    #[snafu(display("failed to encode subject public key info"))]
    EncodeSubjectPublicKeyInfo { source: keys::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display("failed to serialize certificate as DER"))]
    SerializeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize private key as PEM"))]
    SerializePrivateKey { source: pem::Error },
}

/// Error variants of [`CertificateAuthority::verify_issued`].
#[derive(Debug, Snafu)]
pub enum VerificationError {
    #[snafu(display("certificate issuer does not match the CA subject"))]
    IssuerMismatch,

    #[snafu(display("certificate is outside its validity window"))]
    OutsideValidityWindow,

    #[snafu(display("failed to encode the to-be-signed certificate"))]
    EncodeTbsCertificate { source: x509_cert::der::Error },

    #[snafu(display("the CA public key is not a PKCS#1 RSA key"))]
    DecodeCaPublicKey { source: rsa::pkcs1::Error },

    #[snafu(display("certificate signature is not a PKCS#1 v1.5 signature"))]
    DecodeSignature { source: signature::Error },

    #[snafu(display("certificate signature verification failed"))]
    VerifySignature { source: signature::Error },
}

/// Options for [`CertificateAuthority::new_self_signed`]. Every field has a
/// sensible default, so `SelfSignedOptions::default()` yields a working CA.
#[derive(Debug, Default)]
pub struct SelfSignedOptions {
    /// Subject common name, [`DEFAULT_CA_COMMON_NAME`] when absent.
    pub common_name: Option<String>,

    /// Subject organizational units, typically the name of the owning
    /// cluster.
    pub organizational_units: Vec<String>,

    /// Signing key to embed. A fresh 2048-bit RSA key is generated when
    /// absent.
    pub key: Option<SigningKey>,

    /// Certificate lifetime, [`DEFAULT_CA_VALIDITY`] when absent.
    pub expire_in: Option<Duration>,
}

impl SelfSignedOptions {
    pub fn common_name(mut self, common_name: impl Into<String>) -> Self {
        self.common_name = Some(common_name.into());
        self
    }

    pub fn organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_units.push(unit.into());
        self
    }

    pub fn key(mut self, key: SigningKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }
}

/// A certificate authority for one owning cluster and role.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    certificate: Certificate,
    key: SigningKey,
}

impl CertificateAuthority {
    /// Creates a new self-signed CA.
    ///
    /// The certificate is marked `CA = true`, allows digital signatures and
    /// certificate signing, may be used for both server and client
    /// authentication, carries a serial number drawn uniformly from
    /// [0, 2¹²⁸), and is backdated by one minute.
    #[instrument(name = "create_self_signed_ca", skip(options))]
    pub fn new_self_signed(options: SelfSignedOptions) -> Result<Self> {
        let key = match options.key {
            Some(key) => key,
            None => SigningKey::generate().context(GenerateSigningKeySnafu)?,
        };

        let common_name = options
            .common_name
            .unwrap_or_else(|| DEFAULT_CA_COMMON_NAME.to_string());
        let subject = subject_name(&common_name, &options.organizational_units)?;
        let validity = validity_window(
            CA_NOT_BEFORE_BACKDATE,
            options.expire_in.unwrap_or(DEFAULT_CA_VALIDITY),
        )?;
        let serial_number = random_serial_number()?;
        let spki = key
            .subject_public_key_info()
            .context(EncodeSubjectPublicKeyInfoSnafu)?;

        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            serial_number,
            validity,
            subject,
            spki,
            key.signer(),
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: true,
                path_len_constraint: None,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(
                KeyUsages::DigitalSignature | KeyUsages::KeyCertSign,
            ))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![
                ID_KP_SERVER_AUTH,
                ID_KP_CLIENT_AUTH,
            ]))
            .context(AddCertificateExtensionSnafu)?;

        debug!(ca.common_name = %common_name, "create and sign CA certificate");
        let certificate = builder.build().context(BuildCertificateSnafu)?;

        Ok(Self { certificate, key })
    }

    /// Reassembles a CA from previously persisted material.
    pub fn from_parts(certificate: Certificate, key: SigningKey) -> Self {
        Self { certificate, key }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// The CA certificate as a single PEM `CERTIFICATE` block.
    pub fn certificate_pem(&self) -> Result<String> {
        let der = self
            .certificate
            .to_der()
            .context(SerializeCertificateSnafu)?;
        Ok(pem::encode_certificates([der]))
    }

    /// The CA private key as a PEM PKCS#1 `RSA PRIVATE KEY` block.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>> {
        pem::encode_private_key(self.key.private_key()).context(SerializePrivateKeySnafu)
    }

    /// Signs a leaf certificate from a validated template and returns its
    /// DER encoding.
    ///
    /// A fresh 128-bit serial number is generated and the issuer is forced
    /// to the CA subject; the template carries the public key to certify
    /// plus subject, validity and extensions.
    #[instrument(name = "sign_leaf_certificate", skip_all)]
    pub fn create_certificate(&self, template: &ValidatedCertificateTemplate) -> Result<Vec<u8>> {
        let template = template.template();
        let serial_number = random_serial_number()?;

        let mut builder = CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(self.certificate.tbs_certificate.subject.clone()),
            },
            serial_number,
            template.validity.clone(),
            template.subject.clone(),
            template.public_key.clone(),
            self.key.signer(),
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&template.key_usage)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&template.extended_key_usages)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&template.subject_alt_names)
            .context(AddCertificateExtensionSnafu)?;

        debug!("create and sign leaf certificate");
        let certificate = builder.build().context(BuildCertificateSnafu)?;

        certificate.to_der().context(SerializeCertificateSnafu)
    }

    /// Checks that `certificate` was issued by this CA and is valid at
    /// `at`: the issuer must equal the CA subject, `at` must fall into the
    /// validity window, and the signature must verify with the CA public
    /// key.
    pub fn verify_issued(
        &self,
        certificate: &Certificate,
        at: SystemTime,
    ) -> Result<(), VerificationError> {
        if certificate.tbs_certificate.issuer != self.certificate.tbs_certificate.subject {
            return IssuerMismatchSnafu.fail();
        }

        let validity = &certificate.tbs_certificate.validity;
        if at < validity.not_before.to_system_time() || at > validity.not_after.to_system_time() {
            return OutsideValidityWindowSnafu.fail();
        }

        let ca_public_key = RsaPublicKey::from_pkcs1_der(
            self.certificate
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .raw_bytes(),
        )
        .context(DecodeCaPublicKeySnafu)?;

        let message = certificate
            .tbs_certificate
            .to_der()
            .context(EncodeTbsCertificateSnafu)?;
        let signature = pkcs1v15::Signature::try_from(certificate.signature.raw_bytes())
            .context(DecodeSignatureSnafu)?;

        pkcs1v15::VerifyingKey::<Sha256>::new(ca_public_key)
            .verify(&message, &signature)
            .context(VerifySignatureSnafu)
    }
}

fn subject_name(common_name: &str, organizational_units: &[String]) -> Result<Name> {
    let mut subject = format!("CN={common_name}");
    for unit in organizational_units {
        subject.push_str(",OU=");
        subject.push_str(unit);
    }

    Name::from_str(&subject).context(ParseSubjectSnafu { subject })
}

/// Builds a validity window of `[now - backdate, now + expire_in]`.
pub(crate) fn validity_window(backdate: Duration, expire_in: Duration) -> Result<Validity> {
    let now = SystemTime::now();
    let not_before = now.checked_sub(backdate).unwrap_or(now);

    Ok(Validity {
        not_before: Time::try_from(not_before).context(EncodeValiditySnafu)?,
        not_after: Time::try_from(now + expire_in).context(EncodeValiditySnafu)?,
    })
}

/// Draws a serial number uniformly from [0, 2¹²⁸).
///
/// The random bytes are prefixed with a zero octet so the DER integer
/// always stays positive.
fn random_serial_number() -> Result<SerialNumber> {
    let mut bytes = [0u8; 17];
    OsRng.fill_bytes(&mut bytes[1..]);

    SerialNumber::new(&bytes).context(EncodeSerialNumberSnafu)
}

//! RSA key management for certificate authorities and node certificates.
//!
//! Elasticsearch nodes and their CAs exclusively use 2048-bit RSA keys with
//! SHA-256 PKCS#1 v1.5 signatures, so unlike a general-purpose certificate
//! library there is no algorithm abstraction here.

use rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15};
use sha2::Sha256;
use signature::Keypair;
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use x509_cert::{
    der::{DecodePem, pem::LineEnding},
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
};

/// Bit size of every RSA key generated by the operator.
pub const KEY_BIT_SIZE: usize = 2048;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate RSA private key"))]
    GenerateKey { source: rsa::Error },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },
}

/// An RSA key pair used to sign certificates.
///
/// Wraps the raw [`RsaPrivateKey`] together with the SHA-256 PKCS#1 v1.5
/// signer derived from it, so callers never have to re-derive one from the
/// other.
#[derive(Clone, Debug)]
pub struct SigningKey {
    private_key: RsaPrivateKey,
    signing_key: pkcs1v15::SigningKey<Sha256>,
}

impl SigningKey {
    /// Generates a fresh key pair of [`KEY_BIT_SIZE`] bits.
    #[instrument(name = "generate_rsa_signing_key")]
    pub fn generate() -> Result<Self> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, KEY_BIT_SIZE).context(GenerateKeySnafu)?;
        Ok(Self::from_private_key(private_key))
    }

    /// Wraps an existing private key, e.g. one recovered from persisted PEM.
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let signing_key = pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());
        Self {
            private_key,
            signing_key,
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    pub fn signer(&self) -> &pkcs1v15::SigningKey<Sha256> {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> pkcs1v15::VerifyingKey<Sha256> {
        self.signing_key.verifying_key()
    }

    /// Returns the public half as a DER `SubjectPublicKeyInfo` structure,
    /// the form certificate templates carry.
    pub fn subject_public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned> {
        let spki_pem = self
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .context(SerializePublicKeySnafu)?;

        SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes()).context(DecodeSpkiFromPemSnafu)
    }
}

/// Returns true iff `private` is the private half of `public`.
pub fn private_matches_public_key(public: &RsaPublicKey, private: &RsaPrivateKey) -> bool {
    private.to_public_key() == *public
}

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Asymmetric signing and signature verification.
//!
//! A [Signer] holds a private key and produces raw signatures, a [PublicKey]
//! verifies them. RSA keys sign with `RS256` (RSASSA-PKCS1-v1_5 using
//! SHA-256), and P-256 keys sign with `ES256` (ECDSA using SHA-256). `ES256`
//! signatures use the fixed-width `r || s` encoding required by JWS.
//!
//! Both types are cheap to clone and safe to share across threads.

use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk};
use jsonwebtoken::{DecodingKey, EncodingKey};
use p256::pkcs8::{EncodePrivateKey, SecretDocument};
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::pem::PemObject;

pub type Result<T> = std::result::Result<T, SigningError>;

/// The signature algorithms supported by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256.
    RS256,
    /// ECDSA using P-256 and SHA-256.
    ES256,
}

impl Algorithm {
    /// The name used in the `alg` header of a JWT.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "RS256" => Some(Self::RS256),
            "ES256" => Some(Self::ES256),
            _ => None,
        }
    }
}

impl From<Algorithm> for jsonwebtoken::Algorithm {
    fn from(value: Algorithm) -> Self {
        match value {
            Algorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            Algorithm::ES256 => jsonwebtoken::Algorithm::ES256,
        }
    }
}

/// Signs messages with a private key.
#[derive(Clone)]
pub struct Signer {
    key: Option<EncodingKey>,
    algorithm: Algorithm,
    key_id: Option<String>,
}

impl Signer {
    /// Creates a signer from a PEM-encoded private key.
    ///
    /// Supports PKCS#1 RSA keys (`BEGIN RSA PRIVATE KEY`), SEC1 P-256 keys
    /// (`BEGIN EC PRIVATE KEY`), and PKCS#8 RSA or P-256 keys
    /// (`BEGIN PRIVATE KEY`).
    ///
    /// An empty `pem` creates a signer without a key, every call to
    /// [sign][Signer::sign] fails. Use this to represent credentials whose
    /// key was not provisioned.
    pub fn from_pem(pem: &str) -> Result<Self> {
        if pem.trim().is_empty() {
            return Ok(Self {
                key: None,
                algorithm: Algorithm::RS256,
                key_id: None,
            });
        }
        let der = PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(SigningError::key_format)?;
        let (key, algorithm) = match der {
            PrivateKeyDer::Pkcs1(_) => (
                EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(SigningError::key_format)?,
                Algorithm::RS256,
            ),
            PrivateKeyDer::Sec1(sec1) => (
                EncodingKey::from_ec_der(sec1_to_pkcs8(sec1.secret_sec1_der())?.as_bytes()),
                Algorithm::ES256,
            ),
            PrivateKeyDer::Pkcs8(_) => match EncodingKey::from_rsa_pem(pem.as_bytes()) {
                Ok(key) => (key, Algorithm::RS256),
                Err(_) => (
                    EncodingKey::from_ec_pem(pem.as_bytes()).map_err(SigningError::key_format)?,
                    Algorithm::ES256,
                ),
            },
            _ => {
                return Err(SigningError::key_format(
                    "unsupported private key type, expected RSA or P-256",
                ));
            }
        };
        Ok(Self {
            key: Some(key),
            algorithm,
            key_id: None,
        })
    }

    /// Sets the key identifier, used as the `kid` header in JWTs.
    pub fn with_key_id<V: Into<String>>(mut self, v: V) -> Self {
        self.key_id = Some(v.into());
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Signs `message` and returns the raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| SigningError::signing("no private key configured"))?;
        let encoded = jsonwebtoken::crypto::sign(message, key, self.algorithm.into())
            .map_err(SigningError::signing)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(SigningError::signing)
    }
}

// The JWT backend only loads P-256 keys in PKCS#8 form.
fn sec1_to_pkcs8(der: &[u8]) -> Result<SecretDocument> {
    p256::SecretKey::from_sec1_der(der)
        .map_err(|_| SigningError::key_format("invalid SEC1 key, expected a P-256 private key"))?
        .to_pkcs8_der()
        .map_err(|e| SigningError::key_format(format!("cannot convert the SEC1 key to PKCS#8: {e}")))
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("key", &self.key.as_ref().map(|_| "[censored]"))
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Verifies signatures created by a [Signer].
#[derive(Clone)]
pub struct PublicKey {
    key: DecodingKey,
    algorithm: Algorithm,
    key_id: Option<String>,
}

impl PublicKey {
    /// Creates a public key from a PEM-encoded `SubjectPublicKeyInfo` or PKCS#1
    /// RSA public key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = DecodingKey::from_rsa_pem(pem.as_bytes()) {
            return Ok(Self::new(key, Algorithm::RS256));
        }
        let key = DecodingKey::from_ec_pem(pem.as_bytes()).map_err(SigningError::key_format)?;
        Ok(Self::new(key, Algorithm::ES256))
    }

    /// Creates a public key from a [JSON Web Key].
    ///
    /// The key identifier is taken from the `kid` field.
    ///
    /// [JSON Web Key]: https://datatracker.ietf.org/doc/html/rfc7517
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        let algorithm = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => Algorithm::RS256,
            AlgorithmParameters::EllipticCurve(_) => Algorithm::ES256,
            other => {
                return Err(SigningError::key_format(format!(
                    "unsupported JWK key type {other:?}"
                )));
            }
        };
        let key = DecodingKey::from_jwk(jwk).map_err(SigningError::key_format)?;
        Ok(Self {
            key,
            algorithm,
            key_id: jwk.common.key_id.clone(),
        })
    }

    /// Parses a single JSON Web Key and creates a public key from it.
    pub fn from_jwk_json(json: &str) -> Result<Self> {
        let jwk: Jwk = serde_json::from_str(json).map_err(SigningError::key_format)?;
        Self::from_jwk(&jwk)
    }

    fn new(key: DecodingKey, algorithm: Algorithm) -> Self {
        Self {
            key,
            algorithm,
            key_id: None,
        }
    }

    /// Sets the key identifier, used to match the `kid` header in JWTs.
    pub fn with_key_id<V: Into<String>>(mut self, v: V) -> Self {
        self.key_id = Some(v.into());
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Returns `true` if `signature` is a valid signature of `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let signature = BASE64_URL_SAFE_NO_PAD.encode(signature);
        jsonwebtoken::crypto::verify(&signature, message, &self.key, self.algorithm.into())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Tries each candidate key, in order, until one validates the signature.
///
/// Returns `false` if `candidates` is empty.
pub fn verify<'a, I>(message: &[u8], signature: &[u8], candidates: I) -> bool
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    candidates
        .into_iter()
        .any(|key| key.verify(message, signature))
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A problem loading a key or creating a signature.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct SigningError(SigningErrorKind);

impl SigningError {
    /// The key material could not be parsed.
    pub fn is_key_format(&self) -> bool {
        matches!(self.0, SigningErrorKind::KeyFormat(_))
    }

    /// The signer is misconfigured or the signing operation failed.
    pub fn is_signing(&self) -> bool {
        matches!(self.0, SigningErrorKind::Signing(_))
    }

    pub(crate) fn key_format<T>(source: T) -> SigningError
    where
        T: Into<BoxError>,
    {
        SigningError(SigningErrorKind::KeyFormat(source.into()))
    }

    pub(crate) fn signing<T>(source: T) -> SigningError
    where
        T: Into<BoxError>,
    {
        SigningError(SigningErrorKind::Signing(source.into()))
    }
}

#[derive(thiserror::Error, Debug)]
enum SigningErrorKind {
    #[error("cannot parse key material: {0}")]
    KeyFormat(#[source] BoxError),
    #[error("cannot create signature: {0}")]
    Signing(#[source] BoxError),
}

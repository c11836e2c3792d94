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

//! Create, sign, and verify [JSON Web Tokens].
//!
//! Tokens use the compact serialization: three base64url segments (header,
//! payload, signature) joined by `.`. Only the `RS256` and `ES256`
//! algorithms are supported.
//!
//! # Example
//! ```
//! # use cloud_credentials::jwt::{ClaimsBuilder, Decoder, encode};
//! # use cloud_credentials::jwt::certs::StaticCerts;
//! # use cloud_credentials::signer::{PublicKey, Signer};
//! # async fn sample(private_pem: &str, public_pem: &str) -> anyhow::Result<()> {
//! let signer = Signer::from_pem(private_pem)?;
//! let claims = ClaimsBuilder::new("issuer@example.com")
//!     .with_audience("https://service.example.com")
//!     .build_now()?;
//! let token = encode(&signer, &claims, None)?;
//!
//! let certs = StaticCerts::new([PublicKey::from_pem(public_pem)?]);
//! let decoded = Decoder::new()
//!     .with_audience("https://service.example.com")
//!     .decode(&token, &certs)
//!     .await?;
//! assert_eq!(decoded, claims);
//! # Ok(()) }
//! ```
//!
//! [JSON Web Tokens]: https://datatracker.ietf.org/doc/html/rfc7519

pub mod certs;

use crate::clock::{self, Clock};
use crate::signer::{Algorithm, Signer};
use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use certs::CertsProvider;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// The default tolerance for clock skew when validating `iat` and `exp`.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(10);

/// The default lifetime for newly issued tokens.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// The maximum lifetime for newly issued tokens.
///
/// Token endpoints reject assertions that are valid for longer than an hour.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// The claims in a token payload.
pub type Claims = Map<String, Value>;

pub type Result<T> = std::result::Result<T, Error>;

/// The header that describes how a token was signed.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Any other header fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Signs `claims` and returns the token in compact serialization.
///
/// The `alg` and `kid` header fields are determined by `signer`, the `typ`
/// field is always `JWT`. Use `header_extra` to add other header fields; it
/// cannot override `alg`, `typ`, or `kid`.
pub fn encode(signer: &Signer, claims: &Claims, header_extra: Option<&Map<String, Value>>) -> Result<String> {
    let mut extra = header_extra.cloned().unwrap_or_default();
    for reserved in ["alg", "typ", "kid"] {
        extra.remove(reserved);
    }
    let header = Header {
        alg: signer.algorithm().as_str().to_string(),
        typ: Some("JWT".to_string()),
        kid: signer.key_id().map(str::to_string),
        extra,
    };
    let header = serde_json::to_vec(&header).map_err(Error::encoding)?;
    let payload = serde_json::to_vec(claims).map_err(Error::encoding)?;
    let message = format!(
        "{}.{}",
        BASE64_URL_SAFE_NO_PAD.encode(header),
        BASE64_URL_SAFE_NO_PAD.encode(payload)
    );
    let signature = signer.sign(message.as_bytes()).map_err(Error::encoding)?;
    Ok(format!(
        "{message}.{}",
        BASE64_URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Splits and decodes a token without verifying its signature or claims.
///
/// Useful to inspect the header, for example, to find the `kid` before
/// loading the verification keys. Never trust the claims returned by this
/// function.
pub fn decode_unverified(token: &str) -> Result<(Header, Claims)> {
    let parts = Parts::split(token)?;
    Ok((parts.header, parts.claims))
}

struct Parts<'a> {
    header: Header,
    claims: Claims,
    message: &'a str,
    signature: Vec<u8>,
}

impl<'a> Parts<'a> {
    fn split(token: &'a str) -> Result<Self> {
        let segments: Vec<&str> = token.split('.').collect();
        let [header, payload, signature] = segments.as_slice() else {
            return Err(Error::malformed(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        };
        let message = &token[..header.len() + 1 + payload.len()];
        let header = BASE64_URL_SAFE_NO_PAD
            .decode(header)
            .map_err(Error::malformed)?;
        let header: Header = serde_json::from_slice(&header).map_err(Error::malformed)?;
        let claims = BASE64_URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(Error::malformed)?;
        let claims: Claims = serde_json::from_slice(&claims).map_err(Error::malformed)?;
        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(Error::malformed)?;
        Ok(Self {
            header,
            claims,
            message,
            signature,
        })
    }
}

/// Builds the claims for a newly issued token.
///
/// The builder sets `iss`, `sub` (defaults to the issuer), `iat`, and `exp`.
/// `iat` is the current time, and `exp` is `iat` plus the lifetime. The
/// lifetime defaults to [DEFAULT_TOKEN_LIFETIME] and is capped at
/// [MAX_TOKEN_LIFETIME].
#[derive(Clone, Debug)]
pub struct ClaimsBuilder {
    issuer: String,
    subject: Option<String>,
    audience: Option<String>,
    scopes: Option<String>,
    lifetime: Duration,
    extra: Claims,
}

impl ClaimsBuilder {
    pub fn new<V: Into<String>>(issuer: V) -> Self {
        Self {
            issuer: issuer.into(),
            subject: None,
            audience: None,
            scopes: None,
            lifetime: DEFAULT_TOKEN_LIFETIME,
            extra: Claims::new(),
        }
    }

    pub fn with_subject<V: Into<String>>(mut self, v: V) -> Self {
        self.subject = Some(v.into());
        self
    }

    pub fn with_audience<V: Into<String>>(mut self, v: V) -> Self {
        self.audience = Some(v.into());
        self
    }

    /// Sets the `scope` claim, the scopes are joined with spaces.
    pub fn with_scopes<I, S>(mut self, v: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scopes: Vec<String> = v.into_iter().map(Into::into).collect();
        self.scopes = (!scopes.is_empty()).then(|| scopes.join(" "));
        self
    }

    /// Sets the token lifetime. Values above [MAX_TOKEN_LIFETIME] are capped.
    pub fn with_lifetime(mut self, v: Duration) -> Self {
        self.lifetime = v.min(MAX_TOKEN_LIFETIME);
        self
    }

    /// Adds a custom claim. Custom claims never override the registered claims
    /// set by the builder.
    pub fn with_claim<K: Into<String>>(mut self, name: K, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Builds the claims using the time reported by `clock`.
    pub fn build(self, clock: &dyn Clock) -> Result<Claims> {
        let iat = clock.now().unix_timestamp();
        let exp = iat + self.lifetime.as_secs() as i64;
        if exp <= iat {
            return Err(Error::encoding(format!(
                "expiration time {exp} must be later than issued time {iat}"
            )));
        }
        let mut claims = self.extra;
        claims.insert("iss".into(), Value::String(self.issuer.clone()));
        claims.insert(
            "sub".into(),
            Value::String(self.subject.unwrap_or(self.issuer)),
        );
        if let Some(aud) = self.audience {
            claims.insert("aud".into(), Value::String(aud));
        }
        if let Some(scope) = self.scopes {
            claims.insert("scope".into(), Value::String(scope));
        }
        claims.insert("iat".into(), Value::from(iat));
        claims.insert("exp".into(), Value::from(exp));
        Ok(claims)
    }

    /// Builds the claims using the system clock.
    pub fn build_now(self) -> Result<Claims> {
        self.build(&clock::SystemClock)
    }
}

/// Verifies tokens and returns their claims.
#[derive(Clone, Debug)]
pub struct Decoder {
    audience: Option<String>,
    leeway: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            audience: None,
            leeway: DEFAULT_LEEWAY,
            clock: clock::system(),
        }
    }

    /// Requires the `aud` claim to match this value.
    ///
    /// The `aud` claim matches if it is equal to this value, or if it is an
    /// array containing this value.
    pub fn with_audience<V: Into<String>>(mut self, v: V) -> Self {
        self.audience = Some(v.into());
        self
    }

    /// Changes the tolerance for clock skew, the default is [DEFAULT_LEEWAY].
    pub fn with_leeway(mut self, v: Duration) -> Self {
        self.leeway = v;
        self
    }

    pub fn with_clock(mut self, v: Arc<dyn Clock>) -> Self {
        self.clock = v;
        self
    }

    /// Verifies `token` and returns its claims.
    ///
    /// The verification keys are obtained from `certs`, using the `kid` from
    /// the token header if present.
    pub async fn decode(&self, token: &str, certs: &dyn CertsProvider) -> Result<Claims> {
        let parts = Parts::split(token)?;
        let alg = Algorithm::from_name(&parts.header.alg).ok_or_else(|| {
            Error::malformed(format!("unsupported algorithm {}", parts.header.alg))
        })?;

        let keys = certs.get_keys(parts.header.kid.as_deref()).await?;
        let candidates = keys.iter().filter(|k| k.algorithm() == alg);
        if !crate::signer::verify(parts.message.as_bytes(), &parts.signature, candidates) {
            return Err(Error::signature(match parts.header.kid {
                Some(kid) => format!("no trusted key with id {kid} validates the signature"),
                None => "no trusted key validates the signature".to_string(),
            }));
        }

        let claims = parts.claims;
        let iat = numeric_date(&claims, "iat")?;
        let exp = numeric_date(&claims, "exp")?;
        if exp <= iat {
            return Err(Error::malformed(format!(
                "expiration time {exp} must be later than issued time {iat}"
            )));
        }
        let now = self.clock.now().unix_timestamp();
        let leeway = i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX);
        if now > exp.saturating_add(leeway) {
            return Err(Error::expired(format!(
                "token expired at {exp}, current time is {now}"
            )));
        }
        if now < iat.saturating_sub(leeway) {
            return Err(Error::too_early(format!(
                "token used too early, issued at {iat}, current time is {now}"
            )));
        }
        if let Some(audience) = &self.audience {
            let matches = match claims.get("aud") {
                Some(Value::String(aud)) => aud == audience,
                Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(audience)),
                _ => false,
            };
            if !matches {
                return Err(Error::audience(format!(
                    "token audience {:?} does not match {audience}",
                    claims.get("aud")
                )));
            }
        }
        Ok(claims)
    }
}

fn numeric_date(claims: &Claims, name: &str) -> Result<i64> {
    let value = claims
        .get(name)
        .ok_or_else(|| Error::malformed(format!("missing `{name}` claim")))?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| Error::malformed(format!("`{name}` claim is not a number: {value}")))
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A problem encoding or verifying a token.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    /// The token is not a well-formed JWT, or is missing required claims.
    pub fn is_malformed(&self) -> bool {
        matches!(self.0, ErrorKind::Malformed(_))
    }

    /// None of the candidate keys validates the signature.
    pub fn is_signature(&self) -> bool {
        matches!(self.0, ErrorKind::Signature(_))
    }

    /// The token expired, even after accounting for clock skew.
    pub fn is_expired(&self) -> bool {
        matches!(self.0, ErrorKind::Expired(_))
    }

    /// The token was issued in the future, even after accounting for clock
    /// skew.
    pub fn is_too_early(&self) -> bool {
        matches!(self.0, ErrorKind::TooEarly(_))
    }

    /// The token audience does not match the expected audience.
    pub fn is_audience(&self) -> bool {
        matches!(self.0, ErrorKind::Audience(_))
    }

    /// The verification keys could not be obtained.
    pub fn is_certs(&self) -> bool {
        matches!(self.0, ErrorKind::Certs(_))
    }

    /// The token could not be created.
    pub fn is_encoding(&self) -> bool {
        matches!(self.0, ErrorKind::Encoding(_))
    }

    /// Creates an error representing a failure to load verification keys.
    ///
    /// Use this in custom [CertsProvider] implementations.
    pub fn certs<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::Certs(source.into()))
    }

    pub(crate) fn malformed<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::Malformed(source.into()))
    }

    pub(crate) fn signature<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::Signature(source.into()))
    }

    pub(crate) fn expired<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::Expired(source.into()))
    }

    pub(crate) fn too_early<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::TooEarly(source.into()))
    }

    pub(crate) fn audience<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::Audience(source.into()))
    }

    pub(crate) fn encoding<T: Into<BoxError>>(source: T) -> Self {
        Self(ErrorKind::Encoding(source.into()))
    }
}

#[derive(thiserror::Error, Debug)]
enum ErrorKind {
    #[error("malformed token: {0}")]
    Malformed(#[source] BoxError),
    #[error("signature verification failed: {0}")]
    Signature(#[source] BoxError),
    #[error("expired token: {0}")]
    Expired(#[source] BoxError),
    #[error("token used too early: {0}")]
    TooEarly(#[source] BoxError),
    #[error("audience mismatch: {0}")]
    Audience(#[source] BoxError),
    #[error("cannot load verification keys: {0}")]
    Certs(#[source] BoxError),
    #[error("cannot encode token: {0}")]
    Encoding(#[source] BoxError),
}

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

//! Credentials using [Self-signed JWTs].
//!
//! Many Google Cloud services accept a JWT signed by a service account key
//! in place of an access token. These credentials sign such a JWT locally,
//! skipping the round trip to the token endpoint. Refreshing the token signs a
//! new JWT, no network calls are involved.
//!
//! The JWT contains either an audience (`aud`), typically the service
//! endpoint, or the requested scopes (`scope`). When the application sets an
//! audience the scopes are not included.
//!
//! [Self-signed JWTs]: https://google.aip.dev/auth/4111

use crate::Result;
use crate::build_errors::Error as BuildError;
use crate::clock::{self, Clock};
use crate::credentials::service_account::{DEFAULT_SCOPE, ServiceAccountKey};
use crate::credentials::{Credentials, TokenCredentials};
use crate::errors::CredentialsError;
use crate::jwt::{self, Claims, ClaimsBuilder, DEFAULT_TOKEN_LIFETIME};
use crate::signer::Signer;
use crate::token::{TokenExchangeResult, TokenProvider, TokenRequest};
use crate::token_cache::{DEFAULT_REFRESH_MARGIN, TokenCache};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Creates self-signed JWT [Credentials] from a service account key.
///
/// # Example
/// ```
/// # use cloud_credentials::credentials::self_signed::Builder;
/// let service_account_key = serde_json::json!({ /* add details here */ });
/// let credentials = Builder::new(service_account_key)
///     .with_audience("https://pubsub.googleapis.com/")
///     .build();
/// ```
#[derive(Debug)]
pub struct Builder {
    service_account_key: Value,
    audience: Option<String>,
    scopes: Option<Vec<String>>,
    claims: Claims,
    lifetime: Duration,
    quota_project_id: Option<String>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl Builder {
    pub fn new(service_account_key: Value) -> Self {
        Self {
            service_account_key,
            audience: None,
            scopes: None,
            claims: Claims::new(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
            quota_project_id: None,
            clock: clock::system(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Sets the `aud` claim, typically `https://{service}/`.
    pub fn with_audience<S: Into<String>>(mut self, v: S) -> Self {
        self.audience = Some(v.into());
        self
    }

    /// Sets the scopes included in the `scope` claim.
    ///
    /// Ignored if the audience is set. Defaults to the `cloud-platform` scope.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Adds a custom claim to every JWT.
    ///
    /// Custom claims never replace the claims set by the credentials (`iss`,
    /// `sub`, `aud`, `scope`, `iat`, `exp`).
    pub fn with_claim<K: Into<String>>(mut self, name: K, value: Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }

    /// Changes the lifetime of each JWT. Capped at one hour.
    pub fn with_lifetime(mut self, v: Duration) -> Self {
        self.lifetime = v;
        self
    }

    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    pub fn with_clock(mut self, v: Arc<dyn Clock>) -> Self {
        self.clock = v;
        self
    }

    pub fn with_refresh_margin(mut self, v: Duration) -> Self {
        self.refresh_margin = v;
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the service account key cannot be parsed.
    pub fn build(self) -> std::result::Result<Credentials, BuildError> {
        let key = ServiceAccountKey::from_json(self.service_account_key)?;
        let signer = key.signer()?;
        let scopes = match self.audience {
            Some(_) => Vec::new(),
            None => self
                .scopes
                .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]),
        };
        let provider = SelfSignedTokenProvider {
            key,
            signer,
            audience: self.audience,
            claims: self.claims,
            lifetime: self.lifetime,
            clock: self.clock.clone(),
        };
        let cache = TokenCache::new(provider, scopes, self.clock)
            .with_refresh_margin(self.refresh_margin);
        Ok(Credentials::from(TokenCredentials::new(
            cache,
            self.quota_project_id,
        )))
    }
}

#[derive(Debug)]
struct SelfSignedTokenProvider {
    key: ServiceAccountKey,
    signer: Signer,
    audience: Option<String>,
    claims: Claims,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

#[async_trait::async_trait]
impl TokenProvider for SelfSignedTokenProvider {
    async fn fetch(&self, request: &TokenRequest) -> Result<TokenExchangeResult> {
        let mut builder = self
            .claims
            .iter()
            .fold(ClaimsBuilder::new(&self.key.client_email), |b, (k, v)| {
                b.with_claim(k, v.clone())
            })
            .with_lifetime(self.lifetime);
        builder = match &self.audience {
            Some(aud) => builder.with_audience(aud),
            None => builder.with_scopes(&request.scopes),
        };
        let claims = builder
            .build(self.clock.as_ref())
            .map_err(|e| CredentialsError::new(false, "cannot create the JWT claims", e))?;
        let expires_at = claims
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok());
        let token = jwt::encode(&self.signer, &claims, None)
            .map_err(|e| CredentialsError::new(false, "cannot sign the JWT", e))?;
        Ok(TokenExchangeResult {
            expires_at,
            ..TokenExchangeResult::bearer(token, None)
        })
    }

    async fn project_id(&self) -> Option<String> {
        self.key.project_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::{FakeClock, t0};
    use crate::credentials::TokenState;
    use crate::jwt::Decoder;
    use crate::jwt::certs::StaticCerts;
    use crate::signer::PublicKey;
    use crate::signer::tests::{ec_private_pem, ec_public_pem, rsa_private_pem, rsa_public_pem};
    use serde_json::json;

    type TestResult = anyhow::Result<()>;

    const EMAIL: &str = "test-sa@test-project.iam.gserviceaccount.com";

    fn key_json(private_key: String) -> Value {
        json!({
            "type": "service_account",
            "client_email": EMAIL,
            "private_key_id": "test-private-key-id",
            "private_key": private_key,
            "project_id": "test-project",
        })
    }

    async fn decode(token: &str, public_pem: &str, clock: Arc<FakeClock>) -> anyhow::Result<Claims> {
        let certs = StaticCerts::new([PublicKey::from_pem(public_pem)?.with_key_id("test-private-key-id")]);
        Ok(Decoder::new().with_clock(clock).decode(token, &certs).await?)
    }

    #[tokio::test]
    async fn with_audience() -> TestResult {
        let clock = FakeClock::new(t0());
        let credentials = Builder::new(key_json(rsa_private_pem()))
            .with_audience("https://pubsub.googleapis.com/")
            .with_scopes(["ignored-scope"])
            .with_claim("custom", json!("value"))
            .with_claim("iss", json!("not-the-issuer"))
            .with_clock(clock.clone())
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.expires_at, Some(t0() + Duration::from_secs(3600)));

        let claims = decode(&token.token, &rsa_public_pem(), clock.clone()).await?;
        assert_eq!(claims["iss"], EMAIL);
        assert_eq!(claims["sub"], EMAIL);
        assert_eq!(claims["aud"], "https://pubsub.googleapis.com/");
        assert_eq!(claims["custom"], "value");
        assert!(claims.get("scope").is_none(), "{claims:?}");
        assert_eq!(credentials.project_id().await.as_deref(), Some("test-project"));
        Ok(())
    }

    #[tokio::test]
    async fn with_scopes_and_ec_key() -> TestResult {
        let clock = FakeClock::new(t0());
        let credentials = Builder::new(key_json(ec_private_pem()))
            .with_scopes(["scope1", "scope2"])
            .with_lifetime(Duration::from_secs(600))
            .with_clock(clock.clone())
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.expires_at, Some(t0() + Duration::from_secs(600)));
        let (header, _) = jwt::decode_unverified(&token.token)?;
        assert_eq!(header.alg, "ES256");
        assert_eq!(header.kid.as_deref(), Some("test-private-key-id"));

        let claims = decode(&token.token, &ec_public_pem(), clock.clone()).await?;
        assert_eq!(claims["scope"], "scope1 scope2");
        assert!(claims.get("aud").is_none(), "{claims:?}");
        Ok(())
    }

    #[tokio::test]
    async fn default_scope_and_lifetime_cap() -> TestResult {
        let clock = FakeClock::new(t0());
        let credentials = Builder::new(key_json(rsa_private_pem()))
            .with_lifetime(Duration::from_secs(7200))
            .with_clock(clock.clone())
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.expires_at, Some(t0() + Duration::from_secs(3600)));
        let (_, claims) = jwt::decode_unverified(&token.token)?;
        assert_eq!(claims["scope"], DEFAULT_SCOPE);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_signs_a_new_token() -> TestResult {
        let clock = FakeClock::new(t0());
        let credentials = Builder::new(key_json(rsa_private_pem()))
            .with_clock(clock.clone())
            .build()?;
        let first = credentials.token().await?;

        clock.advance(Duration::from_secs(3600));
        assert_eq!(credentials.token_state(), TokenState::Expired);
        let second = credentials.token().await?;
        assert_ne!(first.token, second.token);
        assert_eq!(
            second.expires_at,
            Some(t0() + Duration::from_secs(2 * 3600))
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_key_fails_to_sign() -> TestResult {
        let credentials = Builder::new(key_json(String::new())).build()?;
        let err = credentials.token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert_eq!(credentials.token_state(), TokenState::Invalid);
        Ok(())
    }

    #[test]
    fn bad_key() {
        let err = Builder::new(json!({"client_email": EMAIL}))
            .build()
            .unwrap_err();
        assert!(err.is_parsing(), "{err:?}");
    }
}

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

//! Service account [ID token] credentials.
//!
//! Some services, such as Cloud Run or services behind Identity-Aware Proxy,
//! authenticate callers with an OIDC ID token instead of an access token. The
//! credentials in this module sign a JWT assertion with a service account key,
//! including a `target_audience` claim, and exchange it for an ID token
//! issued to that audience.
//!
//! The ID token is sent as the bearer token. Its expiration time comes from
//! the token's own `exp` claim.
//!
//! ```
//! # use cloud_credentials::credentials::idtoken::Builder;
//! let service_account_key = serde_json::json!({
//!     "type": "service_account",
//!     "client_email": "test-client-email",
//!     "private_key_id": "test-private-key-id",
//!     "private_key": "", // <-- Provide valid PKCS#8 PEM key here
//!     "project_id": "test-project-id",
//! });
//! let credentials = Builder::new("https://my-service.example.com", service_account_key)
//!     .build()?;
//! # Ok::<(), cloud_credentials::build_errors::Error>(())
//! ```
//!
//! [ID token]: https://cloud.google.com/docs/authentication/token-types#identity-tokens

use crate::Result;
use crate::build_errors::Error as BuildError;
use crate::clock::{self, Clock};
use crate::credentials::oauth2::{self, OAUTH2_TOKEN_URI};
use crate::credentials::service_account::ServiceAccountKey;
use crate::credentials::{Credentials, TokenCredentials, invalid_response};
use crate::errors::CredentialsError;
use crate::http::{HttpTransport, default_transport};
use crate::jwt::{self, ClaimsBuilder};
use crate::signer::Signer;
use crate::token::{TokenExchangeResult, TokenProvider, TokenRequest};
use crate::token_cache::{DEFAULT_REFRESH_MARGIN, TokenCache};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const CRED_TYPE: &str = "sa";

/// The token endpoint response for a `target_audience` assertion.
#[derive(serde::Deserialize)]
struct IdTokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// A builder for service account credentials that return ID tokens.
#[derive(Debug)]
pub struct Builder {
    target_audience: String,
    service_account_key: Value,
    token_uri: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl Builder {
    /// Creates a builder for ID tokens issued to `target_audience`, typically
    /// the URL of the receiving service.
    pub fn new<S: Into<String>>(target_audience: S, service_account_key: Value) -> Self {
        Self {
            target_audience: target_audience.into(),
            service_account_key,
            token_uri: None,
            transport: None,
            clock: clock::system(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Sets the token endpoint.
    ///
    /// Any value provided here overrides the `token_uri` in the key.
    pub fn with_token_uri<S: Into<String>>(mut self, token_uri: S) -> Self {
        self.token_uri = Some(token_uri.into());
        self
    }

    pub fn with_transport(mut self, v: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(v);
        self
    }

    pub fn with_clock(mut self, v: Arc<dyn Clock>) -> Self {
        self.clock = v;
        self
    }

    /// Refresh the token this long before it expires. Defaults to 10 seconds.
    pub fn with_refresh_margin(mut self, v: Duration) -> Self {
        self.refresh_margin = v;
        self
    }

    /// Returns a [Credentials] instance whose tokens are ID tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing required fields, or if the
    /// private key cannot be parsed.
    pub fn build(self) -> std::result::Result<Credentials, BuildError> {
        let key = ServiceAccountKey::from_json(self.service_account_key)?;
        let signer = key.signer()?;
        let token_uri = self
            .token_uri
            .or_else(|| key.token_uri.clone())
            .unwrap_or_else(|| OAUTH2_TOKEN_URI.to_string());
        let provider = IdTokenProvider {
            key,
            signer,
            target_audience: self.target_audience,
            token_uri,
            transport: self.transport.unwrap_or_else(default_transport),
            clock: self.clock.clone(),
        };
        let cache = TokenCache::new(provider, Vec::new(), self.clock)
            .with_refresh_margin(self.refresh_margin);
        Ok(Credentials::from(TokenCredentials::new(cache, None)))
    }
}

#[derive(Debug)]
struct IdTokenProvider {
    key: ServiceAccountKey,
    signer: Signer,
    target_audience: String,
    token_uri: String,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
}

impl IdTokenProvider {
    fn assertion(&self) -> Result<String> {
        ClaimsBuilder::new(&self.key.client_email)
            .with_audience(&self.token_uri)
            .with_claim("target_audience", Value::String(self.target_audience.clone()))
            .build(self.clock.as_ref())
            .and_then(|c| jwt::encode(&self.signer, &c, None))
            .map_err(|e| CredentialsError::new(false, "cannot create the JWT assertion", e))
    }
}

/// The expiration time in the unverified `exp` claim, if any.
fn expiration(id_token: &str) -> Result<Option<OffsetDateTime>> {
    let (_, claims) = jwt::decode_unverified(id_token).map_err(invalid_response)?;
    claims
        .get("exp")
        .and_then(Value::as_i64)
        .map(OffsetDateTime::from_unix_timestamp)
        .transpose()
        .map_err(invalid_response)
}

#[async_trait::async_trait]
impl TokenProvider for IdTokenProvider {
    async fn fetch(&self, _request: &TokenRequest) -> Result<TokenExchangeResult> {
        let assertion = self.assertion()?;
        let response: IdTokenResponse = oauth2::exchange_as(
            self.transport.as_ref(),
            &self.token_uri,
            [
                ("grant_type", JWT_BEARER_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ],
            CRED_TYPE,
        )
        .await?;
        let id_token = response.id_token.ok_or_else(|| {
            CredentialsError::from_msg(false, "the token endpoint response has no id_token")
        })?;
        let expires_at = expiration(&id_token)?;
        Ok(TokenExchangeResult {
            expires_at,
            id_token: Some(id_token.clone()),
            ..TokenExchangeResult::bearer(id_token, None)
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
    use crate::http::ReqwestTransport;
    use crate::jwt::Decoder;
    use crate::jwt::certs::StaticCerts;
    use crate::signer::PublicKey;
    use crate::signer::tests::{rsa_private_pem, rsa_public_pem};
    use http::header::AUTHORIZATION;
    use httptest::matchers::{all_of, contains, key, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    type TestResult = anyhow::Result<()>;

    const EMAIL: &str = "test-sa@test-project.iam.gserviceaccount.com";

    fn key_json() -> Value {
        json!({
            "type": "service_account",
            "client_email": EMAIL,
            "private_key_id": "test-private-key-id",
            "private_key": rsa_private_pem(),
            "project_id": "test-project",
        })
    }

    fn transport() -> Arc<dyn HttpTransport> {
        Arc::new(ReqwestTransport::builder().build().expect("default transport"))
    }

    // An ID token as the token endpoint would issue it.
    fn issued_id_token(clock: &dyn Clock, lifetime: Duration) -> anyhow::Result<String> {
        let claims = ClaimsBuilder::new("https://accounts.google.com")
            .with_subject("1234567890")
            .with_audience("https://my-service.example.com")
            .with_lifetime(lifetime)
            .build(clock)?;
        Ok(jwt::encode(&Signer::from_pem(&rsa_private_pem())?, &claims, None)?)
    }

    #[tokio::test]
    async fn assertion_claims() -> TestResult {
        let clock = FakeClock::new(t0());
        let key = ServiceAccountKey::from_json(key_json())?;
        let provider = IdTokenProvider {
            signer: key.signer()?,
            key,
            target_audience: "https://my-service.example.com".into(),
            token_uri: "https://example.com/token".into(),
            transport: transport(),
            clock: clock.clone(),
        };
        let assertion = provider.assertion()?;

        let certs = StaticCerts::new([PublicKey::from_pem(&rsa_public_pem())?]);
        let claims = Decoder::new()
            .with_audience("https://example.com/token")
            .with_clock(clock.clone())
            .decode(&assertion, &certs)
            .await?;
        assert_eq!(claims["iss"], EMAIL);
        assert_eq!(claims["sub"], EMAIL);
        assert_eq!(claims["target_audience"], "https://my-service.example.com");
        assert_eq!(claims.get("scope"), None);
        Ok(())
    }

    #[tokio::test]
    async fn id_token_exchange() -> TestResult {
        let clock = FakeClock::new(t0());
        let id_token = issued_id_token(clock.as_ref(), Duration::from_secs(1800))?;
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains(("grant_type", JWT_BEARER_GRANT_TYPE)))),
                request::body(url_decoded(contains(key("assertion")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({"id_token": id_token}))),
        );

        let credentials = Builder::new("https://my-service.example.com", key_json())
            .with_token_uri(server.url("/token").to_string())
            .with_transport(transport())
            .with_clock(clock.clone())
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.token, id_token);
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_at, Some(t0() + Duration::from_secs(1800)));
        assert_eq!(credentials.token_state(), TokenState::Valid);

        // Served from the cache.
        let headers = credentials.headers().await?;
        assert_eq!(
            headers.get(AUTHORIZATION).map(|v| v.as_bytes()),
            Some(format!("Bearer {id_token}").as_bytes())
        );
        assert_eq!(credentials.project_id().await.as_deref(), Some("test-project"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_id_token() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .times(1)
                .respond_with(json_encoded(json!({"access_token": "AT", "expires_in": 3600}))),
        );
        let credentials = Builder::new("https://my-service.example.com", key_json())
            .with_token_uri(server.url("/token").to_string())
            .with_transport(transport())
            .build()?;
        let err = credentials.token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("id_token"), "{err}");
        assert_eq!(credentials.token_state(), TokenState::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn id_token_not_a_jwt() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .times(1)
                .respond_with(json_encoded(json!({"id_token": "not-a-jwt"}))),
        );
        let credentials = Builder::new("https://my-service.example.com", key_json())
            .with_token_uri(server.url("/token").to_string())
            .with_transport(transport())
            .build()?;
        let err = credentials.token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn id_token_transient_error() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .times(1)
                .respond_with(status_code(503)),
        );
        let credentials = Builder::new("https://my-service.example.com", key_json())
            .with_token_uri(server.url("/token").to_string())
            .with_transport(transport())
            .build()?;
        let err = credentials.token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert_eq!(credentials.token_state(), TokenState::Uninitialized);
        Ok(())
    }

    #[test]
    fn expiration_without_exp() -> TestResult {
        let claims = json!({"iss": "https://accounts.google.com"});
        let claims = claims.as_object().cloned().unwrap_or_default();
        let token = jwt::encode(&Signer::from_pem(&rsa_private_pem())?, &claims, None)?;
        assert_eq!(expiration(&token)?, None);
        Ok(())
    }
}

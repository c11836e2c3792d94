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

//! [Service Account] Credentials type.
//!
//! A service account is an account for an application or compute workload
//! instead of an individual end user. When the application runs outside of
//! Google Cloud it may need a downloaded [service account key] to
//! authenticate.
//!
//! A service account key is a JSON object, in the format described by
//! [aip/4112]. It contains the service account email, and a private key. The
//! credentials in this module sign a JWT assertion with the private key and
//! exchange that assertion for an access token, as described in [RFC 7523].
//!
//! Services account keys should be treated as any other secret with security
//! implications. Think of them as unencrypted passwords. Do not store them
//! where unauthorized persons or programs may read them.
//!
//! Example usage:
//!
//! ```
//! # use cloud_credentials::credentials::service_account::Builder;
//! # use cloud_credentials::credentials::Credentials;
//! let service_account_key = serde_json::json!({
//!     "type": "service_account",
//!     "client_email": "test-client-email",
//!     "private_key_id": "test-private-key-id",
//!     "private_key": "", // <-- Provide valid PKCS#8 PEM key here
//!     "project_id": "test-project-id",
//! });
//! let credentials: Credentials = Builder::new(service_account_key)
//!     .with_quota_project_id("my-quota-project")
//!     .build()?;
//! # Ok::<(), cloud_credentials::build_errors::Error>(())
//! ```
//!
//! [aip/4112]: https://google.aip.dev/auth/4112
//! [RFC 7523]: https://datatracker.ietf.org/doc/html/rfc7523
//! [Service Account]: https://cloud.google.com/iam/docs/service-account-creds
//! [service account key]: https://cloud.google.com/iam/docs/keys-create-delete#creating

use crate::Result;
use crate::build_errors::Error as BuildError;
use crate::clock::{self, Clock};
use crate::credentials::oauth2::{self, OAUTH2_TOKEN_URI};
use crate::credentials::{Credentials, TokenCredentials};
use crate::errors::CredentialsError;
use crate::http::{HttpTransport, default_transport};
use crate::jwt::{self, ClaimsBuilder};
use crate::signer::Signer;
use crate::token::{TokenExchangeResult, TokenProvider, TokenRequest};
use crate::token_cache::{DEFAULT_REFRESH_MARGIN, TokenCache};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const CRED_TYPE: &str = "sa";

/// The default scope requested when the application does not set any.
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// A representation of a [service account key].
///
/// [service account key]: https://cloud.google.com/iam/docs/keys-create-delete#creating
#[derive(serde::Deserialize, Default, Clone)]
pub struct ServiceAccountKey {
    /// The client email address of the service account.
    /// (e.g., "my-sa@my-project.iam.gserviceaccount.com").
    pub client_email: String,
    /// ID of the service account's private key.
    pub private_key_id: String,
    /// The PEM-encoded PKCS#8 private key string associated with the service
    /// account.
    pub private_key: String,
    /// The project id the service account belongs to.
    pub project_id: Option<String>,
    /// The token endpoint, defaults to `https://oauth2.googleapis.com/token`.
    pub token_uri: Option<String>,
    /// The universe domain this service account belongs to.
    pub universe_domain: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"[censored]")
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .field("universe_domain", &self.universe_domain)
            .finish()
    }
}

impl ServiceAccountKey {
    pub(crate) fn from_json(json: Value) -> std::result::Result<Self, BuildError> {
        serde_json::from_value(json).map_err(BuildError::parsing)
    }

    pub(crate) fn signer(&self) -> std::result::Result<Signer, BuildError> {
        let signer = Signer::from_pem(&self.private_key).map_err(BuildError::parsing)?;
        if self.private_key_id.is_empty() {
            return Ok(signer);
        }
        Ok(signer.with_key_id(&self.private_key_id))
    }
}

/// A builder for service account [Credentials].
///
/// The builder consumes a JSON service account key. Applications can change
/// the scopes, the token endpoint, and the quota project.
#[derive(Debug)]
pub struct Builder {
    service_account_key: Value,
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
    token_uri: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl Builder {
    /// Creates a new builder using the `service_account_key` JSON value.
    pub fn new(service_account_key: Value) -> Self {
        Self {
            service_account_key,
            scopes: None,
            quota_project_id: None,
            token_uri: None,
            transport: None,
            clock: clock::system(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Sets the [scopes] for these credentials.
    ///
    /// By default the credentials request the `cloud-platform` scope.
    ///
    /// [scopes]: https://developers.google.com/identity/protocols/oauth2/scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
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

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not valid JSON, if any required field is
    /// missing, or if the private key cannot be parsed.
    pub fn build(self) -> std::result::Result<Credentials, BuildError> {
        let key = ServiceAccountKey::from_json(self.service_account_key)?;
        let signer = key.signer()?;
        let token_uri = self
            .token_uri
            .or_else(|| key.token_uri.clone())
            .unwrap_or_else(|| OAUTH2_TOKEN_URI.to_string());
        let scopes = self
            .scopes
            .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);
        let provider = ServiceAccountTokenProvider {
            key,
            signer,
            token_uri,
            transport: self.transport.unwrap_or_else(default_transport),
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
struct ServiceAccountTokenProvider {
    key: ServiceAccountKey,
    signer: Signer,
    token_uri: String,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
}

impl ServiceAccountTokenProvider {
    fn assertion(&self, scopes: &[String]) -> Result<String> {
        ClaimsBuilder::new(&self.key.client_email)
            .with_audience(&self.token_uri)
            .with_scopes(scopes)
            .build(self.clock.as_ref())
            .and_then(|c| jwt::encode(&self.signer, &c, None))
            .map_err(|e| CredentialsError::new(false, "cannot create the JWT assertion", e))
    }
}

#[async_trait::async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn fetch(&self, request: &TokenRequest) -> Result<TokenExchangeResult> {
        let assertion = self.assertion(&request.scopes)?;
        let response = oauth2::exchange(
            self.transport.as_ref(),
            &self.token_uri,
            [
                ("grant_type", JWT_BEARER_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ],
            CRED_TYPE,
        )
        .await?;
        Ok(response.into_exchange_result())
    }

    async fn project_id(&self) -> Option<String> {
        self.key.project_id.clone()
    }
}

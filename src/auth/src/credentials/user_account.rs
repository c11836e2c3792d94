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

//! [User Account] Credentials type.
//!
//! User accounts represent a developer, administrator, or any other person who
//! interacts with Google APIs and services. User accounts are managed as
//! [Google Accounts], either via [Google Workspace] or [Cloud Identity].
//!
//! This module provides [Credentials] derived from user account
//! information, specifically utilizing an OAuth 2.0 refresh token.
//!
//! This module is designed for refresh tokens obtained via the standard
//! [Authorization Code grant]. Acquiring the initial refresh token (e.g., through
//! user consent) is outside the scope of this library.
//! See [RFC 6749 Section 4.1] for flow details.
//!
//! These credentials are typically found in the gcloud configuration
//! directory, and created by running `gcloud auth application-default login`.
//!
//! If the token endpoint rotates the refresh token, the credentials use the new
//! refresh token in later exchanges. The new refresh token is only kept in
//! memory.
//!
//! Example usage:
//!
//! ```
//! # use cloud_credentials::credentials::user_account::Builder;
//! # use cloud_credentials::credentials::Credentials;
//! let authorized_user = serde_json::json!({
//!     "client_id": "YOUR_CLIENT_ID.apps.googleusercontent.com",
//!     "client_secret": "YOUR_CLIENT_SECRET",
//!     "refresh_token": "YOUR_REFRESH_TOKEN",
//!     "type": "authorized_user",
//! });
//! let credentials: Credentials = Builder::new(authorized_user).build()?;
//! # Ok::<(), cloud_credentials::build_errors::Error>(())
//! ```
//!
//! [Authorization Code grant]: https://tools.ietf.org/html/rfc6749#section-1.3.1
//! [Cloud Identity]: https://cloud.google.com/identity
//! [Google Accounts]: https://myaccount.google.com/
//! [Google Workspace]: https://workspace.google.com/
//! [RFC 6749 Section 4.1]: https://datatracker.ietf.org/doc/html/rfc6749#section-4.1
//! [User Account]: https://cloud.google.com/docs/authentication#user-accounts

use crate::Result;
use crate::build_errors::Error as BuildError;
use crate::clock::{self, Clock};
use crate::credentials::oauth2::{self, OAUTH2_TOKEN_URI};
use crate::credentials::{Credentials, TokenCredentials};
use crate::errors::{CredentialsError, oauth_error};
use crate::http::{HttpTransport, default_transport};
use crate::token::{TokenExchangeResult, TokenProvider, TokenRequest};
use crate::token_cache::{DEFAULT_REFRESH_MARGIN, TokenCache};
use http::StatusCode;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

const CRED_TYPE: &str = "u";

/// A builder for constructing `user_account` [Credentials] instance.
///
/// # Example
/// ```
/// # use cloud_credentials::credentials::user_account::Builder;
/// let authorized_user = serde_json::json!({ /* add details here */ });
/// let credentials = Builder::new(authorized_user).build();
/// ```
#[derive(Debug)]
pub struct Builder {
    authorized_user: Value,
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
    token_uri: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl Builder {
    /// Creates a new builder using `authorized_user` JSON value.
    ///
    /// The `authorized_user` JSON is typically generated when a user
    /// authenticates using the [application-default login] process.
    ///
    /// [application-default login]: https://cloud.google.com/sdk/gcloud/reference/auth/application-default/login
    pub fn new(authorized_user: Value) -> Self {
        Self {
            authorized_user,
            scopes: None,
            quota_project_id: None,
            token_uri: None,
            transport: None,
            clock: clock::system(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Sets the URI for the token endpoint used to fetch access tokens.
    ///
    /// Any value provided here overrides a `token_uri` value from the input
    /// `authorized_user` JSON. Defaults to `https://oauth2.googleapis.com/token`
    /// if not specified here or in the `authorized_user` JSON.
    pub fn with_token_uri<S: Into<String>>(mut self, token_uri: S) -> Self {
        self.token_uri = Some(token_uri.into());
        self
    }

    /// Sets the [scopes] for these credentials.
    ///
    /// `scopes` define the *permissions being requested* for this specific
    /// access token. When a token generated with specific scopes is used, the
    /// request must be permitted by both the user account's underlying IAM
    /// permissions and the scopes requested for the token.
    ///
    /// If no scopes are set the token endpoint grants the scopes of the
    /// original authorization.
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
    /// Any value set here overrides a `quota_project_id` value from the
    /// input `authorized_user` JSON.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
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

    pub fn with_refresh_margin(mut self, v: Duration) -> Self {
        self.refresh_margin = v;
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the `authorized_user` provided to [`Builder::new`]
    /// cannot be deserialized into the expected format. This typically happens
    /// if the JSON value is malformed or missing required fields.
    pub fn build(self) -> std::result::Result<Credentials, BuildError> {
        let authorized_user = serde_json::from_value::<AuthorizedUser>(self.authorized_user)
            .map_err(BuildError::parsing)?;
        let token_uri = self
            .token_uri
            .or(authorized_user.token_uri)
            .unwrap_or_else(|| OAUTH2_TOKEN_URI.to_string());
        let quota_project_id = self.quota_project_id.or(authorized_user.quota_project_id);

        let provider = UserTokenProvider {
            client_id: authorized_user.client_id,
            client_secret: authorized_user.client_secret,
            refresh_token: RwLock::new(authorized_user.refresh_token),
            token_uri,
            transport: self.transport.unwrap_or_else(default_transport),
        };
        let cache = TokenCache::new(provider, self.scopes.unwrap_or_default(), self.clock)
            .with_refresh_margin(self.refresh_margin);
        Ok(Credentials::from(TokenCredentials::new(
            cache,
            quota_project_id,
        )))
    }
}

struct UserTokenProvider {
    client_id: String,
    client_secret: String,
    // Replaced when the token endpoint rotates the refresh token.
    refresh_token: RwLock<String>,
    token_uri: String,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for UserTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTokenProvider")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[censored]")
            .field("refresh_token", &"[censored]")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl UserTokenProvider {
    fn refresh_token(&self) -> String {
        self.refresh_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl TokenProvider for UserTokenProvider {
    async fn fetch(&self, request: &TokenRequest) -> Result<TokenExchangeResult> {
        let refresh_token = self.refresh_token();
        let scope = request.scopes.join(" ");
        let mut fields = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];
        if !scope.is_empty() {
            fields.push(("scope", scope.as_str()));
        }
        let mut response = oauth2::exchange(self.transport.as_ref(), &self.token_uri, fields, CRED_TYPE)
            .await
            .map_err(map_revoked)?;
        if let Some(rotated) = response.refresh_token.take() {
            tracing::debug!("the token endpoint rotated the refresh token");
            *self
                .refresh_token
                .write()
                .unwrap_or_else(PoisonError::into_inner) = rotated;
        }
        Ok(response.into_exchange_result())
    }
}

// The token endpoint reports a revoked or expired refresh token as a 400 with
// an `invalid_grant` error.
fn map_revoked(e: CredentialsError) -> CredentialsError {
    if e.status_code() != Some(StatusCode::BAD_REQUEST) {
        return e;
    }
    match e.response_body().and_then(|b| oauth_error(b.as_bytes())) {
        Some(o) if o.error == "invalid_grant" => {
            let detail = o
                .error_description
                .map(|d| format!(": {d}"))
                .unwrap_or_default();
            CredentialsError::revoked(format!("the refresh token was revoked or expired{detail}"))
        }
        _ => e,
    }
}

#[derive(PartialEq, serde::Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default)]
    token_uri: Option<String>,
    #[serde(default)]
    quota_project_id: Option<String>,
}

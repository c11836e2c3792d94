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

//! Types and functions to work with Google Cloud authentication [Credentials].
//!
//! [Credentials]: https://cloud.google.com/docs/authentication#credentials

pub mod idtoken;
pub mod mds;
pub(crate) mod oauth2;
pub mod platform;
pub mod resolve;
pub mod self_signed;
pub mod service_account;
pub mod user_account;

use crate::Result;
use crate::build_errors::Error as BuildError;
use crate::errors::CredentialsError;
use crate::headers_util::build_headers;
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use http::HeaderMap;
use std::future::Future;
use std::sync::Arc;

pub(crate) const QUOTA_PROJECT_KEY: &str = "x-goog-user-project";

/// The observable state of a credentials' access token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    /// No token has been obtained yet.
    Uninitialized,
    /// The current token can be used.
    Valid,
    /// The current token expires soon. It can still be used, the next request
    /// starts a refresh and other requests keep using this token meanwhile.
    Stale,
    /// The current token expired. The next request waits for a refresh.
    Expired,
    /// A previous refresh failed with a permanent error. The credentials
    /// cannot produce any more tokens.
    Invalid,
}

/// An implementation of [crate::credentials::CredentialsProvider].
///
/// Represents a [Credentials] used to obtain auth [Token][crate::token::Token]s
/// and the corresponding request headers.
///
/// In general, [Credentials][credentials-link] are "digital object that
/// provide proof of identity", the archetype may be a username and password
/// combination, but a private RSA key may be a better example.
///
/// Modern authentication protocols do not send the credentials to
/// authenticate with a service. Even when sent over encrypted transports,
/// the credentials may be accidentally exposed via logging or may be
/// captured if there are errors in the transport encryption. Because the
/// credentials are often long-lived, that risk of exposure is also
/// long-lived.
///
/// Instead, modern authentication protocols exchange the credentials for a
/// time-limited [Token][token-link], a digital object that shows the caller
/// was in possession of the credentials. Because tokens are time limited,
/// risk of misuse is also time limited. Tokens may be further restricted to
/// only a certain subset of the RPCs in the service, or even to specific
/// resources, or only when used from a given machine (virtual or not).
/// Further limiting the risks associated with any leaks of these tokens.
///
/// This struct also abstracts token sources that are not backed by a
/// specific digital object. The canonical example is the [Metadata Service].
/// This service is available in many Google Cloud environments, including
/// [Google Compute Engine], and [Google Kubernetes Engine].
///
/// `Credentials` is cheap to clone, all the clones share the same token and
/// refresh the token at most once.
///
/// [credentials-link]: https://cloud.google.com/docs/authentication#credentials
/// [token-link]: https://cloud.google.com/docs/authentication#token
/// [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview
/// [Google Compute Engine]: https://cloud.google.com/products/compute
/// [Google Kubernetes Engine]: https://cloud.google.com/kubernetes-engine
#[derive(Clone, Debug)]
pub struct Credentials {
    // We use an `Arc` to hold the inner implementation.
    //
    // Credentials may be shared across threads (`Send + Sync`), so an `Rc`
    // will not do.
    //
    // They also need to derive `Clone`, as the clients which hold them derive
    // `Clone`. So a `Box` will not do.
    inner: Arc<dyn dynamic::CredentialsProvider>,
}

impl<T> std::convert::From<T> for Credentials
where
    T: CredentialsProvider + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

impl Credentials {
    /// Returns a valid access token, refreshing it if needed.
    pub async fn token(&self) -> Result<Token> {
        self.inner.token().await
    }

    /// Returns the headers to authenticate a request.
    pub async fn headers(&self) -> Result<HeaderMap> {
        self.inner.headers().await
    }

    /// Adds the authentication headers to `headers`.
    ///
    /// Any existing authentication headers are replaced. On error `headers`
    /// is left unchanged.
    pub async fn before_request(&self, headers: &mut HeaderMap) -> Result<()> {
        let auth = self.inner.headers().await?;
        for (name, value) in auth.iter() {
            headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Forces a token refresh.
    ///
    /// Concurrent calls share a single token exchange.
    pub async fn refresh(&self) -> Result<Token> {
        self.inner.refresh().await
    }

    /// Returns true if the current token can be used without a refresh.
    ///
    /// This function never blocks, and never performs any I/O.
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn token_state(&self) -> TokenState {
        self.inner.token_state()
    }

    /// Returns the current token, if it is valid.
    pub fn cached_token(&self) -> Option<Token> {
        self.inner.cached_token()
    }

    pub fn quota_project_id(&self) -> Option<String> {
        self.inner.quota_project_id()
    }

    /// Returns the project associated with the credentials, if known.
    ///
    /// Some credential types (service account keys, the metadata service)
    /// know their project. For others this returns `None`.
    pub async fn project_id(&self) -> Option<String> {
        self.inner.project_id().await
    }
}

/// Represents a [Credentials] used to obtain tokens and auth headers.
///
/// This trait is implemented by all the credential types in this crate.
/// Applications may implement it to provide their own credentials, or to mock
/// [Credentials] in their tests.
///
/// [Credentials]: https://cloud.google.com/docs/authentication#credentials
pub trait CredentialsProvider: std::fmt::Debug {
    /// Asynchronously retrieves a token.
    ///
    /// Returns a [Token][crate::token::Token] for the current credentials.
    /// The underlying implementation refreshes the token as needed.
    fn token(&self) -> impl Future<Output = Result<Token>> + Send;

    /// Asynchronously constructs the auth headers.
    ///
    /// Different auth tokens are sent via different headers. The
    /// [Credentials] constructs the headers (and header values) that should
    /// be sent with a request.
    fn headers(&self) -> impl Future<Output = Result<HeaderMap>> + Send;

    /// Forces a token refresh, even if the current token is valid.
    fn refresh(&self) -> impl Future<Output = Result<Token>> + Send;

    /// Retrieves the project associated with these credentials, if any.
    fn project_id(&self) -> impl Future<Output = Option<String>> + Send {
        std::future::ready(None)
    }

    fn valid(&self) -> bool;

    fn token_state(&self) -> TokenState;

    fn cached_token(&self) -> Option<Token>;

    fn quota_project_id(&self) -> Option<String> {
        None
    }
}

pub(crate) mod dynamic {
    use super::{HeaderMap, Result, Token, TokenState};

    /// A dyn-compatible, crate-private version of `CredentialsProvider`.
    #[async_trait::async_trait]
    pub trait CredentialsProvider: Send + Sync + std::fmt::Debug {
        async fn token(&self) -> Result<Token>;
        async fn headers(&self) -> Result<HeaderMap>;
        async fn refresh(&self) -> Result<Token>;
        async fn project_id(&self) -> Option<String>;
        fn valid(&self) -> bool;
        fn token_state(&self) -> TokenState;
        fn cached_token(&self) -> Option<Token>;
        fn quota_project_id(&self) -> Option<String>;
    }

    /// The public CredentialsProvider implements the dyn-compatible CredentialsProvider.
    #[async_trait::async_trait]
    impl<T> CredentialsProvider for T
    where
        T: super::CredentialsProvider + Send + Sync,
    {
        async fn token(&self) -> Result<Token> {
            T::token(self).await
        }
        async fn headers(&self) -> Result<HeaderMap> {
            T::headers(self).await
        }
        async fn refresh(&self) -> Result<Token> {
            T::refresh(self).await
        }
        async fn project_id(&self) -> Option<String> {
            T::project_id(self).await
        }
        fn valid(&self) -> bool {
            T::valid(self)
        }
        fn token_state(&self) -> TokenState {
            T::token_state(self)
        }
        fn cached_token(&self) -> Option<Token> {
            T::cached_token(self)
        }
        fn quota_project_id(&self) -> Option<String> {
            T::quota_project_id(self)
        }
    }
}

/// The credentials types in this crate: a [TokenProvider] behind a
/// [TokenCache].
#[derive(Debug)]
pub(crate) struct TokenCredentials<T>
where
    T: TokenProvider,
{
    cache: TokenCache<T>,
    quota_project_id: Option<String>,
}

impl<T: TokenProvider> TokenCredentials<T> {
    pub(crate) fn new(cache: TokenCache<T>, quota_project_id: Option<String>) -> Self {
        Self {
            cache,
            quota_project_id,
        }
    }
}

impl<T> CredentialsProvider for TokenCredentials<T>
where
    T: TokenProvider,
{
    async fn token(&self) -> Result<Token> {
        self.cache.token().await
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let token = self.cache.token().await?;
        build_headers(&token, &self.quota_project_id)
    }

    async fn refresh(&self) -> Result<Token> {
        self.cache.refresh().await
    }

    async fn project_id(&self) -> Option<String> {
        self.cache.provider().project_id().await
    }

    fn valid(&self) -> bool {
        self.cache.valid()
    }

    fn token_state(&self) -> TokenState {
        self.cache.token_state()
    }

    fn cached_token(&self) -> Option<Token> {
        self.cache.cached_token()
    }

    fn quota_project_id(&self) -> Option<String> {
        self.quota_project_id.clone()
    }
}

/// The quota project configured via `GOOGLE_CLOUD_QUOTA_PROJECT`, if any.
pub(crate) fn quota_project_from_env() -> Option<String> {
    std::env::var("GOOGLE_CLOUD_QUOTA_PROJECT")
        .ok()
        .filter(|v| !v.is_empty())
}

/// A builder for [Credentials] from the contents of a JSON credentials file.
///
/// The `type` field in the JSON selects the kind of credentials:
/// `"service_account"` or `"authorized_user"`.
///
/// # Example
/// ```
/// # use cloud_credentials::credentials::Builder;
/// let json = serde_json::json!({
///     "type": "authorized_user",
///     "client_id": "test-client-id",
///     "client_secret": "test-client-secret",
///     "refresh_token": "test-refresh-token",
/// });
/// let credentials = Builder::new(json)
///     .with_scopes(["https://www.googleapis.com/auth/cloud-platform"])
///     .build()?;
/// # Ok::<(), cloud_credentials::build_errors::Error>(())
/// ```
#[derive(Debug)]
pub struct Builder {
    json: serde_json::Value,
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
}

impl Builder {
    pub fn new(json: serde_json::Value) -> Self {
        Self {
            json,
            scopes: None,
            quota_project_id: None,
        }
    }

    /// Sets the [scopes] for the access tokens.
    ///
    /// The scopes are fixed for the lifetime of the credentials.
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

    /// Sets the [quota project] for the credentials.
    ///
    /// The `GOOGLE_CLOUD_QUOTA_PROJECT` environment variable, if set,
    /// takes precedence over this value and over any quota project in the
    /// JSON.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, v: S) -> Self {
        self.quota_project_id = Some(v.into());
        self
    }

    /// Returns the credentials, or an error if the JSON is not valid.
    pub fn build(self) -> std::result::Result<Credentials, BuildError> {
        let quota_project_id = quota_project_from_env().or(self.quota_project_id);
        let kind = credential_type(&self.json)?.to_string();
        match kind.as_str() {
            "service_account" => {
                let mut builder = service_account::Builder::new(self.json);
                if let Some(s) = self.scopes {
                    builder = builder.with_scopes(s);
                }
                if let Some(q) = quota_project_id {
                    builder = builder.with_quota_project_id(q);
                }
                builder.build()
            }
            "authorized_user" => {
                let mut builder = user_account::Builder::new(self.json);
                if let Some(s) = self.scopes {
                    builder = builder.with_scopes(s);
                }
                if let Some(q) = quota_project_id {
                    builder = builder.with_quota_project_id(q);
                }
                builder.build()
            }
            t => Err(BuildError::unknown_type(t)),
        }
    }
}

fn credential_type(json: &serde_json::Value) -> std::result::Result<&str, BuildError> {
    json.get("type")
        .ok_or_else(|| BuildError::missing_field("type"))?
        .as_str()
        .ok_or_else(|| BuildError::parsing("the `type` field is not a string"))
}

/// Maps a problem parsing a token endpoint response.
///
/// The endpoint returned a successful status code, trying again with the
/// same inputs is unlikely to produce a different result.
pub(crate) fn invalid_response<E>(e: E) -> CredentialsError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CredentialsError::new(false, "cannot parse the token endpoint response", e)
}

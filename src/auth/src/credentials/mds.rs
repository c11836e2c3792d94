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

//! [Metadata Service] Credentials type.
//!
//! Google Cloud environments such as [Google Compute Engine (GCE)][gce-link],
//! [Google Kubernetes Engine (GKE)][gke-link], or [Cloud Run] provide a metadata service.
//! This is a local service to the VM (or pod) which (as the name implies) provides
//! metadata information about the VM. The service also provides access
//! tokens associated with the [default service account] for the corresponding
//! VM.
//!
//! You can use this access token to securely authenticate with Google Cloud,
//! without having to download secrets or other credentials. The types in this
//! module allow you to retrieve these access tokens.
//!
//! The `GCE_METADATA_HOST` environment variable, if set, overrides the
//! address of the metadata service.
//!
//! Example usage:
//!
//! ```
//! # use cloud_credentials::credentials::mds::Builder;
//! # use cloud_credentials::credentials::Credentials;
//! let credentials: Credentials = Builder::default()
//!     .with_quota_project_id("my-quota-project")
//!     .build();
//! ```
//!
//! [Cloud Run]: https://cloud.google.com/run
//! [default service account]: https://cloud.google.com/iam/docs/service-account-types#default
//! [gce-link]: https://cloud.google.com/products/compute
//! [gke-link]: https://cloud.google.com/kubernetes-engine
//! [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview

use crate::Result;
use crate::clock::{self, Clock};
use crate::credentials::{Credentials, TokenCredentials, invalid_response};
use crate::errors::{self, CredentialsError};
use crate::headers_util::with_metrics_header;
use crate::http::{HttpTransport, TransportError, default_transport};
use crate::token::{TokenExchangeResult, TokenProvider, TokenRequest};
use crate::token_cache::{DEFAULT_REFRESH_MARGIN, TokenCache};
use bytes::Bytes;
use http::header::HeaderValue;
use http::{Method, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const METADATA_FLAVOR_VALUE: &str = "Google";
const METADATA_FLAVOR: &str = "metadata-flavor";
const METADATA_ROOT: &str = "http://metadata.google.internal";
const DEFAULT_ACCOUNT: &str = "default";
const CRED_TYPE: &str = "mds";

/// The environment variable that overrides the metadata service address.
pub const GCE_METADATA_HOST_ENV_VAR: &str = "GCE_METADATA_HOST";

/// Creates [Credentials] backed by the metadata service.
#[derive(Debug)]
pub struct Builder {
    endpoint: Option<String>,
    account: String,
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            endpoint: None,
            account: DEFAULT_ACCOUNT.to_string(),
            scopes: None,
            quota_project_id: None,
            transport: None,
            clock: clock::system(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }
}

impl Builder {
    /// Sets the endpoint for the metadata service.
    ///
    /// Defaults to `GCE_METADATA_HOST`, if set, and to
    /// `http://metadata.google.internal` otherwise.
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Selects the service account attached to the VM. Defaults to
    /// `"default"`.
    pub fn with_service_account<S: Into<String>>(mut self, account: S) -> Self {
        self.account = account.into();
        self
    }

    /// Sets the [scopes] for these credentials.
    ///
    /// By default the metadata service returns tokens with the scopes
    /// configured for the VM.
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
    pub fn build(self) -> Credentials {
        let client = MetadataClient::new(
            self.endpoint,
            self.transport.unwrap_or_else(default_transport),
        );
        let provider = MdsTokenProvider {
            client,
            account: self.account,
            project_id: OnceCell::new(),
        };
        let cache = TokenCache::new(provider, self.scopes.unwrap_or_default(), self.clock)
            .with_refresh_margin(self.refresh_margin);
        Credentials::from(TokenCredentials::new(cache, self.quota_project_id))
    }
}

/// A minimal client for the metadata service.
///
/// Applications rarely need this type. It can be used to query the project
/// and the service account email of the VM, or to detect if the application
/// runs on Google Cloud.
#[derive(Clone, Debug)]
pub struct MetadataClient {
    root: String,
    transport: Arc<dyn HttpTransport>,
}

impl MetadataClient {
    /// Creates a client for `endpoint`, or for the default metadata service
    /// address if `endpoint` is `None`.
    pub fn new(endpoint: Option<String>, transport: Arc<dyn HttpTransport>) -> Self {
        let root = endpoint
            .or_else(|| {
                std::env::var(GCE_METADATA_HOST_ENV_VAR)
                    .ok()
                    .filter(|h| !h.is_empty())
                    .map(|h| format!("http://{h}"))
            })
            .unwrap_or_else(|| METADATA_ROOT.to_string());
        Self {
            root: root.trim_end_matches('/').to_string(),
            transport,
        }
    }

    fn request(&self, path: &str, query: Option<(&str, &str)>) -> Result<Request<Bytes>> {
        let mut url = url::Url::parse(&format!("{}/{path}", self.root)).map_err(|e| {
            CredentialsError::new(false, format!("invalid metadata service URL {}", self.root), e)
        })?;
        if let Some((k, v)) = query {
            url.query_pairs_mut().append_pair(k, v);
        }
        Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(METADATA_FLAVOR, HeaderValue::from_static(METADATA_FLAVOR_VALUE))
            .body(Bytes::new())
            .map_err(|e| CredentialsError::new(false, "cannot create metadata service request", e))
    }

    async fn get(&self, request: Request<Bytes>, what: &str) -> Result<Response<Bytes>> {
        let response = self.transport.execute(request).await.map_err(|e| {
            CredentialsError::transport(e, format!("cannot connect to the metadata service to fetch {what}"))
        })?;
        if response.status() != http::StatusCode::OK {
            return Err(errors::from_http_response(
                &response,
                &format!("the metadata service returned an error fetching {what}"),
            ));
        }
        Ok(response)
    }

    async fn get_text(&self, path: &str, what: &str) -> Result<String> {
        let response = self.get(self.request(path, None)?, what).await?;
        let text = String::from_utf8(response.body().to_vec()).map_err(invalid_response)?;
        Ok(text.trim().to_string())
    }

    pub(crate) async fn token(&self, account: &str, scopes: &[String]) -> Result<TokenExchangeResult> {
        let path = format!("computeMetadata/v1/instance/service-accounts/{account}/token");
        let scopes = scopes.join(",");
        let query = (!scopes.is_empty()).then_some(("scopes", scopes.as_str()));
        let request = with_metrics_header(self.request(&path, query)?, CRED_TYPE);
        let response = self.get(request, "an access token").await?;
        parse_token(response.body())
    }

    /// The project that owns the VM.
    pub async fn project_id(&self) -> Result<String> {
        self.get_text("computeMetadata/v1/project/project-id", "the project id")
            .await
    }

    /// The email of a service account attached to the VM.
    pub async fn email(&self, account: &str) -> Result<String> {
        let path = format!("computeMetadata/v1/instance/service-accounts/{account}/email");
        self.get_text(&path, "the service account email").await
    }

    /// Returns true if the metadata service is reachable.
    ///
    /// The response must carry the `Metadata-Flavor: Google` header. This
    /// rejects, for example, a captive portal answering every request.
    /// Returns an error if the request cannot be sent at all.
    pub async fn ping(&self) -> std::result::Result<bool, TransportError> {
        let request = self.request("", None).map_err(TransportError::other)?;
        let response = self.transport.execute(request).await?;
        Ok(response.status().is_success()
            && response
                .headers()
                .get(METADATA_FLAVOR)
                .is_some_and(|v| v == METADATA_FLAVOR_VALUE))
    }
}

#[derive(serde::Deserialize)]
struct MdsTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

// The metadata service returns a JSON object. Some emulators return just the
// token.
fn parse_token(body: &[u8]) -> Result<TokenExchangeResult> {
    let text = std::str::from_utf8(body).map_err(invalid_response)?.trim();
    if text.starts_with('{') {
        let response =
            serde_json::from_str::<MdsTokenResponse>(text).map_err(invalid_response)?;
        return Ok(TokenExchangeResult {
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            ..TokenExchangeResult::bearer(
                response.access_token,
                response.expires_in.map(Duration::from_secs),
            )
        });
    }
    if text.is_empty() || text.contains(char::is_whitespace) {
        return Err(CredentialsError::from_msg(
            false,
            "the metadata service returned a malformed token",
        ));
    }
    Ok(TokenExchangeResult::bearer(text, None))
}

#[derive(Debug)]
struct MdsTokenProvider {
    client: MetadataClient,
    account: String,
    project_id: OnceCell<String>,
}

#[async_trait::async_trait]
impl TokenProvider for MdsTokenProvider {
    async fn fetch(&self, request: &TokenRequest) -> Result<TokenExchangeResult> {
        self.client.token(&self.account, &request.scopes).await
    }

    async fn project_id(&self) -> Option<String> {
        if let Some(p) = self.project_id.get() {
            return Some(p.clone());
        }
        match self.client.project_id().await {
            Ok(p) => {
                let _ = self.project_id.set(p.clone());
                Some(p)
            }
            Err(e) => {
                tracing::debug!("cannot fetch the project id from the metadata service: {e}");
                None
            }
        }
    }
}

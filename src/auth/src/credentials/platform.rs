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

//! Credentials backed by a platform identity service.
//!
//! Some hosting platforms run a local agent that hands out access tokens for
//! the identity of the workload. The agent's protocol is platform specific, so
//! applications provide an [IdentityService] that talks to it. This module
//! wraps that service in [Credentials], with the same caching and refresh
//! behavior as any other credentials type.

use crate::Result;
use crate::clock::{self, Clock};
use crate::credentials::{Credentials, TokenCredentials};
use crate::token::{TokenExchangeResult, TokenProvider, TokenRequest};
use crate::token_cache::{DEFAULT_REFRESH_MARGIN, TokenCache};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// A token issued by an [IdentityService].
#[derive(Clone, PartialEq)]
pub struct PlatformToken {
    pub token: String,
    /// The absolute expiration time. `None` if the token does not expire.
    pub expires_at: Option<OffsetDateTime>,
}

impl std::fmt::Debug for PlatformToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformToken")
            .field("token", &"[censored]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A local agent that issues tokens for the workload identity.
///
/// Implementations return a [CredentialsError][crate::errors::CredentialsError]
/// on failure. Transient errors are retried on the next request, any other
/// error invalidates the credentials.
#[async_trait::async_trait]
pub trait IdentityService: std::fmt::Debug + Send + Sync {
    /// Returns a token with the given scopes.
    async fn access_token(&self, scopes: &[String]) -> Result<PlatformToken>;

    /// Returns the project that hosts the workload, if known.
    async fn project_id(&self) -> Option<String> {
        None
    }
}

/// Creates [Credentials] backed by an [IdentityService].
#[derive(Debug)]
pub struct Builder {
    service: Arc<dyn IdentityService>,
    scopes: Vec<String>,
    quota_project_id: Option<String>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl Builder {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            service,
            scopes: Vec::new(),
            quota_project_id: None,
            clock: clock::system(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(|s| s.into()).collect();
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

    pub fn build(self) -> Credentials {
        let provider = PlatformTokenProvider {
            service: self.service,
        };
        let cache = TokenCache::new(provider, self.scopes, self.clock)
            .with_refresh_margin(self.refresh_margin);
        Credentials::from(TokenCredentials::new(cache, self.quota_project_id))
    }
}

#[derive(Debug)]
struct PlatformTokenProvider {
    service: Arc<dyn IdentityService>,
}

#[async_trait::async_trait]
impl TokenProvider for PlatformTokenProvider {
    async fn fetch(&self, request: &TokenRequest) -> Result<TokenExchangeResult> {
        let token = self.service.access_token(&request.scopes).await?;
        Ok(TokenExchangeResult {
            expires_at: token.expires_at,
            ..TokenExchangeResult::bearer(token.token, None)
        })
    }

    async fn project_id(&self) -> Option<String> {
        self.service.project_id().await
    }
}

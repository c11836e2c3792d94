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

//! Types and functions to work with auth [Tokens].
//!
//! [Tokens]: https://cloud.google.com/docs/authentication#token

use crate::Result;
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;

/// Represents an auth token.
#[derive(Clone, PartialEq)]
pub struct Token {
    /// The actual token string.
    ///
    /// This is the value used in `Authorization:` header.
    pub token: String,

    /// The type of the token.
    ///
    /// The most common type is `"Bearer"` but other types may appear in the
    /// future.
    pub token_type: String,

    /// The time at which the token expires.
    ///
    /// If `None`, the token does not expire.
    pub expires_at: Option<OffsetDateTime>,

    /// An OpenID Connect ID token, if the token endpoint returned one.
    pub id_token: Option<String>,

    /// Optional metadata associated with the token.
    ///
    /// This might include information like granted scopes or other claims.
    pub metadata: Option<HashMap<String, String>>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("token", &"[censored]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("id_token", &self.id_token.as_ref().map(|_| "[censored]"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// The result of a single token exchange.
///
/// Token providers return this type, the token cache converts it to a
/// [Token] with an absolute expiration time.
#[derive(Clone, PartialEq)]
pub(crate) struct TokenExchangeResult {
    pub access_token: String,
    pub token_type: String,
    /// The token lifetime, as reported by the token endpoint.
    pub expires_in: Option<Duration>,
    /// Some providers report an absolute expiration time instead.
    pub expires_at: Option<OffsetDateTime>,
    pub id_token: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

impl TokenExchangeResult {
    pub(crate) fn bearer<T: Into<String>>(access_token: T, expires_in: Option<Duration>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expires_in,
            expires_at: None,
            id_token: None,
            metadata: None,
        }
    }

    /// Converts the result into a token, computing the expiration relative to
    /// `now`.
    pub(crate) fn into_token(self, now: OffsetDateTime) -> Token {
        let expires_at = self.expires_at.or_else(|| self.expires_in.map(|d| now + d));
        Token {
            token: self.access_token,
            token_type: self.token_type,
            expires_at,
            id_token: self.id_token,
            metadata: self.metadata,
        }
    }
}

impl std::fmt::Debug for TokenExchangeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExchangeResult")
            .field("access_token", &"[censored]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("id_token", &self.id_token.as_ref().map(|_| "[censored]"))
            .finish()
    }
}

/// The inputs for a token exchange.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TokenRequest {
    /// The scopes requested by the credentials.
    pub scopes: Vec<String>,
    /// The current time, as reported by the credentials clock.
    pub now: OffsetDateTime,
}

/// Exchanges long-lived credentials for a short-lived token.
///
/// There is one implementation for each type of credentials. Implementations
/// make a single attempt, the token cache decides if and when to try again.
#[async_trait::async_trait]
pub(crate) trait TokenProvider: std::fmt::Debug + Send + Sync {
    async fn fetch(&self, request: &TokenRequest) -> Result<TokenExchangeResult>;

    /// The project associated with these credentials, if known.
    async fn project_id(&self) -> Option<String> {
        None
    }
}

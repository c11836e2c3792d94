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

//! Helpers shared by the credentials that call an OAuth2 token endpoint.

use crate::Result;
use crate::credentials::invalid_response;
use crate::errors::{self, CredentialsError};
use crate::headers_util::with_metrics_header;
use crate::http::{HttpTransport, form_post};
use crate::token::TokenExchangeResult;
use std::time::Duration;

/// The default Google OAuth2 token endpoint.
pub(crate) const OAUTH2_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// A successful response from a token endpoint.
///
/// See [RFC 6749 section 5.1].
///
/// [RFC 6749 section 5.1]: https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Clone, PartialEq, serde::Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[censored]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("id_token", &self.id_token.as_ref().map(|_| "[censored]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[censored]"),
            )
            .finish()
    }
}

impl TokenResponse {
    pub(crate) fn into_exchange_result(self) -> TokenExchangeResult {
        TokenExchangeResult {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in: self.expires_in.map(Duration::from_secs),
            expires_at: None,
            id_token: self.id_token,
            metadata: None,
        }
    }
}

/// Sends a form-encoded POST to a token endpoint and parses the response.
///
/// Transport errors and error statuses become exchange errors. A successful
/// status with an unparseable body is a permanent error.
pub(crate) async fn exchange<'a, I>(
    transport: &dyn HttpTransport,
    token_uri: &str,
    fields: I,
    cred_type: &str,
) -> Result<TokenResponse>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    exchange_as(transport, token_uri, fields, cred_type).await
}

/// Like [exchange], for endpoints whose successful response is not a
/// [TokenResponse].
pub(crate) async fn exchange_as<'a, I, R>(
    transport: &dyn HttpTransport,
    token_uri: &str,
    fields: I,
    cred_type: &str,
) -> Result<R>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
    R: serde::de::DeserializeOwned,
{
    let request = form_post(token_uri, fields)
        .map_err(|e| CredentialsError::new(false, format!("invalid token URI {token_uri}"), e))?;
    let request = with_metrics_header(request, cred_type);
    let response = transport
        .execute(request)
        .await
        .map_err(|e| CredentialsError::transport(e, "failed to send token request"))?;
    if !response.status().is_success() {
        return Err(errors::from_http_response(
            &response,
            "the token endpoint returned an error",
        ));
    }
    serde_json::from_slice::<R>(response.body()).map_err(invalid_response)
}

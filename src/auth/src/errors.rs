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

//! Errors returned while obtaining or using access tokens.

use crate::http::TransportError;
use bytes::Bytes;
use http::StatusCode;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Represents an error using a [Credentials](crate::credentials::Credentials).
///
/// Problems creating credentials (a badly formatted key file, a missing
/// field) are reported via [crate::build_errors::Error]. This type reports
/// problems *using* the credentials, that is, problems obtaining a token.
///
/// Some of these errors are transient. A transient error leaves the
/// credentials in their prior state, and the application may retry the
/// operation, ideally with [exponential backoff]. Any other error is terminal:
/// the credentials remember the error and return it on every later call,
/// without contacting the token endpoint again.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Clone, Debug)]
pub struct CredentialsError {
    is_transient: bool,
    kind: ErrorKind,
    message: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

#[derive(Clone, Debug)]
enum ErrorKind {
    Other,
    Exchange {
        status: Option<StatusCode>,
        body: Option<String>,
    },
    Revoked,
}

impl CredentialsError {
    /// Creates a new `CredentialsError` wrapping `source`.
    ///
    /// Applications rarely need this function, other than to mock the
    /// behavior of a [CredentialsProvider](crate::credentials::CredentialsProvider)
    /// in their own tests.
    pub fn new<M, T>(is_transient: bool, message: M, source: T) -> Self
    where
        M: Into<String>,
        T: Error + Send + Sync + 'static,
    {
        Self {
            is_transient,
            kind: ErrorKind::Other,
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new `CredentialsError` from a message.
    pub fn from_msg<M: Into<String>>(is_transient: bool, message: M) -> Self {
        Self {
            is_transient,
            kind: ErrorKind::Other,
            message: message.into(),
            source: None,
        }
    }

    /// Returns `true` if a future attempt may succeed.
    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    /// The token exchange failed, either in the transport layer or because the
    /// token endpoint returned an error.
    ///
    /// Use [is_transient][Self::is_transient] to determine if the exchange
    /// may succeed in a future attempt.
    pub fn is_exchange(&self) -> bool {
        matches!(self.kind, ErrorKind::Exchange { .. })
    }

    /// The token endpoint rejected the refresh token as invalid or revoked.
    pub fn is_revoked(&self) -> bool {
        matches!(self.kind, ErrorKind::Revoked)
    }

    /// The HTTP status code returned by the token endpoint, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match &self.kind {
            ErrorKind::Exchange { status, .. } => *status,
            _ => None,
        }
    }

    /// The response body returned by the token endpoint, if any.
    pub fn response_body(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Exchange { body, .. } => body.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn exchange<M: Into<String>>(status: StatusCode, body: &Bytes, message: M) -> Self {
        Self {
            is_transient: is_retryable(status),
            kind: ErrorKind::Exchange {
                status: Some(status),
                body: Some(String::from_utf8_lossy(body).into_owned()),
            },
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn transport<M: Into<String>>(source: TransportError, message: M) -> Self {
        Self {
            is_transient: true,
            kind: ErrorKind::Exchange {
                status: None,
                body: None,
            },
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn revoked<M: Into<String>>(message: M) -> Self {
        Self {
            is_transient: false,
            kind: ErrorKind::Revoked,
            message: message.into(),
            source: None,
        }
    }
}

impl std::error::Error for CredentialsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

const TRANSIENT_MSG: &str = "but future attempts may succeed";
const PERMANENT_MSG: &str = "and future attempts will not succeed";

impl Display for CredentialsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let msg = if self.is_transient {
            TRANSIENT_MSG
        } else {
            PERMANENT_MSG
        };
        write!(f, "{}", self.message)?;
        if let Some(status) = self.status_code() {
            write!(f, " (HTTP status {status})")?;
        }
        write!(f, ", {msg}")
    }
}

/// The error body defined in [RFC 6749 section 5.2].
///
/// [RFC 6749 section 5.2]: https://datatracker.ietf.org/doc/html/rfc6749#section-5.2
#[derive(Clone, Debug, serde::Deserialize)]
pub(crate) struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

pub(crate) fn oauth_error(body: &[u8]) -> Option<OAuthErrorResponse> {
    serde_json::from_slice(body).ok()
}

/// Maps a non-successful response into an exchange error.
pub(crate) fn from_http_response(response: &http::Response<Bytes>, message: &str) -> CredentialsError {
    let body = response.body();
    let detail = oauth_error(body)
        .map(|e| match e.error_description {
            Some(d) => format!("{message}: {}: {d}", e.error),
            None => format!("{message}: {}", e.error),
        })
        .unwrap_or_else(|| message.to_string());
    CredentialsError::exchange(response.status(), body, detail)
}

pub(crate) fn is_retryable(c: StatusCode) -> bool {
    matches!(
        c,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

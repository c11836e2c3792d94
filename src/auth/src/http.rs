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

//! The transport used to contact token endpoints.
//!
//! The credentials in this crate never perform network I/O directly. They
//! build an [http::Request], and hand it to an [HttpTransport]. The default
//! transport is [ReqwestTransport]. Applications may provide their own
//! transport, for example, to route requests through a proxy or to inject
//! faults in tests.
//!
//! Transports do not retry. Transports should enforce timeouts: a request that
//! times out is reported as a [TransportError], which the credentials treat as
//! a transient failure.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, Request, Response};
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Sends a single HTTP request and returns the complete response.
///
/// Implementations must return `Ok` for any response received from the
/// server, regardless of its status code.
#[async_trait::async_trait]
pub trait HttpTransport: std::fmt::Debug + Send + Sync {
    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError>;
}

/// A failure to send the request or to receive the response.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TransportErrorKind {
    Connect,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Connect => "cannot connect to the server",
            Self::Timeout => "the request timed out",
            Self::Other => "the request failed",
        };
        f.write_str(msg)
    }
}

impl TransportError {
    /// The transport could not connect to the server.
    pub fn connect<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: TransportErrorKind::Connect,
            source: source.into(),
        }
    }

    /// The request did not complete before the configured timeout.
    pub fn timeout<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            source: source.into(),
        }
    }

    /// Any other I/O problem.
    pub fn other<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            source: source.into(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.kind == TransportErrorKind::Connect
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }
}

/// An [HttpTransport] implemented with [reqwest].
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    /// Returns a builder to configure the transport.
    pub fn builder() -> Builder {
        Builder::default()
    }
}

/// Configures a [ReqwestTransport].
#[derive(Debug, Default)]
pub struct Builder {
    timeout: Option<Duration>,
}

impl Builder {
    /// Sets the timeout for each request, including reading the response body.
    pub fn with_timeout(mut self, v: Duration) -> Self {
        self.timeout = Some(v);
        self
    }

    pub fn build(self) -> Result<ReqwestTransport, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = self.timeout {
            builder = builder.timeout(t);
        }
        let inner = builder.build().map_err(TransportError::other)?;
        Ok(ReqwestTransport { inner })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let (parts, body) = request.into_parts();
        let response = self
            .inner
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        let mut builder = Response::builder().status(status);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        builder.body(body).map_err(TransportError::other)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::timeout(e)
    } else if e.is_connect() {
        TransportError::connect(e)
    } else {
        TransportError::other(e)
    }
}

/// Returns the default transport.
///
/// Creating a `reqwest::Client` is expensive, all the credentials created by
/// this crate share this transport unless configured otherwise.
pub(crate) fn default_transport() -> Arc<dyn HttpTransport> {
    static DEFAULT: std::sync::OnceLock<Option<Arc<dyn HttpTransport>>> =
        std::sync::OnceLock::new();
    let shared = DEFAULT.get_or_init(|| {
        ReqwestTransport::builder()
            .with_timeout(DEFAULT_TIMEOUT)
            .build()
            .ok()
            .map(|t| Arc::new(t) as Arc<dyn HttpTransport>)
    });
    match shared {
        Some(t) => t.clone(),
        None => Arc::new(UnavailableTransport),
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// Used when the default client cannot be initialized, typically because no
// TLS crypto provider is installed. Every request fails with a transient
// error, so the application may install a provider and retry.
#[derive(Debug)]
struct UnavailableTransport;

#[async_trait::async_trait]
impl HttpTransport for UnavailableTransport {
    async fn execute(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        Err(TransportError::other(
            "cannot initialize the default HTTP client, is a rustls crypto provider installed?",
        ))
    }
}

/// Builds a `application/x-www-form-urlencoded` POST request.
pub(crate) fn form_post<'a, I>(uri: &str, fields: I) -> Result<Request<Bytes>, http::Error>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish();
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        )
        .body(Bytes::from(body))
}

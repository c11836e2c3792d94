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

//! Sources of trusted verification keys.

use super::{Error, Result};
use crate::clock::{self, Clock};
use crate::http::{HttpTransport, default_transport};
use crate::signer::PublicKey;
use bytes::Bytes;
use jsonwebtoken::jwk::JwkSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// The public keys published for Google-issued OAuth2 tokens.
pub const OAUTH2_JWK_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Returns the public keys trusted to verify a token.
///
/// When `key_id` is set, implementations should return the keys matching that
/// identifier. When it is not set, implementations should return all the
/// trusted keys. The decoder tries each key in order.
#[async_trait::async_trait]
pub trait CertsProvider: std::fmt::Debug + Send + Sync {
    async fn get_keys(&self, key_id: Option<&str>) -> Result<Vec<PublicKey>>;
}

/// A fixed collection of trusted keys.
///
/// To rotate keys, include both the old and the new keys, each with its own
/// key identifier.
#[derive(Clone, Debug)]
pub struct StaticCerts {
    keys: Vec<PublicKey>,
}

impl StaticCerts {
    pub fn new<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl CertsProvider for StaticCerts {
    async fn get_keys(&self, key_id: Option<&str>) -> Result<Vec<PublicKey>> {
        Ok(select(&self.keys, key_id))
    }
}

// Keys matching `key_id`. Keys without an identifier match any `key_id`, but
// only if no key matches exactly.
fn select(keys: &[PublicKey], key_id: Option<&str>) -> Vec<PublicKey> {
    let Some(kid) = key_id else {
        return keys.to_vec();
    };
    let exact: Vec<PublicKey> = keys
        .iter()
        .filter(|k| k.key_id() == Some(kid))
        .cloned()
        .collect();
    if !exact.is_empty() {
        return exact;
    }
    keys.iter().filter(|k| k.key_id().is_none()).cloned().collect()
}

/// Downloads the trusted keys from a [JWK Set] endpoint.
///
/// The keys are cached for an hour. The cache is refreshed sooner if a token
/// references an unknown key identifier, which happens after the issuer rotates
/// its keys.
///
/// [JWK Set]: https://datatracker.ietf.org/doc/html/rfc7517#section-5
#[derive(Clone, Debug)]
pub struct JwksCerts {
    url: String,
    ttl: Duration,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    cache: Arc<RwLock<Option<CacheEntry>>>,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    keys: Vec<PublicKey>,
    expires_at: OffsetDateTime,
}

impl JwksCerts {
    pub fn new<V: Into<String>>(url: V) -> Self {
        Self {
            url: url.into(),
            ttl: CACHE_TTL,
            transport: default_transport(),
            clock: clock::system(),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Changes how long the downloaded keys are trusted without refetching.
    pub fn with_ttl(mut self, v: Duration) -> Self {
        self.ttl = v;
        self
    }

    pub fn with_transport(mut self, v: Arc<dyn HttpTransport>) -> Self {
        self.transport = v;
        self
    }

    pub fn with_clock(mut self, v: Arc<dyn Clock>) -> Self {
        self.clock = v;
        self
    }

    fn cached(&self, entry: &Option<CacheEntry>, key_id: Option<&str>) -> Option<Vec<PublicKey>> {
        let entry = entry.as_ref()?;
        if entry.expires_at <= self.clock.now() {
            return None;
        }
        let keys = select(&entry.keys, key_id);
        (!keys.is_empty()).then_some(keys)
    }

    async fn fetch(&self) -> Result<Vec<PublicKey>> {
        tracing::debug!(url = %self.url, "fetching JWK set");
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(&self.url)
            .body(Bytes::new())
            .map_err(Error::certs)?;
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(Error::certs)?;
        if !response.status().is_success() {
            return Err(Error::certs(format!(
                "failed to fetch JWK set from {}, status {}",
                self.url,
                response.status()
            )));
        }
        let set: JwkSet = serde_json::from_slice(response.body()).map_err(Error::certs)?;
        let keys = set
            .keys
            .iter()
            .filter_map(|jwk| match PublicKey::from_jwk(jwk) {
                Ok(k) => Some(k),
                Err(e) => {
                    tracing::debug!("skipping unsupported key {:?}: {e}", jwk.common.key_id);
                    None
                }
            })
            .collect();
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl CertsProvider for JwksCerts {
    async fn get_keys(&self, key_id: Option<&str>) -> Result<Vec<PublicKey>> {
        if let Some(keys) = self.cached(&*self.cache.read().await, key_id) {
            return Ok(keys);
        }
        let mut cache = self.cache.write().await;
        // Another task may have refreshed the cache while we waited.
        if let Some(keys) = self.cached(&cache, key_id) {
            return Ok(keys);
        }
        let keys = self.fetch().await?;
        let selected = select(&keys, key_id);
        *cache = Some(CacheEntry {
            keys,
            expires_at: self.clock.now() + self.ttl,
        });
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::{FakeClock, t0};
    use crate::signer::tests::{ec_public_pem, rsa_jwk, rsa_public_pem};
    use httptest::matchers::request;
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};

    type TestResult = anyhow::Result<()>;

    fn transport() -> Arc<dyn HttpTransport> {
        Arc::new(
            crate::http::ReqwestTransport::builder()
                .build()
                .expect("default transport"),
        )
    }

    #[tokio::test]
    async fn static_certs_select() -> TestResult {
        let certs = StaticCerts::new([
            PublicKey::from_pem(&rsa_public_pem())?.with_key_id("k1"),
            PublicKey::from_pem(&ec_public_pem())?.with_key_id("k2"),
        ]);
        assert_eq!(certs.get_keys(None).await?.len(), 2);

        let got = certs.get_keys(Some("k2")).await?;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key_id(), Some("k2"));

        assert!(certs.get_keys(Some("k3")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn static_certs_without_ids() -> TestResult {
        let certs = StaticCerts::new([PublicKey::from_pem(&rsa_public_pem())?]);
        let got = certs.get_keys(Some("any")).await?;
        assert_eq!(got.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn jwks_cached() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/certs"))
                .times(1)
                .respond_with(json_encoded(serde_json::json!({
                    "keys": [rsa_jwk("test-kid")]
                }))),
        );

        let clock = FakeClock::new(t0());
        let certs = JwksCerts::new(server.url("/certs").to_string())
            .with_transport(transport())
            .with_clock(clock.clone());

        let got = certs.get_keys(Some("test-kid")).await?;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key_id(), Some("test-kid"));

        clock.advance(Duration::from_secs(60));
        let got = certs.get_keys(None).await?;
        assert_eq!(got.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn jwks_refetch_on_expiration() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/certs"))
                .times(2)
                .respond_with(json_encoded(serde_json::json!({
                    "keys": [rsa_jwk("test-kid")]
                }))),
        );

        let clock = FakeClock::new(t0());
        let certs = JwksCerts::new(server.url("/certs").to_string())
            .with_transport(transport())
            .with_clock(clock.clone())
            .with_ttl(Duration::from_secs(300));

        certs.get_keys(Some("test-kid")).await?;
        clock.advance(Duration::from_secs(300));
        certs.get_keys(Some("test-kid")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn jwks_refetch_on_unknown_kid() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/certs"))
                .times(2)
                .respond_with(json_encoded(serde_json::json!({
                    "keys": [rsa_jwk("test-kid")]
                }))),
        );

        let clock = FakeClock::new(t0());
        let certs = JwksCerts::new(server.url("/certs").to_string())
            .with_transport(transport())
            .with_clock(clock.clone());

        certs.get_keys(Some("test-kid")).await?;
        let got = certs.get_keys(Some("rotated-kid")).await?;
        assert!(got.is_empty(), "{got:?}");
        Ok(())
    }

    #[tokio::test]
    async fn jwks_fetch_error() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/certs"))
                .respond_with(status_code(503)),
        );

        let certs = JwksCerts::new(server.url("/certs").to_string()).with_transport(transport());
        let err = certs.get_keys(None).await.unwrap_err();
        assert!(err.is_certs(), "{err:?}");
        assert!(err.to_string().contains("503"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn jwks_bad_json() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/certs"))
                .respond_with(status_code(200).body("not json")),
        );

        let certs = JwksCerts::new(server.url("/certs").to_string()).with_transport(transport());
        let err = certs.get_keys(None).await.unwrap_err();
        assert!(err.is_certs(), "{err:?}");
        Ok(())
    }
}

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

use crate::Result;
use crate::clock::Clock;
use crate::credentials::TokenState;
use crate::errors::CredentialsError;
use crate::token::{Token, TokenProvider, TokenRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Refresh tokens this long before they expire.
pub(crate) const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
enum State {
    Uninitialized,
    Active(Token),
    // A terminal error. The cache never contacts the provider again.
    Invalid(CredentialsError),
}

/// Caches the token returned by a [TokenProvider] and refreshes it as needed.
///
/// Reading the cached token never blocks on a refresh. At most one refresh is
/// in flight at any time, concurrent callers wait for it and share its result.
/// Tokens within the refresh margin are stale: the first caller refreshes
/// them, and other callers keep using the stale token until it expires.
#[derive(Debug)]
pub(crate) struct TokenCache<T>
where
    T: TokenProvider,
{
    state: RwLock<State>,

    // Held while a refresh is in flight.
    refresh_lock: tokio::sync::Mutex<()>,
    // The number of refresh attempts completed so far, and the outcome of the
    // most recent one.
    attempts: AtomicU64,
    last_outcome: RwLock<Option<Result<Token>>>,

    provider: T,
    scopes: Vec<String>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl<T: TokenProvider> TokenCache<T> {
    pub(crate) fn new(provider: T, scopes: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::Uninitialized),
            refresh_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_outcome: RwLock::new(None),
            provider,
            scopes,
            clock,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    pub(crate) fn with_refresh_margin(mut self, v: Duration) -> Self {
        self.refresh_margin = v;
        self
    }

    pub(crate) fn provider(&self) -> &T {
        &self.provider
    }

    fn state(&self) -> State {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_fresh(&self, token: &Token) -> bool {
        match token.expires_at {
            None => true,
            Some(e) => self.clock.now() < e - self.refresh_margin,
        }
    }

    fn is_expired(&self, token: &Token) -> bool {
        token.expires_at.is_some_and(|e| self.clock.now() >= e)
    }

    // Returns the cached token if it can be used, `None` if it needs a
    // refresh, and the terminal error if the cache is invalid.
    fn fresh_token(&self) -> Result<Option<Token>> {
        match self.state() {
            State::Active(t) if self.is_fresh(&t) => Ok(Some(t)),
            State::Invalid(e) => Err(e),
            _ => Ok(None),
        }
    }

    pub(crate) fn valid(&self) -> bool {
        matches!(self.fresh_token(), Ok(Some(_)))
    }

    pub(crate) fn cached_token(&self) -> Option<Token> {
        self.fresh_token().ok().flatten()
    }

    pub(crate) fn token_state(&self) -> TokenState {
        match self.state() {
            State::Uninitialized => TokenState::Uninitialized,
            State::Active(t) if self.is_fresh(&t) => TokenState::Valid,
            State::Active(t) if !self.is_expired(&t) => TokenState::Stale,
            State::Active(_) => TokenState::Expired,
            State::Invalid(_) => TokenState::Invalid,
        }
    }

    /// Returns a usable token, refreshing it if needed.
    pub(crate) async fn token(&self) -> Result<Token> {
        let stale = match self.state() {
            State::Active(t) if self.is_fresh(&t) => return Ok(t),
            State::Active(t) if !self.is_expired(&t) => Some(t),
            State::Invalid(e) => return Err(e),
            _ => None,
        };
        if let Some(stale) = stale {
            return self.refresh_stale(stale).await;
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.fresh_token()? {
            return Ok(token);
        }
        let completed = self.attempts.load(Ordering::Acquire).saturating_sub(seen);
        if completed > 0 {
            match self.last_outcome() {
                Some(Ok(token)) if !self.is_expired(&token) => return Ok(token),
                // One retry per wave of waiters. Somebody already made it.
                Some(Err(e)) if completed >= 2 => return Err(e),
                _ => {}
            }
        }
        self.refresh_locked().await
    }

    // The first caller to see a stale token refreshes it. Everybody else keeps
    // using the stale token until the refresh completes.
    async fn refresh_stale(&self, stale: Token) -> Result<Token> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            return Ok(stale);
        };
        match self.refresh_locked().await {
            Err(e) if e.is_transient() && !self.is_expired(&stale) => Ok(stale),
            result => result,
        }
    }

    /// Forces a new token exchange.
    pub(crate) async fn refresh(&self) -> Result<Token> {
        if let State::Invalid(e) = self.state() {
            return Err(e);
        }
        let seen = self.attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if let State::Invalid(e) = self.state() {
            return Err(e);
        }
        if self.attempts.load(Ordering::Acquire) != seen {
            // Concurrent calls to `refresh()` share a single exchange.
            if let Some(Ok(token)) = self.last_outcome() {
                return Ok(token);
            }
        }
        self.refresh_locked().await
    }

    fn last_outcome(&self) -> Option<Result<Token>> {
        self.last_outcome
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Must be called with `refresh_lock` held. If the returned future is
    // dropped the state is left unchanged.
    async fn refresh_locked(&self) -> Result<Token> {
        let request = TokenRequest {
            scopes: self.scopes.clone(),
            now: self.clock.now(),
        };
        tracing::debug!(provider = ?self.provider, "refreshing token");
        let result = self.provider.fetch(&request).await;
        let now = self.clock.now();
        let result = match result {
            Ok(r) => {
                let token = r.into_token(now);
                tracing::debug!(expires_at = ?token.expires_at, "token refreshed");
                *self.state.write().unwrap_or_else(PoisonError::into_inner) =
                    State::Active(token.clone());
                Ok(token)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("transient error refreshing token: {e}");
                Err(e)
            }
            Err(e) => {
                tracing::warn!("permanent error refreshing token, the credentials are now invalid: {e}");
                *self.state.write().unwrap_or_else(PoisonError::into_inner) =
                    State::Invalid(e.clone());
                Err(e)
            }
        };
        *self
            .last_outcome
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        self.attempts.fetch_add(1, Ordering::AcqRel);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::{FakeClock, t0};
    use crate::token::TokenExchangeResult;
    use crate::token::tests::MockTokenProvider;
    use std::sync::atomic::AtomicUsize;

    type TestResult = anyhow::Result<()>;

    const LIFETIME: Duration = Duration::from_secs(3600);

    fn exchange(token: &str) -> Result<TokenExchangeResult> {
        Ok(TokenExchangeResult::bearer(token, Some(LIFETIME)))
    }

    fn transient() -> CredentialsError {
        CredentialsError::from_msg(true, "try again")
    }

    fn permanent() -> CredentialsError {
        CredentialsError::from_msg(false, "go away")
    }

    fn cache(mock: MockTokenProvider, clock: Arc<FakeClock>) -> TokenCache<MockTokenProvider> {
        TokenCache::new(mock, vec!["scope1".to_string()], clock)
    }

    #[tokio::test]
    async fn initial_token_success() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch()
            .withf(|r| r.scopes == ["scope1"] && r.now == t0())
            .times(1)
            .returning(|_| exchange("AT1"));

        let cache = cache(mock, clock.clone());
        assert_eq!(cache.token_state(), TokenState::Uninitialized);
        assert!(!cache.valid());
        assert!(cache.cached_token().is_none());

        let token = cache.token().await?;
        assert_eq!(token.token, "AT1");
        assert_eq!(token.expires_at, Some(t0() + LIFETIME));
        assert!(cache.valid());
        assert_eq!(cache.token_state(), TokenState::Valid);

        // Verify that we use the cached token instead of making a new request
        // to the mock token provider.
        let token = cache.token().await?;
        assert_eq!(token.token, "AT1");
        assert_eq!(cache.cached_token().map(|t| t.token), Some("AT1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn token_without_expiration_is_always_valid() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch()
            .times(1)
            .returning(|_| Ok(TokenExchangeResult::bearer("AT1", None)));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        clock.advance(Duration::from_secs(100 * 3600));
        assert!(cache.valid());
        assert_eq!(cache.token().await?.token, "AT1");
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_refresh() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT1"));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT2"));

        let cache = cache(mock, clock.clone());
        assert_eq!(cache.token().await?.token, "AT1");

        clock.advance(LIFETIME + Duration::from_secs(1));
        assert!(!cache.valid());
        assert_eq!(cache.token_state(), TokenState::Expired);
        assert!(cache.cached_token().is_none());

        let token = cache.token().await?;
        assert_eq!(token.token, "AT2");
        assert_eq!(
            token.expires_at,
            Some(t0() + LIFETIME + Duration::from_secs(1) + LIFETIME)
        );
        Ok(())
    }

    #[tokio::test]
    async fn refresh_margin() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch().times(2).returning(|_| exchange("AT"));

        let cache = cache(mock, clock.clone()).with_refresh_margin(Duration::from_secs(60));
        cache.token().await?;

        clock.advance(LIFETIME - Duration::from_secs(61));
        assert!(cache.valid());
        clock.advance(Duration::from_secs(1));
        assert!(!cache.valid(), "tokens are stale `refresh_margin` before they expire");
        assert_eq!(cache.token_state(), TokenState::Stale);
        cache.token().await?;
        assert_eq!(cache.token_state(), TokenState::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn stale_token_served_during_refresh() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch().times(1).returning(|_| exchange("AT1"));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        clock.advance(LIFETIME - Duration::from_secs(5));
        assert_eq!(cache.token_state(), TokenState::Stale);

        // Another caller is refreshing, the stale token is still usable.
        let _guard = cache.refresh_lock.lock().await;
        let token = cache.token().await?;
        assert_eq!(token.token, "AT1");
        assert_eq!(cache.token_state(), TokenState::Stale);
        Ok(())
    }

    #[tokio::test]
    async fn stale_token_survives_transient_error() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT1"));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(transient()));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT2"));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        clock.advance(LIFETIME - Duration::from_secs(5));

        assert_eq!(cache.token().await?.token, "AT1");
        assert_eq!(cache.token_state(), TokenState::Stale);
        assert_eq!(cache.token().await?.token, "AT2");
        assert_eq!(cache.token_state(), TokenState::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn stale_token_permanent_error() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT1"));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(permanent()));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        clock.advance(LIFETIME - Duration::from_secs(5));
        let err = cache.token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert_eq!(cache.token_state(), TokenState::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn transient_error_keeps_state() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT1"));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(transient()));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT2"));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        clock.advance(LIFETIME);

        let err = cache.token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        // The old token is not exposed, but the cache is not invalid either.
        assert_eq!(cache.token_state(), TokenState::Expired);
        assert!(cache.cached_token().is_none());

        assert_eq!(cache.token().await?.token, "AT2");
        Ok(())
    }

    #[tokio::test]
    async fn transient_error_on_forced_refresh_keeps_valid_token() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT1"));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(transient()));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        let err = cache.refresh().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(cache.valid());
        assert_eq!(cache.token().await?.token, "AT1");
        Ok(())
    }

    #[tokio::test]
    async fn permanent_error_is_terminal() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch().times(1).returning(|_| Err(permanent()));

        let cache = cache(mock, clock.clone());
        let err = cache.token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert_eq!(cache.token_state(), TokenState::Invalid);
        assert!(!cache.valid());

        // The mock expects a single call, these fail fast.
        for _ in 0..3 {
            let err = cache.token().await.unwrap_err();
            assert!(err.to_string().contains("go away"), "{err}");
            let err = cache.refresh().await.unwrap_err();
            assert!(err.to_string().contains("go away"), "{err}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn permanent_error_after_valid_token() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| exchange("AT1"));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(permanent()));

        let cache = cache(mock, clock.clone());
        cache.token().await?;
        cache.refresh().await.unwrap_err();
        assert_eq!(cache.token_state(), TokenState::Invalid);
        assert!(cache.token().await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_refresh() -> TestResult {
        let clock = FakeClock::new(t0());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            // Give the other tasks a chance to pile up on the refresh lock.
            std::thread::sleep(Duration::from_millis(50));
            exchange("AT1")
        });

        let cache = Arc::new(cache(mock, clock.clone()));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.token().await })
            })
            .collect();
        for task in tasks {
            let token = task.await??;
            assert_eq!(token.token, "AT1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_retry_once() -> TestResult {
        let clock = FakeClock::new(t0());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Err(transient())
        });

        let cache = Arc::new(cache(mock, clock.clone()));
        // Hold the refresh lock so all the callers observe the same stale
        // state before the first attempt starts.
        let guard = cache.refresh_lock.lock().await;
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.token().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(guard);
        for task in tasks {
            let err = task.await?.unwrap_err();
            assert!(err.is_transient(), "{err:?}");
        }
        // The first caller refreshes, one waiter retries, the rest share the
        // error.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.token_state(), TokenState::Uninitialized);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_share_short_lived_tokens() -> TestResult {
        let clock = FakeClock::new(t0());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockTokenProvider::new();
        // The token lifetime is shorter than the refresh margin, the token is
        // never fresh, but each exchange succeeds.
        mock.expect_fetch().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TokenExchangeResult::bearer("AT", Some(Duration::from_secs(5))))
        });

        let cache = Arc::new(cache(mock, clock.clone()));
        let guard = cache.refresh_lock.lock().await;
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.token().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(guard);
        for task in tasks {
            let token = task.await??;
            assert_eq!(token.token, "AT");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_see_success_after_failed_wave() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(transient()));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TokenExchangeResult::bearer("AT", Some(Duration::from_secs(5)))));

        let cache = Arc::new(cache(mock, clock.clone()));
        let guard = cache.refresh_lock.lock().await;
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.token().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(guard);
        let mut errors = 0;
        for task in tasks {
            match task.await? {
                Ok(token) => assert_eq!(token.token, "AT"),
                Err(e) => {
                    assert!(e.to_string().contains("try again"), "{e}");
                    errors += 1;
                }
            }
        }
        // Only the caller that made the failed attempt sees its error.
        assert_eq!(errors, 1);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_refresh_keeps_state() -> TestResult {
        let clock = FakeClock::new(t0());
        let mut mock = MockTokenProvider::new();
        mock.expect_fetch().times(1).returning(|_| exchange("AT1"));

        let cache = cache(mock, clock.clone());
        {
            // Holding the refresh lock makes the call block, dropping the
            // future cancels it.
            let _guard = cache.refresh_lock.lock().await;
            let pending = cache.token();
            let timeout = tokio::time::timeout(Duration::from_millis(10), pending).await;
            assert!(timeout.is_err());
        }
        assert_eq!(cache.token_state(), TokenState::Uninitialized);
        assert_eq!(cache.token().await?.token, "AT1");
        Ok(())
    }
}

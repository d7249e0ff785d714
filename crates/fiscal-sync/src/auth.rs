//! # Authority Token Cache
//!
//! Keeps the bearer credential returned by the authority's auth endpoint and
//! refreshes it shortly before it expires.
//!
//! ## Flow
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │ HttpAuthorityGateway │      │ Authority auth URL   │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            │ token()                     │
//!            │  cached & fresh? ── yes ──► use it
//!            │  no:                        │
//!            │  POST user / pwd ──────────►│
//!            │◄───────────── {body:{token}}│
//!            │  cache for 12h              │
//!            │                             │
//!            │  [401 on a later call]      │
//!            │  invalidate() → next call re-authenticates
//! ```
//!
//! The refresh happens 5 minutes before expiration so a request never leaves
//! with a token that dies in flight.

use chrono::Utc;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::gateway::{AuthorityResult, Credential};

/// Margin before token expiration to trigger refresh (5 minutes).
const REFRESH_MARGIN_SECS: u64 = 300;

/// Lifetime the authority grants a token.
pub const TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// A cached credential with its local expiry.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub expires_at: Instant,
}

impl TokenInfo {
    pub fn from_credential(credential: Credential) -> Self {
        let remaining = (credential.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        TokenInfo {
            token: credential.token,
            expires_at: Instant::now() + remaining,
        }
    }

    /// Expired, or about to.
    pub fn needs_refresh(&self) -> bool {
        Instant::now() + Duration::from_secs(REFRESH_MARGIN_SECS) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .checked_duration_since(Instant::now())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Shared token slot.
#[derive(Debug, Default)]
pub struct TokenCache {
    token: RwLock<Option<TokenInfo>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a usable token, calling `authenticate` only when the cached one
    /// is missing or close to expiry. Concurrent callers share one refresh.
    pub async fn token<F, Fut>(&self, authenticate: F) -> AuthorityResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthorityResult<Credential>>,
    {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.needs_refresh() {
                    debug!(remaining_secs = token.remaining_secs(), "Using cached authority token");
                    return Ok(token.token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.token.clone());
            }
        }

        let fresh = TokenInfo::from_credential(authenticate().await?);
        info!(expires_in_secs = fresh.remaining_secs(), "Authenticated with authority");
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    /// Drops the cached token, e.g. after the authority answered 401.
    pub async fn invalidate(&self) {
        *self.token.write().await = None;
    }

    pub async fn current(&self) -> Option<TokenInfo> {
        self.token.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::AuthorityError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credential(token: &str, ttl: chrono::Duration) -> Credential {
        Credential {
            token: token.to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    #[test]
    fn test_token_refresh_margin() {
        let fresh = TokenInfo::from_credential(credential("a", chrono::Duration::hours(12)));
        assert!(!fresh.needs_refresh());
        assert!(!fresh.is_expired());
        assert!(fresh.remaining_secs() > 11 * 3600);

        let closing = TokenInfo::from_credential(credential("b", chrono::Duration::seconds(120)));
        assert!(closing.needs_refresh());
        assert!(!closing.is_expired());

        let dead = TokenInfo::from_credential(credential("c", chrono::Duration::seconds(-5)));
        assert!(dead.is_expired());
        assert_eq!(dead.remaining_secs(), 0);
    }

    #[tokio::test]
    async fn test_cache_reuses_token() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let token = cache
                .token(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(credential("tok", chrono::Duration::hours(12)))
                })
                .await
                .unwrap();
            assert_eq!(token, "tok");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        assert!(cache.current().await.is_none());
        cache
            .token(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(credential("tok2", chrono::Duration::hours(12)))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_refreshes_near_expiry() {
        let cache = TokenCache::new();
        cache
            .token(|| async { Ok(credential("old", chrono::Duration::seconds(60))) })
            .await
            .unwrap();
        let token = cache
            .token(|| async { Ok(credential("new", chrono::Duration::hours(12))) })
            .await
            .unwrap();
        assert_eq!(token, "new");
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_cached() {
        let cache = TokenCache::new();
        let err = cache
            .token(|| async { Err(AuthorityError::Auth("bad credentials".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::Auth(_)));
        assert!(cache.current().await.is_none());
    }
}

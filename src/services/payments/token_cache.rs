use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::ServiceError;

/// Tokens are refreshed this long before the provider says they expire.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Process-wide bearer token with an expiry guard.
///
/// The lock is held across the fetch, so concurrent callers that find the
/// token stale wait for a single refresh instead of each requesting one.
#[derive(Debug)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
    refresh_margin: Duration,
}

impl TokenCache {
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            refresh_margin,
        }
    }

    /// Returns the cached token, or calls `fetch` for a new one when the
    /// cache is empty or within the refresh margin of expiry. `fetch`
    /// yields the token and its lifetime.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), ServiceError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref() {
            if Instant::now() + self.refresh_margin < token.expires_at {
                return Ok(token.value.clone());
            }
            debug!("cached provider token is close to expiry; refreshing");
        }

        let (value, lifetime) = fetch().await?;
        *slot = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    /// Drops the cached token, e.g. after the provider rejected it.
    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_MARGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn fetch_counted(
        calls: &AtomicUsize,
        lifetime: Duration,
    ) -> Result<(String, Duration), ServiceError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((format!("token-{}", n), lifetime))
    }

    #[tokio::test]
    async fn reuses_token_until_margin() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_refresh(|| fetch_counted(&calls, Duration::from_secs(3600)))
            .await
            .unwrap();
        let second = cache
            .get_or_refresh(|| fetch_counted(&calls, Duration::from_secs(3600)))
            .await
            .unwrap();

        assert_eq!(first, "token-1");
        assert_eq!(second, "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_proactively_inside_margin() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        // Lifetime shorter than the margin: stale as soon as it is stored.
        cache
            .get_or_refresh(|| fetch_counted(&calls, Duration::from_secs(30)))
            .await
            .unwrap();
        let next = cache
            .get_or_refresh(|| fetch_counted(&calls, Duration::from_secs(3600)))
            .await
            .unwrap();

        assert_eq!(next, "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = TokenCache::default();
        let calls = AtomicUsize::new(0);

        cache
            .get_or_refresh(|| fetch_counted(&calls, Duration::from_secs(3600)))
            .await
            .unwrap();
        cache.invalidate().await;
        let next = cache
            .get_or_refresh(|| fetch_counted(&calls, Duration::from_secs(3600)))
            .await
            .unwrap();

        assert_eq!(next, "token-2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache = Arc::new(TokenCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(("shared".to_string(), Duration::from_secs(3600)))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Distributed auto-renewing mutex.
//!
//! A short store-level lease bounds how long a crashed holder can orphan
//! the lock, while a background renewer lets the live holder keep it for an
//! unbounded logical duration. Each acquisition mints a random token, and
//! every extend and release is token-compared server-side, so a stale
//! holder can never touch a lease that has been taken over.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gavel_store::LeaseStore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Options for an [`AutoRenewMutex`].
#[derive(Clone, Copy, Debug)]
pub struct MutexOptions {
    /// The store-level lease duration.
    pub lease: Duration,

    /// Delay between acquisition attempts while the lock is contended.
    pub retry_delay: Duration,

    /// Interval between renewal attempts. `Duration::ZERO` means a third of
    /// the lease, giving two attempts before the lease would lapse.
    pub renew_interval: Duration,

    /// Treat store errors during acquisition as contention instead of
    /// failing the `lock` call.
    pub skip_lock_error: bool,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(8),
            retry_delay: Duration::from_millis(500),
            renew_interval: Duration::ZERO,
            skip_lock_error: false,
        }
    }
}

impl MutexOptions {
    fn effective_renew_interval(&self) -> Duration {
        if self.renew_interval.is_zero() {
            self.lease / 3
        } else {
            self.renew_interval
        }
    }
}

/// A distributed mutex that renews its lease in the background while held.
///
/// `lock` returns a cancellation token that is cancelled when the lease is
/// lost or the mutex is unlocked; callers run the guarded work under that
/// token.
#[derive(Debug)]
pub struct AutoRenewMutex<S>
where
    S: LeaseStore,
{
    store: S,
    key: String,
    options: MutexOptions,
    holder: Mutex<Option<Holder>>,
}

#[derive(Debug)]
struct Holder {
    token: String,
    guard: CancellationToken,
    stop: CancellationToken,
    tracker: TaskTracker,
    renewing: Arc<AtomicBool>,
    expires_at: Arc<Mutex<Instant>>,
}

impl<S> AutoRenewMutex<S>
where
    S: LeaseStore,
{
    /// Creates a mutex over `key` with default options.
    pub fn new(store: S, key: impl Into<String>) -> Self {
        Self::with_options(store, key, MutexOptions::default())
    }

    /// Creates a mutex over `key` with the given options.
    pub fn with_options(store: S, key: impl Into<String>, options: MutexOptions) -> Self {
        Self {
            store,
            key: key.into(),
            options,
            holder: Mutex::new(None),
        }
    }

    /// The lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquires the lock, retrying while it is contended.
    ///
    /// Returns a child of `parent` that is cancelled when the lease is lost
    /// or [`unlock`](Self::unlock) runs. Contention retries after the
    /// configured delay; a store error aborts acquisition unless
    /// `skip_lock_error` demotes it to contention. Cancellation of `parent`
    /// is honoured at every wait point.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when `parent` fires, [`Error::Acquire`] on a
    /// store error without `skip_lock_error`.
    pub async fn lock(&self, parent: &CancellationToken) -> Result<CancellationToken, Error<S::Error>> {
        loop {
            if parent.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let token = uuid::Uuid::new_v4().simple().to_string();
            match self
                .store
                .try_acquire(&self.key, &token, self.options.lease)
                .await
            {
                Ok(true) => {
                    let guard = self.install_holder(parent, token).await;
                    debug!(key = %self.key, "lock acquired");
                    return Ok(guard);
                }
                Ok(false) => {}
                Err(err) if self.options.skip_lock_error => {
                    warn!(key = %self.key, error = %err, "lock attempt failed, retrying");
                }
                Err(err) => return Err(Error::Acquire(err)),
            }

            tokio::select! {
                () = parent.cancelled() => return Err(Error::Cancelled),
                () = sleep(self.options.retry_delay) => {}
            }
        }
    }

    /// Stops the renewer, waits for it, and releases the lease.
    ///
    /// Returns `Ok(true)` when the stored token matched and the lease was
    /// removed. After the first release, [`valid`](Self::valid) is false.
    ///
    /// # Errors
    ///
    /// [`Error::LeaseAlreadyExpired`] when the lock is not held or the
    /// stored token no longer matches; [`Error::Release`] on a store error.
    pub async fn unlock(&self) -> Result<bool, Error<S::Error>> {
        let Some(holder) = self.take_holder() else {
            return Err(Error::LeaseAlreadyExpired);
        };

        holder.stop.cancel();
        holder.tracker.wait().await;
        holder.guard.cancel();

        match self.store.release(&self.key, &holder.token).await {
            Ok(true) => {
                debug!(key = %self.key, "lock released");
                Ok(true)
            }
            Ok(false) => Err(Error::LeaseAlreadyExpired),
            Err(err) => Err(Error::Release(err)),
        }
    }

    /// Whether the lock is currently held: the renewer is alive and the
    /// last-known expiry has not passed.
    #[must_use]
    pub fn valid(&self) -> bool {
        let holder = self.holder.lock().expect("holder lock poisoned");
        holder.as_ref().is_some_and(|h| {
            h.renewing.load(Ordering::Acquire)
                && Instant::now() < *h.expires_at.lock().expect("expiry lock poisoned")
        })
    }

    async fn install_holder(&self, parent: &CancellationToken, token: String) -> CancellationToken {
        // A previous holder may linger after a lost lease; its renewer has
        // already stopped, so only its bookkeeping has to go.
        if let Some(stale) = self.take_holder() {
            stale.stop.cancel();
            stale.tracker.wait().await;
            stale.guard.cancel();
        }

        let guard = parent.child_token();
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let renewing = Arc::new(AtomicBool::new(true));
        let expires_at = Arc::new(Mutex::new(Instant::now() + self.options.lease));

        tracker.spawn(renew_loop(
            self.store.clone(),
            self.key.clone(),
            token.clone(),
            self.options.lease,
            self.options.effective_renew_interval(),
            guard.clone(),
            stop.clone(),
            Arc::clone(&renewing),
            Arc::clone(&expires_at),
        ));
        tracker.close();

        let mut slot = self.holder.lock().expect("holder lock poisoned");
        *slot = Some(Holder {
            token,
            guard: guard.clone(),
            stop,
            tracker,
            renewing,
            expires_at,
        });
        guard
    }

    fn take_holder(&self) -> Option<Holder> {
        self.holder.lock().expect("holder lock poisoned").take()
    }
}

#[allow(clippy::too_many_arguments)]
async fn renew_loop<S>(
    store: S,
    key: String,
    token: String,
    lease: Duration,
    interval: Duration,
    guard: CancellationToken,
    stop: CancellationToken,
    renewing: Arc<AtomicBool>,
    expires_at: Arc<Mutex<Instant>>,
) where
    S: LeaseStore,
{
    loop {
        tokio::select! {
            () = stop.cancelled() => {
                renewing.store(false, Ordering::Release);
                return;
            }
            () = guard.cancelled() => {
                renewing.store(false, Ordering::Release);
                return;
            }
            () = sleep(interval) => {
                match store.extend(&key, &token, lease).await {
                    Ok(true) => {
                        *expires_at.lock().expect("expiry lock poisoned") =
                            Instant::now() + lease;
                    }
                    Ok(false) => {
                        warn!(key = %key, "lease lost, stopping renewal");
                        renewing.store(false, Ordering::Release);
                        guard.cancel();
                        return;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "lease renewal failed, stopping");
                        renewing.store(false, Ordering::Release);
                        guard.cancel();
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU64;

    use async_trait::async_trait;
    use gavel_store::StoreError;
    use gavel_store_memory::MemoryStore;
    use tokio::time::timeout;

    fn quick_options() -> MutexOptions {
        MutexOptions {
            lease: Duration::from_millis(400),
            retry_delay: Duration::from_millis(20),
            renew_interval: Duration::from_millis(100),
            skip_lock_error: false,
        }
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let store = MemoryStore::new();
        let mutex = AutoRenewMutex::with_options(store, "lock:test", quick_options());
        let parent = CancellationToken::new();

        let guard = mutex.lock(&parent).await.unwrap();
        assert!(mutex.valid());
        assert!(!guard.is_cancelled());

        assert!(mutex.unlock().await.unwrap());
        assert!(!mutex.valid());
        assert!(guard.is_cancelled());
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let store = MemoryStore::new();
        let first = AutoRenewMutex::with_options(store.clone(), "lock:excl", quick_options());
        let second = AutoRenewMutex::with_options(store, "lock:excl", quick_options());
        let parent = CancellationToken::new();

        let _guard = first.lock(&parent).await.unwrap();

        // The second holder must still be waiting while the first is valid.
        let contended = timeout(Duration::from_millis(120), second.lock(&parent)).await;
        assert!(contended.is_err());
        assert!(first.valid());
        assert!(!second.valid());

        first.unlock().await.unwrap();
        let _guard2 = timeout(Duration::from_secs(2), second.lock(&parent))
            .await
            .expect("second holder should acquire after release")
            .unwrap();
        assert!(second.valid());
        second.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_after_takeover_leaves_store_untouched() {
        let store = MemoryStore::new();
        // A renewal interval far beyond the lease lets the lease lapse.
        let options = MutexOptions {
            lease: Duration::from_millis(50),
            retry_delay: Duration::from_millis(10),
            renew_interval: Duration::from_secs(30),
            skip_lock_error: false,
        };
        let stale = AutoRenewMutex::with_options(store.clone(), "lock:tk", options);
        let next = AutoRenewMutex::with_options(store, "lock:tk", quick_options());
        let parent = CancellationToken::new();

        stale.lock(&parent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!stale.valid());

        let _guard = next.lock(&parent).await.unwrap();

        let released = stale.unlock().await;
        assert!(matches!(released, Err(Error::LeaseAlreadyExpired)));
        assert!(next.valid(), "takeover lease must be untouched");
        next.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let store = MemoryStore::new();
        let mutex = AutoRenewMutex::with_options(store, "lock:none", quick_options());
        assert!(matches!(
            mutex.unlock().await,
            Err(Error::LeaseAlreadyExpired)
        ));
    }

    #[tokio::test]
    async fn test_lock_honours_parent_cancellation() {
        let store = MemoryStore::new();
        let held = AutoRenewMutex::with_options(store.clone(), "lock:cancel", quick_options());
        let waiting = AutoRenewMutex::with_options(store, "lock:cancel", quick_options());
        let parent = CancellationToken::new();

        let _guard = held.lock(&parent).await.unwrap();

        let waiter_parent = parent.child_token();
        let waiter = tokio::spawn(async move { waiting.lock(&waiter_parent).await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        parent.cancel();

        let got = waiter.await.unwrap();
        assert!(matches!(got, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_hold_beyond_lease_with_renewal() {
        let store = CountingStore::new(MemoryStore::new());
        let options = MutexOptions {
            lease: Duration::from_secs(2),
            retry_delay: Duration::from_millis(100),
            renew_interval: Duration::from_millis(500),
            skip_lock_error: false,
        };
        let mutex = AutoRenewMutex::with_options(store.clone(), "lock:hold", options);
        let parent = CancellationToken::new();

        let guard = mutex.lock(&parent).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(6);
        while Instant::now() < deadline {
            assert!(mutex.valid(), "lock must stay valid while held");
            assert!(!guard.is_cancelled());
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        assert!(store.extends() >= 4, "renewer should have fired repeatedly");
        assert!(mutex.unlock().await.unwrap());
    }

    #[tokio::test]
    async fn test_skip_lock_error_demotes_store_errors() {
        let store = FlakyStore::new(MemoryStore::new(), 2);
        let failing = AutoRenewMutex::with_options(
            store.clone(),
            "lock:flaky",
            MutexOptions {
                skip_lock_error: false,
                ..quick_options()
            },
        );
        let parent = CancellationToken::new();
        assert!(matches!(
            failing.lock(&parent).await,
            Err(Error::Acquire(_))
        ));

        let tolerant = AutoRenewMutex::with_options(
            store,
            "lock:flaky",
            MutexOptions {
                skip_lock_error: true,
                ..quick_options()
            },
        );
        let guard = tolerant.lock(&parent).await.unwrap();
        assert!(!guard.is_cancelled());
        tolerant.unlock().await.unwrap();
    }

    /// Delegating lease store that counts extend calls.
    #[derive(Clone, Debug)]
    struct CountingStore {
        inner: MemoryStore,
        extends: Arc<AtomicU64>,
    }

    impl CountingStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                extends: Arc::new(AtomicU64::new(0)),
            }
        }

        fn extends(&self) -> u64 {
            self.extends.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl LeaseStore for CountingStore {
        type Error = gavel_store_memory::Error;

        async fn try_acquire(
            &self,
            key: &str,
            token: &str,
            ttl: Duration,
        ) -> Result<bool, Self::Error> {
            self.inner.try_acquire(key, token, ttl).await
        }

        async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Self::Error> {
            self.extends.fetch_add(1, Ordering::Relaxed);
            self.inner.extend(key, token, ttl).await
        }

        async fn release(&self, key: &str, token: &str) -> Result<bool, Self::Error> {
            self.inner.release(key, token).await
        }
    }

    #[derive(Debug, thiserror::Error)]
    enum FlakyError {
        #[error("injected store failure")]
        Injected,
    }

    impl StoreError for FlakyError {}

    /// Delegating lease store that fails the first `failures` acquisitions.
    #[derive(Clone, Debug)]
    struct FlakyStore {
        inner: MemoryStore,
        remaining: Arc<AtomicU64>,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, failures: u64) -> Self {
            Self {
                inner,
                remaining: Arc::new(AtomicU64::new(failures)),
            }
        }
    }

    #[async_trait]
    impl LeaseStore for FlakyStore {
        type Error = FlakyError;

        async fn try_acquire(
            &self,
            key: &str,
            token: &str,
            ttl: Duration,
        ) -> Result<bool, Self::Error> {
            if self
                .remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FlakyError::Injected);
            }
            Ok(self.inner.try_acquire(key, token, ttl).await.unwrap())
        }

        async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Self::Error> {
            Ok(self.inner.extend(key, token, ttl).await.unwrap())
        }

        async fn release(&self, key: &str, token: &str) -> Result<bool, Self::Error> {
            Ok(self.inner.release(key, token).await.unwrap())
        }
    }
}

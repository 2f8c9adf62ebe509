//! Lock registry: per-owner mutexes plus the global async-operation lock.
//!
//! The control plane accepts a single in-flight asynchronous operation per
//! account. The async lock models that constraint and must be held only
//! around the mutating call itself, never while polling for completion.
//! Owner locks keep two passes on the same owner from interleaving.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use stratus_id::OwnerId;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ReconcileError, ReconcileResult};
use crate::shutdown::ShutdownSignal;

type AsyncMutex = tokio::sync::Mutex<()>;

/// Which lock a handle holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    Owner(OwnerId),
    AsyncOperation,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Owner(owner) => write!(f, "owner lock '{}'", owner),
            LockScope::AsyncOperation => f.write_str("global asynchronous operation lock"),
        }
    }
}

/// Exclusive ownership of one lock.
///
/// Released on [`LockHandle::release`] or on drop, whichever comes first.
/// Releasing twice is a no-op.
pub struct LockHandle {
    scope: LockScope,
    reason: String,
    acquired_at: Instant,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockHandle {
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            debug!(
                scope = %self.scope,
                reason = %self.reason,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "Released lock"
            );
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("scope", &self.scope)
            .field("reason", &self.reason)
            .field("held", &self.is_held())
            .finish()
    }
}

struct Inner {
    /// Guards only insertion into the map, never held across an await.
    owners: Mutex<HashMap<OwnerId, Arc<AsyncMutex>>>,
    async_operation: Arc<AsyncMutex>,
}

/// Process-wide registry of reconciliation locks.
///
/// Cheap to clone; clones share the same locks. Tests create isolated
/// registries per case.
#[derive(Clone)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                owners: Mutex::new(HashMap::new()),
                async_operation: Arc::new(AsyncMutex::new(())),
            }),
        }
    }

    /// Acquire the lock for `owner`, creating it on first use.
    ///
    /// Waits without a timeout of its own; the caller's deadline bounds it.
    pub async fn acquire_owner_lock(
        &self,
        owner: &OwnerId,
        reason: &str,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<LockHandle> {
        let mutex = self.owner_mutex(owner);
        Self::acquire(LockScope::Owner(owner.clone()), mutex, reason, shutdown).await
    }

    /// Acquire the global asynchronous operation lock.
    pub async fn acquire_async_lock(
        &self,
        reason: &str,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<LockHandle> {
        let mutex = Arc::clone(&self.inner.async_operation);
        Self::acquire(LockScope::AsyncOperation, mutex, reason, shutdown).await
    }

    /// Returns true if some task currently holds the async lock.
    pub fn is_async_locked(&self) -> bool {
        self.inner.async_operation.try_lock().is_err()
    }

    /// Returns true if some task currently holds the lock for `owner`.
    pub fn is_owner_locked(&self, owner: &OwnerId) -> bool {
        let owners = self
            .inner
            .owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        owners
            .get(owner)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Number of owners that have a lock entry.
    pub fn owner_count(&self) -> usize {
        self.inner
            .owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Look up the mutex for `owner`. Creating a new entry first drops idle
    /// entries (referenced only by the map) so owners that leave the
    /// manifest do not accumulate.
    fn owner_mutex(&self, owner: &OwnerId) -> Arc<AsyncMutex> {
        let mut owners = self
            .inner
            .owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mutex) = owners.get(owner) {
            return Arc::clone(mutex);
        }
        owners.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        Arc::clone(owners.entry(owner.clone()).or_default())
    }

    async fn acquire(
        scope: LockScope,
        mutex: Arc<AsyncMutex>,
        reason: &str,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<LockHandle> {
        debug!(scope = %scope, reason, "Acquiring lock");
        let wait_started = Instant::now();

        let guard = tokio::select! {
            guard = mutex.lock_owned() => guard,
            _ = shutdown.cancelled() => {
                return Err(ReconcileError::Cancelled(format!("acquiring {scope} for {reason}")));
            }
        };

        info!(
            scope = %scope,
            reason,
            waited_ms = wait_started.elapsed().as_millis() as u64,
            "Acquired lock"
        );

        Ok(LockHandle {
            scope,
            reason: reason.to_string(),
            acquired_at: Instant::now(),
            guard: Some(guard),
        })
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("owners", &self.owner_count())
            .field("async_locked", &self.is_async_locked())
            .finish()
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn owner(id: &str) -> OwnerId {
        OwnerId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let registry = LockRegistry::new();
        let shutdown = ShutdownSignal::never();

        let mut handle = registry
            .acquire_async_lock("test", &shutdown)
            .await
            .unwrap();
        assert!(registry.is_async_locked());

        handle.release();
        handle.release();
        assert!(!handle.is_held());
        assert!(!registry.is_async_locked());

        // The mutex is still usable after the redundant release.
        let again = registry.acquire_async_lock("again", &shutdown).await.unwrap();
        assert!(again.is_held());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let registry = LockRegistry::new();
        let shutdown = ShutdownSignal::never();
        let srv = owner("srv-1");

        {
            let _handle = registry
                .acquire_owner_lock(&srv, "scoped", &shutdown)
                .await
                .unwrap();
            assert!(registry.is_owner_locked(&srv));
        }

        assert!(!registry.is_owner_locked(&srv));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_owner_is_mutually_exclusive() {
        let registry = LockRegistry::new();
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            tasks.push(tokio::spawn(async move {
                let shutdown = ShutdownSignal::never();
                let _handle = registry
                    .acquire_owner_lock(&owner("srv-1"), &format!("task {i}"), &shutdown)
                    .await
                    .unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        assert_eq!(registry.owner_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_owners_do_not_block() {
        let registry = LockRegistry::new();
        let shutdown = ShutdownSignal::never();

        let _first = registry
            .acquire_owner_lock(&owner("srv-1"), "first", &shutdown)
            .await
            .unwrap();

        let second = tokio::time::timeout(
            Duration::from_millis(1),
            registry.acquire_owner_lock(&owner("srv-2"), "second", &shutdown),
        )
        .await;

        assert!(second.is_ok());
        assert_eq!(registry.owner_count(), 2);
    }

    #[tokio::test]
    async fn test_idle_owner_entries_are_pruned() {
        let registry = LockRegistry::new();
        let shutdown = ShutdownSignal::never();

        let held = registry
            .acquire_owner_lock(&owner("srv-1"), "held", &shutdown)
            .await
            .unwrap();
        registry
            .acquire_owner_lock(&owner("srv-2"), "idle", &shutdown)
            .await
            .unwrap()
            .release();
        assert_eq!(registry.owner_count(), 2);

        let _third = registry
            .acquire_owner_lock(&owner("srv-3"), "third", &shutdown)
            .await
            .unwrap();
        assert_eq!(registry.owner_count(), 2);
        assert!(registry.is_owner_locked(&owner("srv-1")));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_lock_is_cancellable() {
        let registry = LockRegistry::new();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let shutdown = ShutdownSignal::new(rx);

        let _held = registry
            .acquire_async_lock("holder", &shutdown)
            .await
            .unwrap();

        let waiter = {
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.acquire_async_lock("waiter", &shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ReconcileError::Cancelled(_))));
    }
}

//! Single-flight initialization state machine for one cache entry.
//!
//! ```text
//!   Uninitialized ──lock_for_init (winner)──▶ Initializing
//!         ▲                                       │
//!         └────────unlock_init(false)─────────────┤
//!                                                 ▼
//!                              unlock_init(true) Initialized (terminal)
//! ```
//!
//! The state lives in an atomic so the lock attempt is a single CAS. Waiters
//! park on a [`Notify`] that every unlock wakes, whichever way it went.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// Initialization state of one entry generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nobody is populating the entry.
    Uninitialized,
    /// One caller holds the init lock and is loading.
    Initializing,
    /// The payload is published and readable.
    Initialized,
}

impl InitState {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            UNINITIALIZED => Ok(InitState::Uninitialized),
            INITIALIZING => Ok(InitState::Initializing),
            INITIALIZED => Ok(InitState::Initialized),
            other => Err(Error::InvalidCacheState(format!(
                "unknown init state {other}"
            ))),
        }
    }
}

/// Governs who may populate an entry and who has to wait.
#[derive(Debug)]
pub struct InitCoordinator {
    state: AtomicU8,
    waiters: Notify,
}

impl Default for InitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InitCoordinator {
    /// Create a coordinator in the `Uninitialized` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            waiters: Notify::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> Result<InitState> {
        InitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether the entry has been published.
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }

    /// Try to become the initializer.
    ///
    /// Returns `true` to exactly one caller per `Uninitialized` period.
    pub fn lock_for_init(&self) -> bool {
        self.state
            .compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Like [`lock_for_init`](Self::lock_for_init), but returns a guard that
    /// resets the entry to `Uninitialized` if it is dropped without
    /// [`InitGuard::complete`], e.g. when the initializing task is cancelled.
    pub fn try_lock(&self) -> Option<InitGuard<'_>> {
        self.lock_for_init().then(|| InitGuard {
            coordinator: self,
            armed: true,
        })
    }

    /// Release the init lock.
    ///
    /// On success the entry becomes `Initialized`; on failure it goes back to
    /// `Uninitialized` so another caller can retry. Waiters are woken either
    /// way, including when the call itself is invalid.
    pub fn unlock_init(&self, success: bool) -> Result<()> {
        let target = if success { INITIALIZED } else { UNINITIALIZED };
        let outcome = self.state.compare_exchange(
            INITIALIZING,
            target,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.waiters.notify_waiters();

        match outcome {
            Ok(_) => Ok(()),
            Err(actual) => {
                let found = InitState::from_raw(actual)?;
                error!(success, ?found, "unlock_init without a matching lock_for_init");
                Err(Error::InvalidCacheState(format!(
                    "unlock_init({success}) called while {found:?}"
                )))
            }
        }
    }

    /// Wait, at most `timeout`, for another caller's initialization.
    ///
    /// Returns `Ok(true)` if the entry is `Initialized` on return. Returns
    /// `Ok(false)` immediately when nobody is initializing, and after the
    /// timeout or a failed initialization otherwise.
    pub async fn ensure_inited(&self, timeout: Duration) -> Result<bool> {
        // Register before looking at the state so an unlock racing with
        // this check still wakes us.
        let notified = self.waiters.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match self.state()? {
            InitState::Initialized => return Ok(true),
            InitState::Uninitialized => return Ok(false),
            InitState::Initializing => {}
        }

        if tokio::time::timeout(timeout, notified).await.is_err() {
            debug!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for init");
        }

        Ok(self.state()? == InitState::Initialized)
    }
}

/// Init lock held by the winning caller.
#[derive(Debug)]
pub struct InitGuard<'a> {
    coordinator: &'a InitCoordinator,
    armed: bool,
}

impl InitGuard<'_> {
    /// Release the lock with the outcome of the initialization.
    pub fn complete(mut self, success: bool) -> Result<()> {
        self.armed = false;
        self.coordinator.unlock_init(success)
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Init guard dropped before completion, resetting entry");
            let _ = self.coordinator.unlock_init(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_guard_resets_on_drop() {
        let coordinator = InitCoordinator::new();

        let guard = coordinator.try_lock().unwrap();
        assert!(coordinator.try_lock().is_none());
        drop(guard);
        assert_eq!(coordinator.state().unwrap(), InitState::Uninitialized);

        let guard = coordinator.try_lock().unwrap();
        guard.complete(true).unwrap();
        assert!(coordinator.is_initialized());
    }

    #[test]
    fn test_losing_try_lock_leaves_winner_alone() {
        let coordinator = InitCoordinator::new();

        let winner = coordinator.try_lock().unwrap();
        for _ in 0..3 {
            assert!(coordinator.try_lock().is_none());
        }
        assert_eq!(coordinator.state().unwrap(), InitState::Initializing);

        winner.complete(true).unwrap();
        assert!(coordinator.is_initialized());
        assert!(coordinator.try_lock().is_none());
        assert!(coordinator.is_initialized());
    }

    #[test]
    fn test_single_winner() {
        let coordinator = InitCoordinator::new();

        assert!(coordinator.lock_for_init());
        assert!(!coordinator.lock_for_init());
        assert_eq!(coordinator.state().unwrap(), InitState::Initializing);
    }

    #[test]
    fn test_success_transition_is_terminal() {
        let coordinator = InitCoordinator::new();

        assert!(coordinator.lock_for_init());
        coordinator.unlock_init(true).unwrap();
        assert!(coordinator.is_initialized());

        // Initialized cannot be locked again.
        assert!(!coordinator.lock_for_init());
    }

    #[test]
    fn test_failure_resets_to_uninitialized() {
        let coordinator = InitCoordinator::new();

        assert!(coordinator.lock_for_init());
        coordinator.unlock_init(false).unwrap();
        assert_eq!(coordinator.state().unwrap(), InitState::Uninitialized);

        // A later caller can retry.
        assert!(coordinator.lock_for_init());
    }

    #[test]
    fn test_unlock_without_lock_is_invalid() {
        let coordinator = InitCoordinator::new();

        let err = coordinator.unlock_init(true).unwrap_err();
        assert!(err.is_defect());
        assert_eq!(coordinator.state().unwrap(), InitState::Uninitialized);

        assert!(coordinator.lock_for_init());
        coordinator.unlock_init(true).unwrap();
        assert!(coordinator.unlock_init(true).unwrap_err().is_defect());
    }

    #[tokio::test]
    async fn test_ensure_inited_fast_paths() {
        let coordinator = InitCoordinator::new();

        // Nobody initializing: no wait.
        let start = Instant::now();
        assert!(!coordinator.ensure_inited(Duration::from_secs(5)).await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(100));

        coordinator.lock_for_init();
        coordinator.unlock_init(true).unwrap();

        let start = Instant::now();
        assert!(coordinator.ensure_inited(Duration::from_secs(5)).await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_ensure_inited_is_bounded() {
        let coordinator = InitCoordinator::new();
        assert!(coordinator.lock_for_init());

        let start = Instant::now();
        let inited = coordinator
            .ensure_inited(Duration::from_millis(100))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(!inited);
        assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(150), "waited too long: {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_released_on_success() {
        let coordinator = Arc::new(InitCoordinator::new());
        assert!(coordinator.lock_for_init());

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let c = coordinator.clone();
            waiters.push(tokio::spawn(async move {
                c.ensure_inited(Duration::from_secs(5)).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.unlock_init(true).unwrap();

        for waiter in waiters {
            assert!(waiter.await.unwrap().unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_released_on_failure() {
        let coordinator = Arc::new(InitCoordinator::new());
        assert!(coordinator.lock_for_init());

        let c = coordinator.clone();
        let waiter = tokio::spawn(async move {
            let start = Instant::now();
            let inited = c.ensure_inited(Duration::from_secs(5)).await.unwrap();
            (inited, start.elapsed())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.unlock_init(false).unwrap();

        let (inited, elapsed) = waiter.await.unwrap();
        assert!(!inited);
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(coordinator.state().unwrap(), InitState::Uninitialized);
    }
}

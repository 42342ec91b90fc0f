//! Two-tier session locking.
//!
//! Every step takes the per-session lock first and, when the global
//! execution lock is enabled, the process-wide lock second. The order is
//! fixed for every acquisition path. Waiters queue on the tokio mutex
//! rather than failing, so a double-submitted request simply runs after
//! the first one.
//!
//! Lock entries are removed on reset and, optionally, by an idle eviction
//! task so the map does not grow without bound in long-lived processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LockConfig;

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

/// Scoped ownership of one session's step slot.
///
/// Dropping the guard releases the global lock (if held) and then the
/// session lock.
#[derive(Debug)]
pub struct SessionGuard {
    // Field order is drop order: global before session.
    global: Option<OwnedMutexGuard<()>>,
    session: OwnedMutexGuard<()>,
    session_id: String,
}

impl SessionGuard {
    /// Session this guard protects.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the process-wide execution lock is also held.
    #[must_use]
    pub fn holds_global(&self) -> bool {
        self.global.is_some()
    }
}

/// Per-session locks plus an optional global execution lock.
pub struct SessionLockManager {
    entries: Mutex<HashMap<String, LockEntry>>,
    global: Option<Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for SessionLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLockManager")
            .field("sessions", &self.len())
            .field("global", &self.global.is_some())
            .finish()
    }
}

impl SessionLockManager {
    /// Create a manager; `global_execution_lock` adds the process-wide tier.
    #[must_use]
    pub fn new(global_execution_lock: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            global: global_execution_lock.then(|| Arc::new(AsyncMutex::new(()))),
        }
    }

    /// Create a manager from the `[locks]` configuration section.
    #[must_use]
    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.global_execution_lock)
    }

    /// Wait for the session lock, then for the global lock if enabled.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let lock = self.entry(session_id);
        let session = lock.lock_owned().await;
        let global = match &self.global {
            Some(global) => Some(Arc::clone(global).lock_owned().await),
            None => None,
        };
        debug!(session_id, global = global.is_some(), "session lock acquired");
        SessionGuard {
            global,
            session,
            session_id: session_id.to_owned(),
        }
    }

    /// Release `guard` and drop the session's lock entry.
    ///
    /// The entry is only removed while it is still the one the guard locked
    /// and no other request is queued on it; a waiter keeps the entry alive
    /// so that two requests never hold distinct locks for one session.
    pub fn release_and_forget(&self, guard: SessionGuard) {
        let SessionGuard {
            global,
            session,
            session_id,
        } = guard;
        drop(global);
        let lock = Arc::clone(OwnedMutexGuard::mutex(&session));
        let mut entries = self.entries_guard();
        drop(session);
        let removable = entries.get(&session_id).is_some_and(|entry| {
            // One reference in the map, one held locally.
            Arc::ptr_eq(&entry.lock, &lock) && Arc::strong_count(&lock) <= 2
        });
        if removable {
            entries.remove(&session_id);
            debug!(session_id, "session lock entry dropped");
        }
    }

    /// Drop entries unused for at least `ttl` that nobody holds or awaits.
    ///
    /// Returns the number of entries removed.
    #[must_use]
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries_guard();
        let before = entries.len();
        entries.retain(|_, entry| {
            Arc::strong_count(&entry.lock) > 1 || now.duration_since(entry.last_used) < ttl
        });
        before - entries.len()
    }

    /// Number of tracked session entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries_guard().len()
    }

    /// Whether no session entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries_guard().is_empty()
    }

    /// Whether an entry exists for `session_id`.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.entries_guard().contains_key(session_id)
    }

    fn entry(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries_guard();
        let entry = entries
            .entry(session_id.to_owned())
            .or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                last_used: Instant::now(),
            });
        entry.last_used = Instant::now();
        Arc::clone(&entry.lock)
    }

    fn entries_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Spawn the idle lock-entry eviction background task.
///
/// The task sweeps every `ttl / 2` (at least one second) and stops when
/// `cancel` fires.
#[must_use]
pub fn spawn_eviction_task(
    locks: Arc<SessionLockManager>,
    ttl: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (ttl / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("lock eviction task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let removed = locks.evict_idle(ttl);
                    if removed > 0 {
                        debug!(removed, "evicted idle session locks");
                    }
                }
            }
        }
    })
}
